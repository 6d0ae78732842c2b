use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use starfish_router::{
    rest,
    services::{sweeper::Sweeper, CoordinationService},
    settings::Settings,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Router")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        log: log_settings,
        registry: registry_settings,
        relay: relay_settings,
        catalog: catalog_settings,
    } = settings;

    FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let service = Arc::new(CoordinationService::new(
        catalog_settings.models,
        relay_settings.max_payload_size,
    ));
    let sweeper = Sweeper::from_settings(service.clone(), &registry_settings, &relay_settings);
    info!(
        staleness_threshold = registry_settings.staleness_threshold,
        retention_grace = relay_settings.retention_grace,
        "router starting"
    );

    tokio::select! {
        _ = sweeper.run() => {
            warn!("shutting down: sweeper terminated");
        }
        result = rest::serve(api_settings, service) => {
            match result {
                Ok(()) => warn!("shutting down: REST server terminated"),
                Err(err) => {
                    eprintln!("{}", err);
                    process::exit(1);
                }
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down: interrupted");
        }
    }
}
