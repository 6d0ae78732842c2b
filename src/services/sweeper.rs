//! The periodic liveness and retention sweep.
//!
//! The coordination core never times anything out by itself. The sweeper is the outside
//! observer that does: on every tick it asks the [`CoordinationService`] to mark stale sites
//! unreachable and to purge the envelopes of runs that ended long enough ago.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::{CoordinationService, SweepReport};
use crate::settings::{RegistrySettings, RelaySettings};

pub struct Sweeper {
    service: Arc<CoordinationService>,
    period: Duration,
    staleness: chrono::Duration,
    retention: chrono::Duration,
}

impl Sweeper {
    pub fn new(
        service: Arc<CoordinationService>,
        period: Duration,
        staleness: chrono::Duration,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            service,
            period,
            staleness,
            retention,
        }
    }

    pub fn from_settings(
        service: Arc<CoordinationService>,
        registry: &RegistrySettings,
        relay: &RelaySettings,
    ) -> Self {
        Self::new(
            service,
            Duration::from_secs(registry.sweep_interval),
            chrono::Duration::seconds(registry.staleness_threshold as i64),
            chrono::Duration::seconds(relay.retention_grace as i64),
        )
    }

    /// Runs a single sweep.
    pub async fn sweep(&self) -> SweepReport {
        self.service
            .sweep(Utc::now(), self.staleness, self.retention)
            .await
    }

    /// Sweeps forever, once per period.
    pub async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.sweep().await;
            if report.is_empty() {
                debug!("sweep: nothing to do");
            } else {
                info!(
                    unreachable = report.unreachable.len(),
                    purged_runs = report.purged_runs.len(),
                    purged_envelopes = report.purged_envelopes,
                    "sweep done"
                );
            }
        }
    }
}
