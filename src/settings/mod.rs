//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables prefixed
//! with `STARFISH_`, using `__` to separate sections from keys. A sample configuration file can be
//! found in the `configs/` directory located in the repository root.

use std::{fmt, net::SocketAddr, path::Path};

use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::relay::DEFAULT_MAX_PAYLOAD_SIZE;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub api: ApiSettings,
    pub log: LoggingSettings,
    #[validate]
    pub registry: RegistrySettings,
    #[validate]
    pub relay: RelaySettings,
    #[serde(default)]
    pub catalog: CatalogSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that a request body can carry the largest payload the relay accepts.
    fn validate_body_size(&self) -> Result<(), ValidationError> {
        if self.api.max_body_size >= body_size_for(self.relay.max_payload_size) {
            Ok(())
        } else {
            Err(ValidationError::new(
                "api max body size is too small for the relay max payload size",
            ))
        }
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("starfish")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
#[validate(schema(function = "validate_api"))]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// STARFISH_API__BIND_ADDRESS=127.0.0.1:8081
    /// ```
    pub bind_address: SocketAddr,

    /// The token every request must present as `Authorization: Bearer <token>`. Requests are
    /// not authenticated if no token is set.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// The maximum size of a request body, in bytes.
    #[serde(default = "default_max_body_size")]
    #[validate(range(min = 1))]
    pub max_body_size: u64,
}

/// A wrapper for validate derive.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_body_size()
}

fn default_max_body_size() -> u64 {
    body_size_for(DEFAULT_MAX_PAYLOAD_SIZE)
}

/// The body size needed for a payload of `payload_size` bytes: the base64 encoded payload plus
/// room for the envelope metadata.
fn body_size_for(payload_size: usize) -> u64 {
    const METADATA: u64 = 64 * 1024;
    (payload_size as u64 + 2) / 3 * 4 + METADATA
}

impl ApiSettings {
    /// Checks API settings.
    fn validate_api(&self) -> Result<(), ValidationError> {
        match &self.auth_token {
            Some(token) if token.trim().is_empty() => {
                Err(ValidationError::new("empty auth token"))
            }
            _ => Ok(()),
        }
    }
}

/// A wrapper for validate derive.
fn validate_api(s: &ApiSettings) -> Result<(), ValidationError> {
    s.validate_api()
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_registry"))]
/// Site liveness settings.
pub struct RegistrySettings {
    /// The number of seconds after which a site that neither polled nor sent a heartbeat is
    /// marked unreachable.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [registry]
    /// staleness_threshold = 300
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// STARFISH_REGISTRY__STALENESS_THRESHOLD=300
    /// ```
    #[validate(range(min = 1, max = 31_536_000))]
    pub staleness_threshold: u64,

    /// The number of seconds between two sweeps.
    #[validate(range(min = 1))]
    pub sweep_interval: u64,
}

impl RegistrySettings {
    /// Checks registry settings.
    fn validate_registry(&self) -> Result<(), ValidationError> {
        if self.sweep_interval <= self.staleness_threshold {
            Ok(())
        } else {
            Err(ValidationError::new(
                "sweep interval exceeds the staleness threshold",
            ))
        }
    }
}

/// A wrapper for validate derive.
fn validate_registry(s: &RegistrySettings) -> Result<(), ValidationError> {
    s.validate_registry()
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
/// Message relay settings.
pub struct RelaySettings {
    /// The maximum size of an envelope payload, in bytes.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [relay]
    /// max_payload_size = 16777216
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// STARFISH_RELAY__MAX_PAYLOAD_SIZE=16777216
    /// ```
    #[validate(range(min = 1))]
    pub max_payload_size: usize,

    /// The number of seconds the envelopes of a finished run are kept for stragglers.
    #[validate(range(max = 31_536_000))]
    pub retention_grace: u64,
}

#[derive(Debug, Default, Deserialize, Clone)]
/// Project catalog settings.
pub struct CatalogSettings {
    /// The model kinds tasks may use. Any kind is accepted if empty.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [catalog]
    /// models = ["LogisticRegression", "LinearRegression", "SVM"]
    /// ```
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// STARFISH_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.18/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.18/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::env;

    use serial_test::serial;

    use super::*;

    const SAMPLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/config.toml");

    fn api() -> ApiSettings {
        ApiSettings {
            bind_address: ([127, 0, 0, 1], 8081).into(),
            auth_token: None,
            max_body_size: default_max_body_size(),
        }
    }

    #[test]
    #[serial]
    fn test_load_sample() {
        let settings = Settings::new(SAMPLE).unwrap();
        assert_eq!(settings.registry.staleness_threshold, 300);
        assert_eq!(settings.relay.retention_grace, 3600);
        assert!(settings.api.auth_token.is_none());
        assert!(settings.catalog.models.contains(&"LogisticRegression".to_string()));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        env::set_var("STARFISH_API__BIND_ADDRESS", "0.0.0.0:9999");
        env::set_var("STARFISH_API__AUTH_TOKEN", "s3cr3t");
        let settings = Settings::new(SAMPLE);
        env::remove_var("STARFISH_API__BIND_ADDRESS");
        env::remove_var("STARFISH_API__AUTH_TOKEN");

        let settings = settings.unwrap();
        assert_eq!(settings.api.bind_address, ([0, 0, 0, 0], 9999).into());
        assert_eq!(settings.api.auth_token.as_deref(), Some("s3cr3t"));
    }

    #[test]
    #[serial]
    fn test_missing_file() {
        assert!(matches!(
            Settings::new("does/not/exist.toml"),
            Err(SettingsError::Loading(_))
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_log_filter() {
        env::set_var("STARFISH_LOG__FILTER", "starfish_router=notalevel");
        let settings = Settings::new(SAMPLE);
        env::remove_var("STARFISH_LOG__FILTER");
        assert!(matches!(settings, Err(SettingsError::Loading(_))));
    }

    #[test]
    fn test_validate_api() {
        assert!(api().validate().is_ok());

        let mut with_token = api();
        with_token.auth_token = Some("token".to_string());
        assert!(with_token.validate().is_ok());

        let mut blank_token = api();
        blank_token.auth_token = Some("  ".to_string());
        assert!(blank_token.validate().is_err());

        let mut no_body = api();
        no_body.max_body_size = 0;
        assert!(no_body.validate().is_err());
    }

    #[test]
    fn test_validate_registry() {
        let registry = RegistrySettings {
            staleness_threshold: 300,
            sweep_interval: 30,
        };
        assert!(registry.validate().is_ok());

        assert!(RegistrySettings {
            staleness_threshold: 0,
            ..registry
        }
        .validate()
        .is_err());
        assert!(RegistrySettings {
            sweep_interval: 0,
            ..registry
        }
        .validate()
        .is_err());
        assert!(RegistrySettings {
            sweep_interval: 600,
            ..registry
        }
        .validate()
        .is_err());
    }

    #[test]
    #[serial]
    fn test_relay_payload_exceeds_body_size() {
        env::set_var("STARFISH_RELAY__MAX_PAYLOAD_SIZE", "33554432");
        let settings = Settings::new(SAMPLE);
        env::remove_var("STARFISH_RELAY__MAX_PAYLOAD_SIZE");
        assert!(matches!(settings, Err(SettingsError::Validation(_))));
    }

    #[test]
    fn test_validate_body_size() {
        let settings = |max_body_size, max_payload_size| Settings {
            api: ApiSettings {
                max_body_size,
                ..api()
            },
            log: LoggingSettings {
                filter: EnvFilter::new("info"),
            },
            registry: RegistrySettings {
                staleness_threshold: 300,
                sweep_interval: 30,
            },
            relay: RelaySettings {
                max_payload_size,
                retention_grace: 0,
            },
            catalog: CatalogSettings::default(),
        };

        assert!(settings(default_max_body_size(), DEFAULT_MAX_PAYLOAD_SIZE)
            .validate()
            .is_ok());
        assert!(settings(default_max_body_size(), 1024).validate().is_ok());
        assert!(settings(default_max_body_size(), 2 * DEFAULT_MAX_PAYLOAD_SIZE)
            .validate()
            .is_err());
        assert!(settings(body_size_for(3000), 3000).validate().is_ok());
        assert!(settings(body_size_for(3000) - 1, 3000).validate().is_err());
    }

    #[test]
    fn test_validate_relay() {
        let relay = RelaySettings {
            max_payload_size: 1024,
            retention_grace: 0,
        };
        assert!(relay.validate().is_ok());
        assert!(RelaySettings {
            max_payload_size: 0,
            ..relay
        }
        .validate()
        .is_err());
    }
}
