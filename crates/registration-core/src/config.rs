//! Configuration for the registration core.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Core configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Registration service endpoint configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Per-step timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Feature gates
    #[serde(default)]
    pub features: FeaturesConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the registration service
    #[serde(default = "default_service_url")]
    pub base_url: String,

    /// HTTP request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// How long to wait for the verification-code request (covers the
    /// push-challenge wait; short by design)
    #[serde(with = "humantime_serde", default = "default_verification_timeout")]
    pub verification_request: Duration,

    /// Any other single network step: code confirmation, attribute
    /// submission, key provisioning
    #[serde(with = "humantime_serde", default = "default_network_step_timeout")]
    pub network_step: Duration,

    /// Storage-service restore after registration
    #[serde(with = "humantime_serde", default = "default_restore_timeout")]
    pub storage_restore: Duration,

    /// Initial contact/group sync after registration
    #[serde(with = "humantime_serde", default = "default_restore_timeout")]
    pub initial_sync: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeaturesConfig {
    /// Include the discoverability flag in account attributes
    #[serde(default = "default_true")]
    pub phone_number_discoverability: bool,

    /// Advertise unrestricted unidentified access
    #[serde(default)]
    pub unrestricted_unidentified_access: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_service_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            verification_request: default_verification_timeout(),
            network_step: default_network_step_timeout(),
            storage_restore: default_restore_timeout(),
            initial_sync: default_restore_timeout(),
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            phone_number_discoverability: true,
            unrestricted_unidentified_access: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_service_url() -> String {
    "https://registration-service:8443".into()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_verification_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_network_step_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_restore_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(false),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

/// Initialize tracing for an embedding binary or test harness.
pub fn init_tracing(config: &LogConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
