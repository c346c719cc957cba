//! Bus configuration.
//!
//! Supports YAML file and environment variable overrides.

use std::time::Duration;

use serde::Deserialize;

use crate::connection::{ConnectOptions, DEFAULT_MAX_RECONNECT, DEFAULT_RECONNECT_WAIT};
use crate::delivery::{SubscribeOptions, DEFAULT_HANDLER_TIMEOUT};
use crate::error::{BusError, Result};
use crate::propagation::TraceFormat;
use crate::topology::ConsumerSpec;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "jetbus";

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "JETBUS_CONFIG";

/// Prefix of environment variable overrides (`JETBUS__URL`, `JETBUS__IS_LOCAL`).
pub const CONFIG_ENV_PREFIX: &str = "JETBUS";

/// Connection and delivery settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// NATS server URL.
    pub url: String,
    pub user: String,
    pub password: String,
    /// Client name; also labels connection metrics.
    pub name: String,
    /// Single-node development deployment.
    pub is_local: bool,
    pub max_reconnect: usize,
    pub reconnect_wait_secs: u64,
    /// Trace representation embedded in published envelopes.
    pub trace_format: TraceFormat,
    /// Upper bound for one message handler invocation.
    pub handler_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            user: String::new(),
            password: String::new(),
            name: String::new(),
            is_local: false,
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_wait_secs: DEFAULT_RECONNECT_WAIT.as_secs(),
            trace_format: TraceFormat::default(),
            handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT.as_secs(),
        }
    }
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `jetbus.yaml` in the working directory (optional)
    /// 2. `path`, if given
    /// 3. The file named by `JETBUS_CONFIG`, if set
    /// 4. `JETBUS__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BusError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| BusError::Config(e.to_string()))
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// Subscription options for `consumer` carrying the configured handler timeout.
    pub fn subscribe_options(&self, consumer: ConsumerSpec) -> SubscribeOptions {
        SubscribeOptions::new(consumer).with_handler_timeout(self.handler_timeout())
    }
}

impl TryFrom<&BusConfig> for ConnectOptions {
    type Error = BusError;

    fn try_from(config: &BusConfig) -> Result<Self> {
        let options = ConnectOptions::new(&config.url, &config.user, &config.password)
            .with_local(config.is_local)
            .with_name(&config.name)
            .with_reconnect(
                config.max_reconnect,
                Duration::from_secs(config.reconnect_wait_secs),
            );
        options.validate()?;
        Ok(options)
    }
}
