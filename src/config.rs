//! # Broker Configuration
//!
//! Process-wide defaults for the broker, layered from built-in defaults, an
//! optional configuration file and `TASK_BROKER__*` environment overrides.
//!
//! ```rust,no_run
//! use task_broker::config::BrokerConfig;
//!
//! # fn main() -> Result<(), task_broker::error::BrokerError> {
//! let config = BrokerConfig::load()?;
//! println!("default pool size: {}", config.default_max_instances);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::constants::{defaults, env};
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Pool size used when a registration does not name one
    pub default_max_instances: usize,

    /// Idle timeout used when a registration does not name one (`None` = never)
    pub default_idle_timeout_ms: Option<u64>,

    /// Prefix for execution context thread names
    pub thread_name_prefix: String,

    /// Emit JSON log lines instead of the human console format
    pub log_json: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_max_instances: defaults::MAX_INSTANCES,
            default_idle_timeout_ms: None,
            thread_name_prefix: defaults::THREAD_NAME_PREFIX.to_string(),
            log_json: false,
        }
    }
}

impl BrokerConfig {
    /// Load from the file named by `TASK_BROKER_CONFIG` (if set) plus environment overrides
    pub fn load() -> Result<Self> {
        let file = std::env::var(env::CONFIG_FILE).ok().map(PathBuf::from);
        Self::load_from_file(file.as_deref())
    }

    /// Load from an explicit file (if any) plus environment overrides
    pub fn load_from_file(path: Option<&Path>) -> Result<Self> {
        Self::build(path, Self::environment_source(None))
    }

    fn environment_source(
        overrides: Option<config::Map<String, String>>,
    ) -> config::Environment {
        config::Environment::with_prefix(env::CONFIG_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(overrides)
    }

    fn build(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading broker configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: BrokerConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_max_instances == 0 {
            return Err(BrokerError::Configuration(
                "default_max_instances must be greater than 0".to_string(),
            ));
        }

        if self.thread_name_prefix.trim().is_empty() {
            return Err(BrokerError::Configuration(
                "thread_name_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn default_idle_timeout(&self) -> Option<Duration> {
        self.default_idle_timeout_ms.map(Duration::from_millis)
    }
}
