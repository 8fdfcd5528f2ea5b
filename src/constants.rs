//! # Broker Constants
//!
//! Protocol identifiers and default values shared by the broker, the
//! execution contexts and the configuration layer.

/// Version stamped on every envelope crossing the isolation boundary
pub const PROTOCOL_VERSION: &str = "1.0";

/// Response status values carried in [`ResponseEnvelope`](crate::execution::ResponseEnvelope)
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
}

/// `ErrorInfo::error_type` values
pub mod error_types {
    pub const HANDLER: &str = "handler";
    pub const INITIALIZATION: &str = "initialization";
}

/// Registration defaults
pub mod defaults {
    pub const MAX_INSTANCES: usize = 1;
    pub const THREAD_NAME_PREFIX: &str = "task-broker";
}

/// Environment variables consulted by configuration and logging
pub mod env {
    pub const CONFIG_PREFIX: &str = "TASK_BROKER";
    pub const CONFIG_FILE: &str = "TASK_BROKER_CONFIG";
    pub const ENVIRONMENT: &str = "TASK_BROKER_ENV";
    pub const FALLBACK_ENVIRONMENT: &str = "APP_ENV";
}
