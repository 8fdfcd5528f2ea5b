//! # Broker Error Taxonomy
//!
//! Every failure a caller can observe surfaces as a [`BrokerError`], either
//! returned directly from a registration call or delivered through a
//! rejected [`TaskHandle`](crate::execution::worker_manager::TaskHandle).

use std::time::Duration;

/// Errors produced by the task broker and its execution contexts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Task type already registered: {task_type} (pass overwrite to replace it)")]
    AlreadyRegistered { task_type: String },

    #[error("Invalid registration options: {reason}")]
    InvalidOptions { reason: String },

    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("Initialization failed for task type {task_type}: {message}")]
    Initialization { task_type: String, message: String },

    #[error("Handler failed: {message}")]
    Handler { message: String },

    #[error("Execution context terminated while request {correlation_id} was pending")]
    Terminated { correlation_id: u64 },

    #[error("Malformed response for request {correlation_id}: {reason}")]
    MalformedResponse { correlation_id: u64, reason: String },

    #[error("Request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: u64,
        timeout: Duration,
    },

    #[error("Failed to spawn execution context for {task_type}: {reason}")]
    Spawn { task_type: String, reason: String },

    #[error("Broker has been shut down")]
    BrokerShutdown,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BrokerError {
    /// Whether a caller may reasonably retry the same dispatch
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Handler { .. }
                | BrokerError::Terminated { .. }
                | BrokerError::Timeout { .. }
                | BrokerError::Spawn { .. }
        )
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(e: config::ConfigError) -> Self {
        BrokerError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
