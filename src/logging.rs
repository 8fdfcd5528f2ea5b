//! # Structured Logging Module
//!
//! Environment-aware structured logging for the broker and its execution
//! contexts. Console output by default, JSON lines when configured.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::BrokerConfig;
use crate::constants::env;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging(config: &BrokerConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let layer = if config.log_json {
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A host application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            environment = %environment,
            level = %log_level,
            json = config.log_json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var(env::ENVIRONMENT)
        .or_else(|_| std::env::var(env::FALLBACK_ENVIRONMENT))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for broker lifecycle operations
pub fn log_broker_operation(
    operation: &str,
    task_type: &str,
    instance_id: Option<&str>,
    correlation_id: Option<u64>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_type = %task_type,
        instance_id = instance_id,
        correlation_id = correlation_id,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "BROKER_OPERATION"
    );
}
