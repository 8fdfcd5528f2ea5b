#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Task Broker
//!
//! Offloads named units of work to a pool of isolated execution contexts and
//! hands the results back to the caller.
//!
//! ## Overview
//!
//! Callers register a task type together with a factory that can create
//! execution contexts for it, then [`dispatch`](WorkerManager::dispatch)
//! payloads by task-type name. The broker lazily creates up to
//! `max_instances` contexts per task type, queues work when they are all
//! busy, retires idle contexts after a configurable timeout and correlates
//! every response back to the caller's [`TaskHandle`].
//!
//! ## Architecture
//!
//! - One broker task owns all bookkeeping (pools, pending requests, idle
//!   timers) and processes events sequentially; there are no locks on pool
//!   state.
//! - Every execution context runs on its own OS thread with a private
//!   [`HandlerRegistry`]. Nothing is shared with the broker or other
//!   contexts; requests and responses cross over channels.
//! - Large binary payloads travel as [`TransferBuffer`]s, which are moved
//!   rather than copied.
//!
//! ## Module Organization
//!
//! - [`execution`] - Broker, instance pools, execution contexts and envelopes
//! - [`tasks`] - Task modules shipped with the broker (`decodeTask`)
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use task_broker::prelude::*;
//!
//! # async fn example() -> task_broker::Result<()> {
//! let manager = WorkerManager::new(BrokerConfig::load()?);
//!
//! manager
//!     .register(
//!         "decodeTask",
//!         ThreadFactory::new(decode_registry),
//!         manager.default_options().with_max_instances(2),
//!     )
//!     .await?;
//!
//! let handle = manager.dispatch("decodeTask", json!({}), Vec::new());
//! match handle.await {
//!     Ok(output) => println!("decoded frame: {}", output.payload),
//!     Err(e) => eprintln!("decode failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod execution;
pub mod logging;
pub mod tasks;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use execution::{
    Completion, ExecutionUnit, FnModule, HandlerRegistry, PoolStats, RegisterOptions, TaskHandle,
    TaskModule, TaskOutput, ThreadFactory, TransferBuffer, TransferList, UnitFactory,
    WorkerManager,
};
pub use logging::init_structured_logging;

/// Common imports for registering and dispatching work
pub mod prelude {
    pub use crate::config::BrokerConfig;
    pub use crate::error::{BrokerError, Result};
    pub use crate::execution::{
        Completion, FnModule, HandlerRegistry, RegisterOptions, TaskHandle, TaskModule,
        TaskOutput, ThreadFactory, TransferBuffer, TransferList, WorkerManager,
    };
    pub use crate::tasks::{decode_registry, DecodeTask};
}
