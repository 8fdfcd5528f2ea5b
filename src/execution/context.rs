//! # Execution Contexts
//!
//! An execution context is one isolated worker dedicated to a task type. The
//! broker only ever talks to it through an [`ExecutionUnit`]: requests go in
//! via [`ExecutionUnit::post`], responses come back on the shared
//! [`ResponseSink`]. The stock implementation, [`ThreadUnit`], runs an
//! [`ExecutionContext`] loop on its own OS thread with a private
//! [`HandlerRegistry`] built by the registration's factory closure.

use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::handler::{Completion, HandlerRegistry};
use super::message_protocols::{RequestEnvelope, ResponseEnvelope};
use crate::error::{BrokerError, Result};

/// Channel on which every execution context reports back to the broker
pub type ResponseSink = mpsc::UnboundedSender<ResponseEnvelope>;

/// Everything a factory needs to bring up one instance
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub task_type: String,
    pub instance_id: Uuid,
    /// Creation order within the pool, starting at 1
    pub ordinal: u64,
    pub thread_name_prefix: String,
    /// Handed to each module's `initialize`
    pub init_payload: serde_json::Value,
}

impl UnitSpec {
    pub fn thread_name(&self) -> String {
        format!("{}-{}-{}", self.thread_name_prefix, self.task_type, self.ordinal)
    }
}

/// Broker-side handle to an isolated execution unit
pub trait ExecutionUnit: Send {
    /// Hand a request to the unit, returning it if the unit can no longer accept work
    fn post(&mut self, request: RequestEnvelope) -> std::result::Result<(), RequestEnvelope>;

    /// Stop accepting work; in-flight work is abandoned
    fn terminate(&mut self);
}

/// Produces new execution units for a registered task type
pub trait UnitFactory: Send + Sync {
    fn spawn(&self, spec: UnitSpec, outbox: ResponseSink) -> Result<Box<dyn ExecutionUnit>>;
}

/// Factory that runs each instance on a dedicated OS thread
///
/// The builder closure is invoked on the new thread, so the registry it
/// returns (and every module inside it) is owned by that thread alone.
pub struct ThreadFactory<F> {
    builder: Arc<F>,
}

impl<F> ThreadFactory<F>
where
    F: Fn() -> HandlerRegistry + Send + Sync + 'static,
{
    pub fn new(builder: F) -> Self {
        Self {
            builder: Arc::new(builder),
        }
    }
}

impl<F> UnitFactory for ThreadFactory<F>
where
    F: Fn() -> HandlerRegistry + Send + Sync + 'static,
{
    fn spawn(&self, spec: UnitSpec, outbox: ResponseSink) -> Result<Box<dyn ExecutionUnit>> {
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let builder = Arc::clone(&self.builder);
        let instance_id = spec.instance_id;
        let task_type = spec.task_type.clone();

        let handle = std::thread::Builder::new()
            .name(spec.thread_name())
            .spawn(move || {
                let registry = builder();
                ExecutionContext::new(spec, registry, outbox).run(inbox_rx);
            })
            .map_err(|e| BrokerError::Spawn {
                task_type,
                reason: e.to_string(),
            })?;

        Ok(Box::new(ThreadUnit {
            instance_id,
            inbox: Some(inbox_tx),
            handle: Some(handle),
        }))
    }
}

/// Thread-backed [`ExecutionUnit`]
pub struct ThreadUnit {
    instance_id: Uuid,
    inbox: Option<Sender<RequestEnvelope>>,
    handle: Option<JoinHandle<()>>,
}

impl ExecutionUnit for ThreadUnit {
    fn post(&mut self, request: RequestEnvelope) -> std::result::Result<(), RequestEnvelope> {
        match &self.inbox {
            Some(inbox) => inbox.send(request).map_err(|e| e.into_inner()),
            None => Err(request),
        }
    }

    fn terminate(&mut self) {
        // Closing the inbox ends the loop once the current handler returns;
        // the thread is detached rather than joined so the broker never blocks.
        if self.inbox.take().is_some() {
            debug!(instance_id = %self.instance_id, "Execution context inbox closed");
        }
        self.handle.take();
    }
}

impl Drop for ThreadUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// The loop running inside an isolated execution context
pub struct ExecutionContext {
    spec: UnitSpec,
    registry: HandlerRegistry,
    outbox: ResponseSink,
    processed: u64,
}

impl ExecutionContext {
    pub fn new(spec: UnitSpec, registry: HandlerRegistry, outbox: ResponseSink) -> Self {
        Self {
            spec,
            registry,
            outbox,
            processed: 0,
        }
    }

    /// Process requests in arrival order until the inbox closes
    pub fn run(mut self, inbox: Receiver<RequestEnvelope>) {
        info!(
            task_type = %self.spec.task_type,
            instance_id = %self.spec.instance_id,
            modules = ?self.registry.task_types(),
            "Execution context started"
        );

        while let Ok(request) = inbox.recv() {
            self.process(request);
        }

        info!(
            task_type = %self.spec.task_type,
            instance_id = %self.spec.instance_id,
            processed = self.processed,
            "Execution context stopped"
        );
    }

    fn process(&mut self, request: RequestEnvelope) {
        debug!(
            correlation_id = request.correlation_id,
            task_type = %request.task_type,
            buffers = request.transfer.len(),
            "Processing request"
        );

        let completion = Completion::new(
            request.correlation_id,
            request.task_type.clone(),
            self.outbox.clone(),
        );
        self.registry
            .dispatch(request, &self.spec.init_payload, completion);
        self.processed += 1;
    }
}
