//! # Worker Manager
//!
//! Public face of the broker. A [`WorkerManager`] is a cheap, cloneable
//! handle; all bookkeeping (registrations, pools, pending requests, idle
//! timers) lives in a single broker task that processes commands, responses
//! and timer events one at a time, so none of it needs a lock.
//!
//! ```rust,no_run
//! use serde_json::json;
//! use task_broker::prelude::*;
//!
//! # async fn example() -> task_broker::Result<()> {
//! let manager = WorkerManager::new(BrokerConfig::default());
//!
//! manager
//!     .register(
//!         "decodeTask",
//!         ThreadFactory::new(|| HandlerRegistry::new().with("decodeTask", DecodeTask::default())),
//!         RegisterOptions::default().with_max_instances(2),
//!     )
//!     .await?;
//!
//! let frame = vec![0u8; 4];
//! let output = manager
//!     .dispatch(
//!         "decodeTask",
//!         json!({
//!             "transferSyntax": "1.2.840.10008.1.2.1",
//!             "imageFrame": {"rows": 2, "columns": 2, "bitsAllocated": 8}
//!         }),
//!         vec![TransferBuffer::new(frame)],
//!     )
//!     .await?;
//! println!("decoded: {}", output.payload);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::context::{ResponseSink, UnitFactory};
use super::message_protocols::{
    CorrelationId, RequestEnvelope, ResponseEnvelope, TaskOutcome, TaskOutput, TransferList,
};
use super::worker_pool::{IdleExpired, InstancePool, PoolStats, RegisterOptions, RouteOutcome};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::logging::log_broker_operation;

/// Commands accepted by the broker task
enum BrokerCommand {
    Register {
        task_type: String,
        factory: Arc<dyn UnitFactory>,
        options: RegisterOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        task_type: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Dispatch {
        envelope: RequestEnvelope,
        responder: oneshot::Sender<Result<TaskOutput>>,
    },
    Terminate {
        task_type: String,
        reply: oneshot::Sender<Result<()>>,
    },
    TerminateAll {
        reply: oneshot::Sender<()>,
    },
    Stats {
        task_type: String,
        reply: oneshot::Sender<Option<PoolStats>>,
    },
    TaskTypes {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running broker
///
/// Dropping every handle stops the broker and terminates its instances.
#[derive(Clone)]
pub struct WorkerManager {
    commands: mpsc::UnboundedSender<BrokerCommand>,
    next_correlation_id: Arc<AtomicU64>,
    config: Arc<BrokerConfig>,
}

impl WorkerManager {
    /// Start a broker task on the current Tokio runtime
    pub fn new(config: BrokerConfig) -> Self {
        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let broker = BrokerLoop::new(Arc::clone(&config), commands_rx);
        tokio::spawn(broker.run());

        info!(
            default_max_instances = config.default_max_instances,
            thread_name_prefix = %config.thread_name_prefix,
            "Worker manager started"
        );

        Self {
            commands: commands_tx,
            next_correlation_id: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Options seeded from this manager's configured defaults
    pub fn default_options(&self) -> RegisterOptions {
        RegisterOptions::from_config(&self.config)
    }

    /// Register a task type backed by `factory`
    pub async fn register(
        &self,
        task_type: impl Into<String>,
        factory: impl UnitFactory + 'static,
        options: RegisterOptions,
    ) -> Result<()> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(BrokerError::InvalidOptions {
                reason: "task type cannot be empty".to_string(),
            });
        }
        options.validate()?;

        let factory: Arc<dyn UnitFactory> = Arc::new(factory);
        self.request(|reply| BrokerCommand::Register {
            task_type,
            factory,
            options,
            reply,
        })
        .await?
    }

    /// Terminate a task type's instances and forget the registration
    pub async fn unregister(&self, task_type: &str) -> Result<()> {
        let task_type = task_type.to_string();
        self.request(|reply| BrokerCommand::Unregister { task_type, reply })
            .await?
    }

    /// Send work to a task type's pool
    ///
    /// Never blocks: the returned handle resolves when the matching response
    /// arrives. Buffers in `transfer` move into the request.
    pub fn dispatch(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        transfer: TransferList,
    ) -> TaskHandle {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();
        let envelope = RequestEnvelope::new(correlation_id, task_type, payload, transfer);

        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(BrokerCommand::Dispatch { envelope, responder })
        {
            if let BrokerCommand::Dispatch { responder, .. } = command {
                let _ = responder.send(Err(BrokerError::BrokerShutdown));
            }
        }

        TaskHandle {
            correlation_id,
            task_type: task_type.to_string(),
            receiver,
        }
    }

    /// Destroy a task type's instances; pending requests reject with `Terminated`
    pub async fn terminate(&self, task_type: &str) -> Result<()> {
        let task_type = task_type.to_string();
        self.request(|reply| BrokerCommand::Terminate { task_type, reply })
            .await?
    }

    /// Destroy every instance of every task type
    pub async fn terminate_all(&self) -> Result<()> {
        self.request(|reply| BrokerCommand::TerminateAll { reply })
            .await
    }

    pub async fn stats(&self, task_type: &str) -> Result<Option<PoolStats>> {
        let task_type = task_type.to_string();
        self.request(|reply| BrokerCommand::Stats { task_type, reply })
            .await
    }

    pub async fn registered_task_types(&self) -> Result<Vec<String>> {
        self.request(|reply| BrokerCommand::TaskTypes { reply }).await
    }

    /// Terminate everything and stop the broker task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| BrokerCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| BrokerError::BrokerShutdown)?;
        response.await.map_err(|_| BrokerError::BrokerShutdown)
    }
}

/// Caller-visible result of a dispatch
///
/// Resolves exactly once with the handler's output or the error that ended
/// the request.
#[derive(Debug)]
pub struct TaskHandle {
    correlation_id: CorrelationId,
    task_type: String,
    receiver: oneshot::Receiver<Result<TaskOutput>>,
}

impl TaskHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Race the result against a deadline
    ///
    /// On expiry the request stays with its instance; the broker discards the
    /// late response when it arrives.
    pub async fn with_timeout(self, timeout: Duration) -> Result<TaskOutput> {
        let correlation_id = self.correlation_id;
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => {
                debug!(correlation_id, ?timeout, "Caller stopped waiting for response");
                Err(BrokerError::Timeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }
}

impl Future for TaskHandle {
    type Output = Result<TaskOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BrokerError::BrokerShutdown)))
    }
}

/// One in-flight or queued call
struct PendingRequest {
    task_type: String,
    responder: oneshot::Sender<Result<TaskOutput>>,
    enqueued_at: DateTime<Utc>,
}

/// The single task that owns all broker state
struct BrokerLoop {
    config: Arc<BrokerConfig>,
    commands: mpsc::UnboundedReceiver<BrokerCommand>,
    responses_tx: ResponseSink,
    responses: mpsc::UnboundedReceiver<ResponseEnvelope>,
    idle_tx: mpsc::UnboundedSender<IdleExpired>,
    idle_events: mpsc::UnboundedReceiver<IdleExpired>,
    pools: HashMap<String, InstancePool>,
    pending: HashMap<CorrelationId, PendingRequest>,
}

impl BrokerLoop {
    fn new(config: Arc<BrokerConfig>, commands: mpsc::UnboundedReceiver<BrokerCommand>) -> Self {
        let (responses_tx, responses) = mpsc::unbounded_channel();
        let (idle_tx, idle_events) = mpsc::unbounded_channel();
        Self {
            config,
            commands,
            responses_tx,
            responses,
            idle_tx,
            idle_events,
            pools: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(response) = self.responses.recv() => self.handle_response(response),

                command = self.commands.recv() => match command {
                    Some(BrokerCommand::Shutdown { reply }) => {
                        self.terminate_everything();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.terminate_everything();
                        break;
                    }
                },

                Some(expired) = self.idle_events.recv() => self.handle_idle_expired(expired),
            }
        }

        info!(pending = self.pending.len(), "Worker manager stopped");
    }

    fn handle_command(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::Register {
                task_type,
                factory,
                options,
                reply,
            } => {
                let _ = reply.send(self.register(task_type, factory, options));
            }
            BrokerCommand::Unregister { task_type, reply } => {
                let result = match self.pools.remove(&task_type) {
                    Some(mut pool) => {
                        self.reject_terminated(&mut pool);
                        log_broker_operation("unregister", &task_type, None, None, None);
                        Ok(())
                    }
                    None => Err(BrokerError::UnknownTaskType { task_type }),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::Dispatch {
                envelope,
                responder,
            } => self.dispatch(envelope, responder),
            BrokerCommand::Terminate { task_type, reply } => {
                let result = match self.pools.remove(&task_type) {
                    Some(mut pool) => {
                        self.reject_terminated(&mut pool);
                        self.pools.insert(task_type.clone(), pool);
                        log_broker_operation("terminate", &task_type, None, None, None);
                        Ok(())
                    }
                    None => Err(BrokerError::UnknownTaskType { task_type }),
                };
                let _ = reply.send(result);
            }
            BrokerCommand::TerminateAll { reply } => {
                self.terminate_everything();
                let _ = reply.send(());
            }
            BrokerCommand::Stats { task_type, reply } => {
                let _ = reply.send(self.pools.get(&task_type).map(InstancePool::stats));
            }
            BrokerCommand::TaskTypes { reply } => {
                let mut names: Vec<String> = self.pools.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
            BrokerCommand::Shutdown { reply } => {
                // Intercepted by `run`
                let _ = reply.send(());
            }
        }
    }

    fn register(
        &mut self,
        task_type: String,
        factory: Arc<dyn UnitFactory>,
        options: RegisterOptions,
    ) -> Result<()> {
        if let Some(mut existing) = self.pools.remove(&task_type) {
            if !options.overwrite {
                self.pools.insert(task_type.clone(), existing);
                warn!(task_type = %task_type, "Registration rejected: task type already registered");
                return Err(BrokerError::AlreadyRegistered { task_type });
            }

            info!(task_type = %task_type, "Overwriting registration; tearing down previous pool");
            self.reject_terminated(&mut existing);
        }

        let details = format!(
            "max_instances={} idle_termination={:?}",
            options.max_instances, options.auto_termination_on_idle
        );
        let pool = InstancePool::new(
            task_type.clone(),
            factory,
            options,
            self.config.thread_name_prefix.clone(),
            self.responses_tx.clone(),
            self.idle_tx.clone(),
        );
        self.pools.insert(task_type.clone(), pool);
        log_broker_operation("register", &task_type, None, None, Some(&details));

        Ok(())
    }

    fn dispatch(
        &mut self,
        envelope: RequestEnvelope,
        responder: oneshot::Sender<Result<TaskOutput>>,
    ) {
        let correlation_id = envelope.correlation_id;
        let Some(pool) = self.pools.get_mut(&envelope.task_type) else {
            debug!(
                correlation_id,
                task_type = %envelope.task_type,
                "Dispatch to unregistered task type"
            );
            let _ = responder.send(Err(BrokerError::UnknownTaskType {
                task_type: envelope.task_type,
            }));
            return;
        };

        self.pending.insert(
            correlation_id,
            PendingRequest {
                task_type: envelope.task_type.clone(),
                responder,
                enqueued_at: envelope.sent_at,
            },
        );

        let outcome = pool.route(envelope);
        self.settle_route_outcomes(vec![outcome]);
    }

    fn handle_response(&mut self, response: ResponseEnvelope) {
        let correlation_id = response.correlation_id;
        let Some(pending) = self.pending.remove(&correlation_id) else {
            warn!(
                correlation_id,
                "Response for unknown correlation id (terminated or unmatched); ignoring"
            );
            return;
        };

        let (result, retire) = match response.decode() {
            TaskOutcome::Success(output) => (Ok(output), false),
            TaskOutcome::Failure(error) if error.is_initialization() => (
                Err(BrokerError::Initialization {
                    task_type: pending.task_type.clone(),
                    message: error.message,
                }),
                true,
            ),
            TaskOutcome::Failure(error) => (
                Err(BrokerError::Handler {
                    message: error.message,
                }),
                false,
            ),
            TaskOutcome::Malformed { reason } => {
                error!(correlation_id, reason = %reason, "Malformed response");
                (
                    Err(BrokerError::MalformedResponse {
                        correlation_id,
                        reason,
                    }),
                    false,
                )
            }
        };

        let rejected = match self.pools.get_mut(&pending.task_type) {
            Some(pool) => pool.complete(correlation_id, result.is_ok(), retire),
            None => Vec::new(),
        };

        let elapsed_ms = (Utc::now() - pending.enqueued_at).num_milliseconds();
        debug!(
            correlation_id,
            task_type = %pending.task_type,
            elapsed_ms,
            success = result.is_ok(),
            "Request settled"
        );

        if pending.responder.send(result).is_err() {
            debug!(
                correlation_id,
                "Caller no longer waiting (timed out or dropped); late response drained"
            );
        }

        self.settle_route_outcomes(rejected);
    }

    fn handle_idle_expired(&mut self, expired: IdleExpired) {
        if let Some(pool) = self.pools.get_mut(&expired.task_type) {
            if pool.expire(expired.instance_id, expired.epoch) {
                let instance_id = expired.instance_id.to_string();
                log_broker_operation(
                    "idle_terminate",
                    &expired.task_type,
                    Some(&instance_id),
                    None,
                    None,
                );
            }
        }
    }

    fn settle_route_outcomes(&mut self, outcomes: Vec<RouteOutcome>) {
        for outcome in outcomes {
            if let RouteOutcome::Rejected {
                correlation_id,
                error,
            } = outcome
            {
                error!(correlation_id, error = %error, "Request could not be routed");
                if let Some(pending) = self.pending.remove(&correlation_id) {
                    let _ = pending.responder.send(Err(error));
                }
            }
        }
    }

    /// Tear down a pool's instances and reject everything it owned
    fn reject_terminated(&mut self, pool: &mut InstancePool) {
        let work = pool.terminate_all();
        let mut rejected = 0usize;
        for correlation_id in work.correlation_ids() {
            if let Some(pending) = self.pending.remove(&correlation_id) {
                let _ = pending
                    .responder
                    .send(Err(BrokerError::Terminated { correlation_id }));
                rejected += 1;
            }
        }

        info!(
            task_type = %pool.task_type(),
            instances = work.instances,
            rejected,
            "Pool terminated"
        );
    }

    fn terminate_everything(&mut self) {
        let names: Vec<String> = self.pools.keys().cloned().collect();
        for name in names {
            if let Some(mut pool) = self.pools.remove(&name) {
                self.reject_terminated(&mut pool);
                self.pools.insert(name, pool);
            }
        }
    }
}
