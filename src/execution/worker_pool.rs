//! Instance Pool Management for Registered Task Types

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::{ExecutionUnit, ResponseSink, UnitFactory, UnitSpec};
use super::message_protocols::{CorrelationId, RequestEnvelope};
use crate::config::BrokerConfig;
use crate::constants::defaults;
use crate::error::BrokerError;

/// Options recognized by [`WorkerManager::register`](super::worker_manager::WorkerManager::register)
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOptions {
    /// Upper bound on live instances for the task type
    pub max_instances: usize,

    /// Replace an existing registration of the same name
    pub overwrite: bool,

    /// Destroy an instance after it has been idle this long (`None` = never)
    pub auto_termination_on_idle: Option<Duration>,

    /// Configuration handed to each module's `initialize`
    pub init_payload: serde_json::Value,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            max_instances: defaults::MAX_INSTANCES,
            overwrite: false,
            auto_termination_on_idle: None,
            init_payload: serde_json::Value::Null,
        }
    }
}

impl RegisterOptions {
    /// Options seeded from the broker-wide defaults
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_instances: config.default_max_instances,
            auto_termination_on_idle: config.default_idle_timeout(),
            ..Self::default()
        }
    }

    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_idle_termination(mut self, idle: Duration) -> Self {
        self.auto_termination_on_idle = Some(idle);
        self
    }

    pub fn with_init_payload(mut self, init_payload: serde_json::Value) -> Self {
        self.init_payload = init_payload;
        self
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.max_instances == 0 {
            return Err(BrokerError::InvalidOptions {
                reason: "max_instances must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Notification that an instance's idle timer elapsed
#[derive(Debug, Clone)]
pub struct IdleExpired {
    pub task_type: String,
    pub instance_id: Uuid,
    pub epoch: u64,
}

/// One live execution context inside a pool
struct InstanceSlot {
    instance_id: Uuid,
    unit: Box<dyn ExecutionUnit>,
    /// Request currently running on this instance; `Some` means busy
    current: Option<CorrelationId>,
    idle_timer: Option<AbortHandle>,
    /// Bumped on every busy/idle transition so a stale timer can be recognized
    epoch: u64,
}

impl InstanceSlot {
    fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn destroy(&mut self) {
        self.cancel_idle_timer();
        self.unit.terminate();
    }
}

/// A request parked until an instance frees up
struct QueuedRequest {
    envelope: RequestEnvelope,
    enqueued_at: DateTime<Utc>,
}

/// Where [`InstancePool::route`] sent a request
#[derive(Debug)]
pub enum RouteOutcome {
    Started { instance_id: Uuid },
    Queued { depth: usize },
    Rejected {
        correlation_id: CorrelationId,
        error: BrokerError,
    },
}

/// Everything torn out of a pool by [`InstancePool::terminate_all`]
#[derive(Debug, Default)]
pub struct TerminatedWork {
    pub instances: usize,
    pub in_flight: Vec<CorrelationId>,
    pub queued: Vec<CorrelationId>,
}

impl TerminatedWork {
    pub fn correlation_ids(&self) -> impl Iterator<Item = CorrelationId> + '_ {
        self.in_flight.iter().chain(self.queued.iter()).copied()
    }
}

/// Pool of execution contexts for one registered task type
///
/// Instances are kept in creation order; selection always picks the first
/// idle one. When every instance is busy and the pool is at capacity,
/// requests wait in FIFO order.
pub struct InstancePool {
    task_type: String,
    options: RegisterOptions,
    factory: Arc<dyn UnitFactory>,
    thread_name_prefix: String,
    outbox: ResponseSink,
    idle_events: mpsc::UnboundedSender<IdleExpired>,
    instances: Vec<InstanceSlot>,
    queue: VecDeque<QueuedRequest>,
    next_ordinal: u64,
    spawned_total: u64,
    completed_total: u64,
    failed_total: u64,
}

impl InstancePool {
    pub fn new(
        task_type: String,
        factory: Arc<dyn UnitFactory>,
        options: RegisterOptions,
        thread_name_prefix: String,
        outbox: ResponseSink,
        idle_events: mpsc::UnboundedSender<IdleExpired>,
    ) -> Self {
        Self {
            task_type,
            options,
            factory,
            thread_name_prefix,
            outbox,
            idle_events,
            instances: Vec::new(),
            queue: VecDeque::new(),
            next_ordinal: 1,
            spawned_total: 0,
            completed_total: 0,
            failed_total: 0,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn busy_count(&self) -> usize {
        self.instances.iter().filter(|slot| slot.is_busy()).count()
    }

    /// Send a request to the first idle instance, a new instance, or the queue
    pub fn route(&mut self, envelope: RequestEnvelope) -> RouteOutcome {
        let mut envelope = envelope;

        // Idle instances whose unit has died are dropped and the next one tried
        while let Some(index) = self.first_idle() {
            match self.assign(index, envelope) {
                Ok(instance_id) => return RouteOutcome::Started { instance_id },
                Err(returned) => envelope = returned,
            }
        }

        if self.instances.len() < self.options.max_instances {
            let correlation_id = envelope.correlation_id;
            let index = match self.spawn_instance() {
                Ok(index) => index,
                Err(error) => {
                    return RouteOutcome::Rejected {
                        correlation_id,
                        error,
                    }
                }
            };

            return match self.assign(index, envelope) {
                Ok(instance_id) => RouteOutcome::Started { instance_id },
                Err(_) => RouteOutcome::Rejected {
                    correlation_id,
                    error: BrokerError::Spawn {
                        task_type: self.task_type.clone(),
                        reason: "new execution context refused its first request".to_string(),
                    },
                },
            };
        }

        self.queue.push_back(QueuedRequest {
            envelope,
            enqueued_at: Utc::now(),
        });
        debug!(
            task_type = %self.task_type,
            depth = self.queue.len(),
            "All instances busy, request queued"
        );
        RouteOutcome::Queued {
            depth: self.queue.len(),
        }
    }

    /// Mark the instance running `correlation_id` as finished
    ///
    /// Hands the head of the queue straight to the freed instance when there
    /// is one, otherwise arms its idle timer. Returns requests that could not
    /// be placed. `retire` destroys the instance instead of reusing it.
    pub fn complete(
        &mut self,
        correlation_id: CorrelationId,
        succeeded: bool,
        retire: bool,
    ) -> Vec<RouteOutcome> {
        if succeeded {
            self.completed_total += 1;
        } else {
            self.failed_total += 1;
        }

        let Some(index) = self
            .instances
            .iter()
            .position(|slot| slot.current == Some(correlation_id))
        else {
            warn!(
                task_type = %self.task_type,
                correlation_id,
                "Completion for a request no instance is running"
            );
            return Vec::new();
        };

        let slot = &mut self.instances[index];
        slot.current = None;
        slot.epoch += 1;

        if retire {
            let mut slot = self.instances.remove(index);
            warn!(
                task_type = %self.task_type,
                instance_id = %slot.instance_id,
                "Retiring execution context after initialization failure"
            );
            slot.destroy();
            return self.drain_queue();
        }

        if let Some(queued) = self.queue.pop_front() {
            let waited_ms = (Utc::now() - queued.enqueued_at).num_milliseconds();
            debug!(
                task_type = %self.task_type,
                correlation_id = queued.envelope.correlation_id,
                waited_ms,
                "Handing queued request to freed instance"
            );
            return match self.assign(index, queued.envelope) {
                Ok(_) => Vec::new(),
                Err(returned) => {
                    self.queue.push_front(QueuedRequest {
                        envelope: returned,
                        enqueued_at: queued.enqueued_at,
                    });
                    self.drain_queue()
                }
            };
        }

        self.arm_idle_timer(index);
        Vec::new()
    }

    /// Destroy an idle instance whose timer fired, unless it has been reused since
    pub fn expire(&mut self, instance_id: Uuid, epoch: u64) -> bool {
        let Some(index) = self
            .instances
            .iter()
            .position(|slot| slot.instance_id == instance_id)
        else {
            return false;
        };

        let slot = &self.instances[index];
        if slot.is_busy() || slot.epoch != epoch {
            debug!(
                task_type = %self.task_type,
                instance_id = %instance_id,
                "Ignoring stale idle timer"
            );
            return false;
        }

        let mut slot = self.instances.remove(index);
        slot.idle_timer = None;
        slot.destroy();
        info!(
            task_type = %self.task_type,
            instance_id = %instance_id,
            remaining = self.instances.len(),
            "Idle execution context terminated"
        );
        true
    }

    /// Destroy every instance and empty the queue
    pub fn terminate_all(&mut self) -> TerminatedWork {
        let mut work = TerminatedWork {
            instances: self.instances.len(),
            ..TerminatedWork::default()
        };

        for mut slot in self.instances.drain(..) {
            if let Some(correlation_id) = slot.current {
                work.in_flight.push(correlation_id);
            }
            slot.destroy();
        }

        work.queued = self
            .queue
            .drain(..)
            .map(|queued| queued.envelope.correlation_id)
            .collect();

        work
    }

    pub fn stats(&self) -> PoolStats {
        let busy = self.busy_count();
        PoolStats {
            task_type: self.task_type.clone(),
            max_instances: self.options.max_instances,
            instances: self.instances.len(),
            busy,
            idle: self.instances.len() - busy,
            queued: self.queue.len(),
            spawned_total: self.spawned_total,
            completed_total: self.completed_total,
            failed_total: self.failed_total,
            instance_ids: self.instances.iter().map(|slot| slot.instance_id).collect(),
        }
    }

    fn first_idle(&self) -> Option<usize> {
        self.instances.iter().position(|slot| !slot.is_busy())
    }

    fn spawn_instance(&mut self) -> Result<usize, BrokerError> {
        let spec = UnitSpec {
            task_type: self.task_type.clone(),
            instance_id: Uuid::new_v4(),
            ordinal: self.next_ordinal,
            thread_name_prefix: self.thread_name_prefix.clone(),
            init_payload: self.options.init_payload.clone(),
        };
        let instance_id = spec.instance_id;

        let unit = self.factory.spawn(spec, self.outbox.clone())?;
        self.next_ordinal += 1;
        self.spawned_total += 1;

        self.instances.push(InstanceSlot {
            instance_id,
            unit,
            current: None,
            idle_timer: None,
            epoch: 0,
        });

        info!(
            task_type = %self.task_type,
            instance_id = %instance_id,
            instances = self.instances.len(),
            max_instances = self.options.max_instances,
            "Execution context spawned"
        );

        Ok(self.instances.len() - 1)
    }

    /// Post to an idle instance; a unit that refuses is removed and the envelope handed back
    fn assign(&mut self, index: usize, envelope: RequestEnvelope) -> Result<Uuid, RequestEnvelope> {
        let correlation_id = envelope.correlation_id;
        let slot = &mut self.instances[index];
        slot.cancel_idle_timer();

        match slot.unit.post(envelope) {
            Ok(()) => {
                slot.current = Some(correlation_id);
                slot.epoch += 1;
                debug!(
                    task_type = %self.task_type,
                    instance_id = %slot.instance_id,
                    correlation_id,
                    "Request dispatched"
                );
                Ok(slot.instance_id)
            }
            Err(returned) => {
                let mut slot = self.instances.remove(index);
                warn!(
                    task_type = %self.task_type,
                    instance_id = %slot.instance_id,
                    "Execution context refused request; removing it from the pool"
                );
                slot.destroy();
                Err(returned)
            }
        }
    }

    /// Route queued requests while any instance is idle or capacity remains
    fn drain_queue(&mut self) -> Vec<RouteOutcome> {
        let mut rejected = Vec::new();

        while !self.queue.is_empty()
            && (self.first_idle().is_some() || self.instances.len() < self.options.max_instances)
        {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            match self.route(queued.envelope) {
                outcome @ RouteOutcome::Rejected { .. } => rejected.push(outcome),
                RouteOutcome::Started { .. } | RouteOutcome::Queued { .. } => {}
            }
        }

        rejected
    }

    fn arm_idle_timer(&mut self, index: usize) {
        let Some(idle) = self.options.auto_termination_on_idle else {
            return;
        };

        let slot = &mut self.instances[index];
        slot.cancel_idle_timer();

        let event = IdleExpired {
            task_type: self.task_type.clone(),
            instance_id: slot.instance_id,
            epoch: slot.epoch,
        };
        let idle_events = self.idle_events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let _ = idle_events.send(event);
        });
        slot.idle_timer = Some(timer.abort_handle());
    }
}

/// Snapshot of a pool's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub task_type: String,
    pub max_instances: usize,
    pub instances: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    pub spawned_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    /// Live instance ids in creation order
    pub instance_ids: Vec<Uuid>,
}
