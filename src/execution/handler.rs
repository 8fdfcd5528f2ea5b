//! # Task Handler Modules
//!
//! The contract a unit of offloaded work implements ([`TaskModule`]), the
//! one-shot [`Completion`] it reports through, and the per-instance
//! [`HandlerRegistry`] that owns modules and their initialization state.
//!
//! A registry is built on the execution context's own thread and never leaves
//! it, so modules need not be `Send` and cannot observe another instance's state.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::context::ResponseSink;
use super::message_protocols::{
    CorrelationId, ErrorInfo, RequestEnvelope, ResponseEnvelope, TransferList,
};

/// A named piece of offloadable work
pub trait TaskModule {
    /// One-time setup, run on the instance's thread before the first request
    ///
    /// An error permanently disables this module for the instance.
    fn initialize(&mut self, _config: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one request and eventually settle `completion` exactly once
    ///
    /// The completion may be moved elsewhere and settled later; the instance
    /// stays busy until it is.
    fn handle(&mut self, payload: serde_json::Value, transfer: TransferList, completion: Completion);
}

/// Adapter turning a closure into a [`TaskModule`]
pub struct FnModule<F>(pub F);

impl<F> TaskModule for FnModule<F>
where
    F: FnMut(serde_json::Value, TransferList, Completion),
{
    fn handle(&mut self, payload: serde_json::Value, transfer: TransferList, completion: Completion) {
        (self.0)(payload, transfer, completion)
    }
}

/// Reply channel for a single request
///
/// Clones share one settlement: the first `complete` or `fail` wins and any
/// later call returns `false`. If every clone is dropped unsettled, a failure
/// response is sent so the caller is never left waiting.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    correlation_id: CorrelationId,
    task_type: String,
    outbox: Mutex<Option<ResponseSink>>,
}

impl Completion {
    pub(crate) fn new(
        correlation_id: CorrelationId,
        task_type: impl Into<String>,
        outbox: ResponseSink,
    ) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                correlation_id,
                task_type: task_type.into(),
                outbox: Mutex::new(Some(outbox)),
            }),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.inner.correlation_id
    }

    /// Report success; buffers in `transfer` move to the caller
    pub fn complete(&self, result: serde_json::Value, transfer: TransferList) -> bool {
        self.settle(ResponseEnvelope::success(
            self.inner.correlation_id,
            result,
            transfer,
        ))
    }

    /// Report failure with a description
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.fail_with(ErrorInfo::handler(message))
    }

    pub fn is_settled(&self) -> bool {
        self.inner.outbox.lock().is_none()
    }

    pub(crate) fn fail_with(&self, error: ErrorInfo) -> bool {
        self.settle(ResponseEnvelope::failure(self.inner.correlation_id, error))
    }

    fn settle(&self, response: ResponseEnvelope) -> bool {
        let outbox = self.inner.outbox.lock().take();
        match outbox {
            Some(outbox) => {
                if outbox.send(response).is_err() {
                    debug!(
                        correlation_id = self.inner.correlation_id,
                        "Broker no longer listening; response discarded"
                    );
                }
                true
            }
            None => {
                warn!(
                    correlation_id = self.inner.correlation_id,
                    task_type = %self.inner.task_type,
                    "Completion invoked more than once; ignoring"
                );
                false
            }
        }
    }
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        if let Some(outbox) = self.outbox.get_mut().take() {
            warn!(
                correlation_id = self.correlation_id,
                task_type = %self.task_type,
                "Handler dropped completion without responding"
            );
            let _ = outbox.send(ResponseEnvelope::failure(
                self.correlation_id,
                ErrorInfo::handler("handler dropped completion without responding"),
            ));
        }
    }
}

/// Initialization lifecycle of one module inside one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

struct ModuleSlot {
    module: Box<dyn TaskModule>,
    state: InitState,
}

impl ModuleSlot {
    fn ensure_ready(&mut self, config: &serde_json::Value) -> Result<(), ErrorInfo> {
        match &self.state {
            InitState::Ready => return Ok(()),
            InitState::Failed(reason) => return Err(ErrorInfo::initialization(reason.clone())),
            InitState::Initializing => {
                return Err(ErrorInfo::initialization(
                    "initialization re-entered before completing",
                ))
            }
            InitState::Uninitialized => {}
        }

        self.state = InitState::Initializing;
        let module = &mut self.module;
        let result = match catch_unwind(AssertUnwindSafe(|| module.initialize(config))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!("initializer panicked: {}", panic_message(&*panic))),
        };

        match result {
            Ok(()) => {
                self.state = InitState::Ready;
                Ok(())
            }
            Err(reason) => {
                error!(reason = %reason, "Task module initialization failed");
                self.state = InitState::Failed(reason.clone());
                Err(ErrorInfo::initialization(reason))
            }
        }
    }
}

/// Task-type name → module, private to one execution context
#[derive(Default)]
pub struct HandlerRegistry {
    modules: HashMap<String, ModuleSlot>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with(mut self, task_type: impl Into<String>, module: impl TaskModule + 'static) -> Self {
        self.register(task_type, module);
        self
    }

    /// Register a module, replacing (and returning true for) any previous one
    pub fn register(&mut self, task_type: impl Into<String>, module: impl TaskModule + 'static) -> bool {
        self.modules
            .insert(
                task_type.into(),
                ModuleSlot {
                    module: Box::new(module),
                    state: InitState::Uninitialized,
                },
            )
            .is_some()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.modules.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn init_state(&self, task_type: &str) -> Option<&InitState> {
        self.modules.get(task_type).map(|slot| &slot.state)
    }

    /// Run the module for `request`, initializing it first if needed
    pub(crate) fn dispatch(
        &mut self,
        request: RequestEnvelope,
        config: &serde_json::Value,
        completion: Completion,
    ) {
        let Some(slot) = self.modules.get_mut(&request.task_type) else {
            completion.fail(format!(
                "no handler registered for task type {}",
                request.task_type
            ));
            return;
        };

        if let Err(error) = slot.ensure_ready(config) {
            completion.fail_with(error);
            return;
        }

        let module = &mut slot.module;
        let handler_completion = completion.clone();
        let outcome = catch_unwind(AssertUnwindSafe(move || {
            module.handle(request.payload, request.transfer, handler_completion)
        }));

        if let Err(panic) = outcome {
            let message = format!("handler panicked: {}", panic_message(&*panic));
            error!(correlation_id = completion.correlation_id(), "{}", message);
            completion.fail(message);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
