//! Shared task modules and factories for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use task_broker::execution::{
    ExecutionUnit, RequestEnvelope, ResponseEnvelope, ResponseSink, UnitFactory, UnitSpec,
};
use task_broker::prelude::*;

/// Tracks how many handlers run at once across every instance of a factory
#[derive(Default)]
pub struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn thread_name() -> String {
    std::thread::current().name().unwrap_or_default().to_string()
}

/// Registry with `echo`, `sleep`, `fail` and `panic` modules
///
/// `sleep` expects `{"ms": u64, "tag": any}` and replies with the tag and the
/// thread it ran on.
pub fn test_registry(concurrency: Arc<Concurrency>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            "echo",
            FnModule(|payload: Value, transfer: TransferList, completion: Completion| {
                completion.complete(payload, transfer);
            }),
        )
        .with(
            "sleep",
            FnModule(move |payload: Value, _transfer: TransferList, completion: Completion| {
                concurrency.enter();
                let ms = payload["ms"].as_u64().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                concurrency.exit();
                completion.complete(
                    json!({"tag": payload["tag"], "thread": thread_name()}),
                    Vec::new(),
                );
            }),
        )
        .with(
            "fail",
            FnModule(|payload: Value, _transfer: TransferList, completion: Completion| {
                let message = payload["message"].as_str().unwrap_or("failed").to_string();
                completion.fail(message);
            }),
        )
        .with(
            "panic",
            FnModule(|_payload: Value, _transfer: TransferList, _completion: Completion| {
                panic!("module exploded");
            }),
        )
}

/// Factory whose instances host [`test_registry`]
pub fn test_factory() -> (ThreadFactory<impl Fn() -> HandlerRegistry + Send + Sync + 'static>, Arc<Concurrency>) {
    let concurrency = Arc::new(Concurrency::default());
    let shared = Arc::clone(&concurrency);
    let factory = ThreadFactory::new(move || test_registry(Arc::clone(&shared)));
    (factory, concurrency)
}

/// Module whose initializer always fails
pub struct FailingInit;

impl TaskModule for FailingInit {
    fn initialize(&mut self, _config: &Value) -> anyhow::Result<()> {
        anyhow::bail!("codec library missing")
    }

    fn handle(&mut self, _payload: Value, _transfer: TransferList, completion: Completion) {
        completion.complete(json!("unreachable"), Vec::new());
    }
}

/// One decode run as observed by [`TimedDecode`]
#[derive(Debug, Clone)]
pub struct DecodeRun {
    pub tag: u64,
    pub thread: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Decode task that holds its instance for `delay` and records when it ran
pub struct TimedDecode {
    inner: DecodeTask,
    delay: Duration,
    runs: Arc<Mutex<Vec<DecodeRun>>>,
}

impl TimedDecode {
    pub fn new(delay: Duration, runs: Arc<Mutex<Vec<DecodeRun>>>) -> Self {
        Self {
            inner: DecodeTask::default(),
            delay,
            runs,
        }
    }
}

impl TaskModule for TimedDecode {
    fn initialize(&mut self, config: &Value) -> anyhow::Result<()> {
        self.inner.initialize(config)
    }

    fn handle(&mut self, payload: Value, transfer: TransferList, completion: Completion) {
        let started = Instant::now();
        let tag = payload["tag"].as_u64().unwrap_or(0);
        std::thread::sleep(self.delay);
        self.runs.lock().push(DecodeRun {
            tag,
            thread: thread_name(),
            started,
            finished: Instant::now(),
        });
        self.inner.handle(payload, transfer, completion);
    }
}

/// How a [`ScriptedUnit`] answers each request
#[derive(Clone, Copy)]
pub enum Script {
    /// Reply with an unrecognised status string
    BogusStatus,
    /// Reply to an unknown correlation id first, then echo properly
    StrayThenEcho,
}

/// Execution unit that answers inline with hand-built envelopes
pub struct ScriptedUnit {
    script: Script,
    outbox: ResponseSink,
}

impl ExecutionUnit for ScriptedUnit {
    fn post(&mut self, request: RequestEnvelope) -> std::result::Result<(), RequestEnvelope> {
        match self.script {
            Script::BogusStatus => {
                let mut response =
                    ResponseEnvelope::success(request.correlation_id, request.payload, Vec::new());
                response.status = "exploded".to_string();
                let _ = self.outbox.send(response);
            }
            Script::StrayThenEcho => {
                let _ = self.outbox.send(ResponseEnvelope::success(
                    request.correlation_id + 10_000,
                    json!("stray"),
                    Vec::new(),
                ));
                let _ = self.outbox.send(ResponseEnvelope::success(
                    request.correlation_id,
                    request.payload,
                    request.transfer,
                ));
            }
        }
        Ok(())
    }

    fn terminate(&mut self) {}
}

pub struct ScriptedFactory(pub Script);

impl UnitFactory for ScriptedFactory {
    fn spawn(
        &self,
        _spec: UnitSpec,
        outbox: ResponseSink,
    ) -> task_broker::Result<Box<dyn ExecutionUnit>> {
        Ok(Box::new(ScriptedUnit {
            script: self.0,
            outbox,
        }))
    }
}

/// Little-endian 16-bit frame of `rows * columns` copies of `value`
pub fn uniform_frame(rows: u32, columns: u32, value: u16) -> (Value, TransferBuffer) {
    let bytes: Vec<u8> = std::iter::repeat(value)
        .take((rows * columns) as usize)
        .flat_map(u16::to_le_bytes)
        .collect();
    let frame = json!({"rows": rows, "columns": columns, "bitsAllocated": 16});
    (frame, TransferBuffer::new(bytes))
}
