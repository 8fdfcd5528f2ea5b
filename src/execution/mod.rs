pub mod context;
pub mod handler;
pub mod message_protocols;
pub mod worker_manager;
pub mod worker_pool;

pub use context::{
    ExecutionContext, ExecutionUnit, ResponseSink, ThreadFactory, ThreadUnit, UnitFactory,
    UnitSpec,
};
pub use handler::{Completion, FnModule, HandlerRegistry, InitState, TaskModule};
pub use message_protocols::{
    CorrelationId, ErrorInfo, RequestEnvelope, ResponseEnvelope, TaskOutcome, TaskOutput,
    TransferBuffer, TransferList,
};
pub use worker_manager::{TaskHandle, WorkerManager};
pub use worker_pool::{IdleExpired, InstancePool, PoolStats, RegisterOptions, RouteOutcome, TerminatedWork};
