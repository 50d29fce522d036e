//! Orchestrator core: pooling, scheduling, resilience, telemetry.

pub mod backoff;
pub mod controller;
pub mod diagnostics;
pub mod monitor;
pub mod pool;
pub mod queue_wait;
pub mod retry;
pub mod scheduler;
pub mod session_runner;
pub mod single_flight;
pub mod workflow;

pub use backoff::BackoffPolicy;
pub use controller::{LoadController, RunStatus};
pub use diagnostics::{DiagnosticCapture, FileCapture, NoopCapture};
pub use monitor::{JsonFileSink, LiveMonitor, MonitorSnapshot, MonitorStats, SnapshotSink};
pub use pool::{EnginePool, PoolError, SessionResources};
pub use queue_wait::{
    MarkerProbe, QueueWaitError, QueueWaitOutcome, QueueWaitWatcher,
    WaitObservation, WaitingRoomProbe,
};
pub use retry::{CategorizedError, RetryError, RetryExecutor};
pub use scheduler::{BatchScheduler, RunSummary};
pub use session_runner::SessionRunner;
pub use single_flight::SingleFlight;
pub use workflow::{ScriptedWorkflow, WorkflowContext, WorkflowExecutor, WorkflowOutcome};
