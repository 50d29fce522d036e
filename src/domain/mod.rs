//! Domain layer: session model and monitor event vocabulary.

pub mod events;
pub mod session;

pub use events::{ErrorBucket, MonitorEvent};
pub use session::{ErrorCategory, ErrorRecord, Session, SessionStatus, SessionSummary, StepTiming};
