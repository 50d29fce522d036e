//! Waveload - Concurrent Session Load-Testing Orchestrator
//!
//! Drives many simulated end-user sessions against a multi-step web
//! workflow concurrently: pooled automation-engine resources, bounded
//! parallel waves, waiting-room ride-out, retry with backoff, and live
//! aggregated telemetry.

// Module declarations
pub mod domain;
pub mod infrastructure;
pub mod orchestrator;

pub use orchestrator::{LoadController, RunStatus, RunSummary};
