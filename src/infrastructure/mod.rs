//! Infrastructure layer: engine interface, configuration, logging.

pub mod config;
pub mod engine;
pub mod logging;
pub mod mock_engine;

pub use config::{AppConfig, ConfigManager, ContextMode, SuccessPolicy, TargetPolicy};
pub use engine::{
    ContextOptions, EngineInstance, EngineLauncher, ExecutionContext, LaunchOptions, PageHandle,
};
pub use mock_engine::{MockEngine, MockEngineStats, MockPage};
