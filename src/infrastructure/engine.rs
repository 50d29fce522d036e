//! Automation engine interface
//!
//! Abstract capability over the external browser-automation engine: launch
//! an engine process, open isolated execution contexts inside it, open
//! pages/tabs inside a context. The orchestrator only ever talks to these
//! traits; concrete drivers (CDP, WebDriver, an in-process mock) live
//! behind them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Options applied when launching a new engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Run without a visible window
    pub headless: bool,
    /// Extra engine arguments passed through verbatim
    pub args: Vec<String>,
    /// Launch timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            args: Vec::new(),
            timeout_ms: 30_000,
        }
    }
}

/// Options applied when opening a new execution context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextOptions {
    /// User-agent override, if any
    pub user_agent: Option<String>,
    /// Viewport as (width, height), engine default when absent
    pub viewport: Option<(u32, u32)>,
}

/// Launches engine instances. The entry point of the trait family.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> anyhow::Result<Arc<dyn EngineInstance>>;
}

/// One running engine instance, hosting multiple execution contexts.
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// Opens an isolated browsing profile within this instance.
    async fn new_context(&self, options: &ContextOptions) -> anyhow::Result<Arc<dyn ExecutionContext>>;

    /// Closes the instance and everything inside it.
    async fn close(&self) -> anyhow::Result<()>;
}

/// An isolated browsing profile; may host one or more pages/tabs.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Opens a new page/tab within this context.
    async fn new_page(&self) -> anyhow::Result<Arc<dyn PageHandle>>;

    /// Closes the context and its pages.
    async fn close(&self) -> anyhow::Result<()>;
}

/// One page/tab. Exposes just enough surface for the queue-wait detector
/// (current location and rendered content) on top of lifecycle control.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Current page URL.
    async fn current_url(&self) -> anyhow::Result<String>;

    /// Rendered page content (text/HTML), used for marker detection.
    async fn content(&self) -> anyhow::Result<String>;

    /// Closes the page.
    async fn close(&self) -> anyhow::Result<()>;
}
