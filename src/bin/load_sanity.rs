//! Load orchestrator sanity runner to verify wave scheduling, pool
//! bin-packing and monitor aggregation end to end against the mock engine.
//!
//! This binary wires a LoadController with the in-process mock engine and
//! the scripted workflow, runs one batch, and exits per the configured
//! success policy. No real browser is launched; set WAVELOAD_* env vars
//! to tweak the shape of the run.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use waveload_lib::infrastructure::config::{AppConfig, ContextMode};
use waveload_lib::infrastructure::logging::init_logging;
use waveload_lib::infrastructure::mock_engine::MockEngine;
use waveload_lib::orchestrator::workflow::ScriptedWorkflow;
use waveload_lib::orchestrator::LoadController;

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = init_logging();

    let total = env_usize("WAVELOAD_TOTAL", 10);
    let concurrency = env_usize("WAVELOAD_CONCURRENCY", 3);
    info!("🚀 load sanity runner starting: total={} concurrency={}", total, concurrency);

    let mut config = AppConfig::default();
    config.apply_env_overrides();
    // Keep the sanity loop snappy; the mock engine has no real cooldown needs.
    config.scheduler.wave_cooldown_ms = 100;
    config.monitor.flush_interval_secs = 2;

    let engine = MockEngine::new().with_launch_delay(Duration::from_millis(50));
    let stats = engine.stats();

    // Script one critical failure to show failure isolation in the report.
    let workflow = ScriptedWorkflow::standard();
    workflow
        .fail_critical("session-0003", "checkout", "payment gateway rejected the card")
        .await;

    let controller = LoadController::new(
        Arc::new(engine),
        Arc::new(workflow),
        config.clone(),
        "load-sanity",
    );

    controller
        .run_batch(total, concurrency, ContextMode::Shared)
        .await?;

    // Poll the control surface once mid-run, the way a UI would.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = controller.status().await;
    info!(
        "📡 mid-run status: running={} total={} completed={} failed={}",
        status.is_running, status.counts.total, status.counts.completed, status.counts.failed
    );

    // Ctrl-C requests a graceful stop; the in-flight wave settles first.
    let summary = tokio::select! {
        summary = controller.wait_for_completion() => summary?,
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 interrupt received, letting the current wave settle");
            controller.stop().await;
            controller.wait_for_completion().await?
        }
    };
    info!(
        "📊 summary: total={} successful={} failed={} rate={:.1}% waves={:?}",
        summary.total,
        summary.successful,
        summary.failed,
        summary.success_rate * 100.0,
        summary.wave_sizes
    );
    info!(
        "🧪 mock engine: launches={} contexts={} pages={}",
        stats.launches(),
        stats.contexts_opened(),
        stats.pages_opened()
    );

    let policy = config.scheduler.success_policy;
    if LoadController::run_succeeded(&summary, policy) {
        info!("✅ sanity run satisfied the {:?} success policy", policy);
        Ok(())
    } else {
        anyhow::bail!("sanity run failed the {:?} success policy", policy)
    }
}
