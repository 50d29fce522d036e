//! Diagnostic capture port
//!
//! Single seam for "grab whatever helps debugging" side effects on error
//! paths. The retry engine and the session runner both go through this
//! port instead of scattering capture calls across workflow code.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tracing::warn;

/// Captures a diagnostic artifact for a failed operation. Returns the
/// artifact reference (a path) when something was written.
#[async_trait]
pub trait DiagnosticCapture: Send + Sync {
    async fn capture(&self, label: &str, detail: &str) -> anyhow::Result<Option<String>>;
}

/// Capture disabled; records nothing.
pub struct NoopCapture;

#[async_trait]
impl DiagnosticCapture for NoopCapture {
    async fn capture(&self, _label: &str, _detail: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Writes one text dump per capture into a directory.
pub struct FileCapture {
    dir: PathBuf,
}

impl FileCapture {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl DiagnosticCapture for FileCapture {
    async fn capture(&self, label: &str, detail: &str) -> anyhow::Result<Option<String>> {
        if !self.dir.exists() {
            tokio::fs::create_dir_all(&self.dir).await?;
        }

        let sanitized: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let file_name = format!("{}-{}.txt", sanitized, Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        let path = self.dir.join(file_name);

        let body = format!("label: {label}\ntimestamp: {}\n\n{detail}\n", Utc::now().to_rfc3339());
        if let Err(e) = tokio::fs::write(&path, body).await {
            // Capture failures must never mask the original error.
            warn!("⚠️  Failed to write diagnostic capture {:?}: {}", path, e);
            return Ok(None);
        }

        Ok(Some(path.to_string_lossy().into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_capture_writes_artifact_and_returns_path() {
        let dir = tempdir().expect("tempdir");
        let capture = FileCapture::new(dir.path().join("captures"));

        let artifact = capture
            .capture("s-1:payment", "card form never rendered")
            .await
            .expect("capture")
            .expect("artifact path");

        let content = std::fs::read_to_string(&artifact).expect("read artifact");
        assert!(content.contains("card form never rendered"));
        assert!(artifact.contains("s-1_payment"));
    }

    #[tokio::test]
    async fn noop_capture_returns_none() {
        let artifact = NoopCapture.capture("x", "y").await.expect("capture");
        assert!(artifact.is_none());
    }
}
