//! Pre-forwarding check: refuse while the build is broken, otherwise make sure
//! the backend is running.

use log::{debug, warn};
use std::sync::Arc;

/// Source of the current build status.
pub trait Builder: Send + Sync {
    /// Current error report. Empty means the last build succeeded.
    fn errors(&self) -> String;
}

/// Supervisor of the backend process.
pub trait Runner: Send + Sync {
    /// Ensure the backend is started and current. Called for every admitted
    /// request, concurrently; implementations must be idempotent. Blocks until
    /// the attempt is done. Failures are not reported back.
    fn run(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Build is broken; the report is the complete response body.
    Rejected(String),
    Admitted,
}

#[derive(Clone)]
pub struct RequestGate {
    builder: Arc<dyn Builder>,
    runner: Arc<dyn Runner>,
}

impl RequestGate {
    pub fn new(builder: Arc<dyn Builder>, runner: Arc<dyn Runner>) -> Self {
        Self { builder, runner }
    }

    /// Check the build and, when it is clean, trigger the runner once.
    ///
    /// The runner call happens on the blocking pool so a slow restart never
    /// stalls other connections. No timeout is imposed.
    pub async fn admit(&self) -> GateDecision {
        let report = self.builder.errors();
        if !report.is_empty() {
            warn!(
                "Build failed, refusing request: {}",
                report.lines().next().unwrap_or_default()
            );
            return GateDecision::Rejected(report);
        }

        debug!("Ensuring backend is running");
        let runner = Arc::clone(&self.runner);
        if let Err(e) = tokio::task::spawn_blocking(move || runner.run()).await {
            // A panicking runner is treated like any other runner failure
            warn!("Runner ensure call did not complete: {}", e);
        }

        GateDecision::Admitted
    }
}
