use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kbase_core::config::HealthSettings;
use kbase_core::{ModeSource, SyncMode, VectorStore};

use crate::state::SyncStateHandle;

/// Decides online/degraded from Primary health checks.
///
/// A check runs on access when the previous observation is older than
/// `ttl`; a check that outlives `timeout` counts as unhealthy.
pub struct FailoverMonitor {
    primary: Arc<dyn VectorStore>,
    state: SyncStateHandle,
    timeout: Duration,
    ttl: Duration,
    last_observed: Mutex<Option<Instant>>,
}

impl FailoverMonitor {
    pub fn new(primary: Arc<dyn VectorStore>, state: SyncStateHandle, settings: &HealthSettings) -> Self {
        Self {
            primary,
            state,
            timeout: Duration::from_millis(settings.timeout_ms),
            ttl: Duration::from_millis(settings.ttl_ms),
            last_observed: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &SyncStateHandle { &self.state }

    /// Probe Primary now, ignoring the TTL.
    pub async fn check(&self) -> bool {
        self.mark_observed();
        self.probe().await
    }

    async fn probe(&self) -> bool {
        let healthy = tokio::time::timeout(self.timeout, self.primary.health_check()).await.unwrap_or(false);
        self.observe(healthy, None);
        healthy
    }

    fn observe(&self, healthy: bool, reason: Option<&str>) {
        match self.state.record_health(healthy) {
            Some(SyncMode::Degraded) => {
                tracing::warn!(store = self.primary.name(), reason = reason.unwrap_or("health check failed"), "primary unreachable; serving from fallback")
            }
            Some(SyncMode::Online) => tracing::info!(store = self.primary.name(), "primary reachable again; back online"),
            None => {}
        }
    }

    /// Claims the next check for this caller. Concurrent callers inside the
    /// TTL window keep the current mode instead of probing in parallel.
    fn claim_check(&self) -> bool {
        let mut last = self.last_observed.lock().unwrap_or_else(|e| e.into_inner());
        let due = last.map_or(true, |at| at.elapsed() >= self.ttl);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    fn mark_observed(&self) { *self.last_observed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now()); }
}

#[async_trait]
impl ModeSource for FailoverMonitor {
    async fn resolve_mode(&self) -> SyncMode {
        if self.claim_check() {
            self.probe().await;
        }
        self.state.mode()
    }

    fn report_primary_failure(&self, reason: &str) {
        self.mark_observed();
        self.observe(false, Some(reason));
    }
}
