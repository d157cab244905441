//! Single-flight replication from Primary into a staged Fallback generation.
//!
//! A sync snapshots Primary page by page into a fresh staging generation of
//! the Fallback store and promotes it only when every page landed. Any
//! failure, deadline expiry or [`SyncManager::cancel`] discards the staging
//! generation, so the live Fallback content is exactly what it was before.
//!
//! The run itself is a spawned task: dropping a `sync()` future detaches
//! the caller but never leaves staging half-written.
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use kbase_core::config::SyncSettings;
use kbase_core::{Error, GenerationId, GenerationalStore, ModeSource, StoreRole, SyncMode, SyncPhase, SyncResult, SyncState, VectorStore};

use crate::monitor::FailoverMonitor;
use crate::state::SyncStateHandle;

type SharedSync = Shared<BoxFuture<'static, SyncResult>>;

/// A failed sync step and the store that failed it. Deadline and
/// cancellation have no origin.
struct Failure {
    origin: Option<StoreRole>,
    error: Error,
}

impl Failure {
    fn primary(error: Error) -> Self { Self { origin: Some(StoreRole::Primary), error } }

    fn fallback(error: Error) -> Self { Self { origin: Some(StoreRole::Fallback), error } }

    fn stopped(reason: String) -> Self { Self { origin: None, error: Error::Cancelled(reason) } }

    /// Only a transient Primary failure says anything about Primary health.
    fn primary_unreachable(&self) -> bool { self.origin == Some(StoreRole::Primary) && self.error.is_transient() }
}

struct Flight {
    id: u64,
    result: SharedSync,
    cancel: watch::Sender<bool>,
}

struct Inner {
    primary: Arc<dyn VectorStore>,
    fallback: Arc<dyn GenerationalStore>,
    monitor: Arc<FailoverMonitor>,
    state: SyncStateHandle,
    page_size: usize,
    deadline: Duration,
    flight: Mutex<Option<Flight>>,
    next_flight: AtomicU64,
}

/// Replicates Primary into Fallback on request and reports the
/// online/degraded mode.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(
        primary: Arc<dyn VectorStore>,
        fallback: Arc<dyn GenerationalStore>,
        monitor: Arc<FailoverMonitor>,
        settings: &SyncSettings,
    ) -> Self {
        let state = monitor.state().clone();
        Self {
            inner: Arc::new(Inner {
                primary,
                fallback,
                monitor,
                state,
                page_size: settings.page_size.max(1),
                deadline: Duration::from_millis(settings.deadline_ms),
                flight: Mutex::new(None),
                next_flight: AtomicU64::new(1),
            }),
        }
    }

    /// Run a sync, or join the one already running. Failures come back as
    /// `SyncResult { success: false, .. }`.
    pub async fn sync(&self) -> SyncResult {
        let shared = {
            let mut slot = lock(&self.inner.flight);
            match slot.as_ref() {
                Some(flight) => {
                    tracing::debug!(flight = flight.id, "joining in-flight sync");
                    flight.result.clone()
                }
                None => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (cancel, cancelled) = watch::channel(false);
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let result = inner.run(cancelled).await;
                        inner.finish_flight(id);
                        result
                    });
                    let result = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => {
                                let now = Utc::now();
                                failed(format!("sync task died: {e}"), 0, now, now)
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(Flight { id, result: result.clone(), cancel });
                    result
                }
            }
        };
        shared.await
    }

    /// Ask the in-flight sync, if any, to stop and roll back. Returns
    /// whether there was one.
    pub fn cancel(&self) -> bool {
        match lock(&self.inner.flight).as_ref() {
            Some(flight) => {
                tracing::info!(flight = flight.id, "cancelling sync");
                flight.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Online/degraded, refreshed by a health check when the last one is stale.
    pub async fn current_mode(&self) -> SyncMode { self.inner.monitor.resolve_mode().await }

    pub fn state(&self) -> SyncState { self.inner.state.snapshot() }

    pub fn state_handle(&self) -> &SyncStateHandle { &self.inner.state }
}

impl Inner {
    async fn run(&self, mut cancelled: watch::Receiver<bool>) -> SyncResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        self.state.set_phase(SyncPhase::Syncing);
        tracing::info!(from = self.primary.name(), to = self.fallback.name(), "sync started");

        let staging = match self.fallback.create_staging().await {
            Ok(g) => g,
            Err(e) => return self.abort(None, Failure::fallback(e), 0, started_at).await,
        };

        let progress = AtomicUsize::new(0);
        let copied = tokio::select! {
            r = tokio::time::timeout(self.deadline, self.copy_into(&staging, &progress)) => match r {
                Ok(r) => r,
                Err(_) => Err(Failure::stopped(format!("sync deadline of {}ms exceeded", self.deadline.as_millis()))),
            },
            _ = wait_for_cancel(&mut cancelled) => Err(Failure::stopped("sync cancelled by caller".into())),
        };
        let copied = match copied {
            Ok(n) => n,
            Err(e) => return self.abort(Some(&staging), e, progress.load(Ordering::Relaxed), started_at).await,
        };

        if let Err(e) = self.fallback.promote(&staging).await {
            return self.abort(Some(&staging), Failure::fallback(e), copied, started_at).await;
        }

        let result = SyncResult {
            success: true,
            reason: None,
            items_copied: copied,
            generation: Some(staging.to_string()),
            started_at,
            finished_at: Utc::now(),
        };
        self.state.record_result(&result);
        tracing::info!(items = copied, generation = %staging, elapsed_ms = clock.elapsed().as_millis() as u64, "sync complete");
        result
    }

    async fn copy_into(&self, staging: &GenerationId, progress: &AtomicUsize) -> std::result::Result<usize, Failure> {
        let mut copied = 0;
        loop {
            let page = self.primary.scan(copied, self.page_size).await.map_err(Failure::primary)?;
            if page.is_empty() {
                break;
            }
            self.fallback.write_staging(staging, &page).await.map_err(Failure::fallback)?;
            copied += page.len();
            progress.store(copied, Ordering::Relaxed);
            tracing::debug!(copied, "page staged");
            if page.len() < self.page_size {
                break;
            }
        }
        Ok(copied)
    }

    async fn abort(&self, staging: Option<&GenerationId>, failure: Failure, copied: usize, started_at: DateTime<Utc>) -> SyncResult {
        self.state.set_phase(SyncPhase::RolledBack);
        let origin = failure.origin.map(StoreRole::as_str).unwrap_or("none");
        tracing::warn!(error = %failure.error, origin, copied, "sync failed; rolling back");
        if failure.primary_unreachable() && self.state.record_health(false).is_some() {
            tracing::warn!(store = self.primary.name(), "primary unreachable during sync; serving from fallback");
        }
        if let Some(g) = staging {
            if let Err(e) = self.fallback.discard(g).await {
                tracing::warn!(generation = %g, error = %e, "failed to discard staging generation");
            }
        }
        let result = failed(Error::SyncAborted(failure.error.to_string()).to_string(), copied, started_at, Utc::now());
        self.state.record_result(&result);
        result
    }

    fn finish_flight(&self, id: u64) {
        let mut slot = lock(&self.flight);
        if slot.as_ref().is_some_and(|f| f.id == id) {
            *slot = None;
        }
    }
}

fn failed(reason: String, copied: usize, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> SyncResult {
    SyncResult { success: false, reason: Some(reason), items_copied: copied, generation: None, started_at, finished_at }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }
