use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kbase_core::{SyncMode, SyncPhase, SyncResult, SyncState};

/// Shared handle to the process's [`SyncState`].
///
/// Cloned into the failover monitor and the sync manager; everyone else
/// only reads snapshots. Critical sections never span an await.
#[derive(Clone)]
pub struct SyncStateHandle {
    inner: Arc<RwLock<SyncState>>,
}

impl Default for SyncStateHandle {
    fn default() -> Self {
        let initial = SyncState { mode: SyncMode::Online, primary_reachable: true, ..SyncState::default() };
        Self { inner: Arc::new(RwLock::new(initial)) }
    }
}

impl SyncStateHandle {
    pub fn new() -> Self { Self::default() }

    pub fn snapshot(&self) -> SyncState { self.read().clone() }

    pub fn mode(&self) -> SyncMode { self.read().mode }

    /// Record a Primary health observation. Returns the new mode when it changed.
    pub(crate) fn record_health(&self, reachable: bool) -> Option<SyncMode> {
        let mut state = self.write();
        state.primary_reachable = reachable;
        let mode = if reachable { SyncMode::Online } else { SyncMode::Degraded };
        if state.mode == mode {
            return None;
        }
        state.mode = mode;
        Some(mode)
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        let mut state = self.write();
        state.phase = phase;
        state.in_flight = phase == SyncPhase::Syncing;
    }

    pub(crate) fn record_result(&self, result: &SyncResult) {
        let mut state = self.write();
        if result.success {
            state.last_sync_at = Some(result.finished_at);
        }
        state.last_result = Some(result.clone());
        state.phase = SyncPhase::Idle;
        state.in_flight = false;
    }

    // A panicked writer leaves plain data behind; keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, SyncState> { self.inner.read().unwrap_or_else(|e| e.into_inner()) }

    fn write(&self) -> RwLockWriteGuard<'_, SyncState> { self.inner.write().unwrap_or_else(|e| e.into_inner()) }
}
