//! Per-workspace run locks.
//!
//! Every run, queued or manual, holds its workspace's lock for the whole run. Locks
//! are created on first use and kept for the life of the process, so the registry
//! grows with the number of distinct workspaces seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::WorkspaceId;

#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: Mutex<HashMap<WorkspaceId, Arc<AsyncMutex<()>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the workspace's lock. Released when the guard drops.
    pub async fn acquire(&self, workspace_id: WorkspaceId) -> OwnedMutexGuard<()> {
        self.lock_for(workspace_id).lock_owned().await
    }

    /// Returns `None` if a run for the workspace is in progress.
    pub fn try_acquire(&self, workspace_id: WorkspaceId) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(workspace_id).try_lock_owned().ok()
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_for(&self, workspace_id: WorkspaceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        Arc::clone(locks.entry(workspace_id).or_default())
    }
}
