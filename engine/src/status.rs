//! Sync status as seen by the UI.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Snapshot of the engine's sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// `None` until the first probe or platform event
    pub is_online: Option<bool>,
    pub sync_in_progress: bool,
    /// Cursor of the last completed pull
    pub last_sync_time: Option<Timestamp>,
    /// Mutations still headed for the remote
    pub queue_length: usize,
    /// A remote backend is configured; set when the engine is built
    pub remote_ready: bool,
    /// Escalated mutations plus unresolved flagged conflicts
    pub pending_review: usize,
}

/// Owner of the status channel.
///
/// Only the engine's own components write through it; everyone else reads
/// snapshots or subscribes.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every field change.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Call `callback` with each new status until the engine is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_fn<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&SyncStatus) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                callback(&status);
            }
        })
    }

    /// Apply `f`; subscribers are only woken if a field actually changed.
    pub(crate) fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }
}
