//! # Guard — One Active Sync per Process
//!
//! A single-slot token behind a mutex. [`ConcurrencyGuard::try_acquire`]
//! claims the slot and then consults the history store for any record still
//! marked `running` (left by another process or not yet recovered); either
//! conflict rejects with `SyncInProgress` carrying the active id.
//!
//! The check and the later insert are not atomic across processes; the
//! history store closes that gap by refusing a second `running` record.
//!
//! The returned [`SyncPermit`] releases the slot when dropped, so every exit
//! path of the owning task (success, failure, cancellation, panic) releases
//! exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::SyncError;
use crate::history::HistoryStore;

#[derive(Clone, Default)]
pub struct ConcurrencyGuard {
    slot: Arc<Mutex<Option<String>>>,
}

fn lock(slot: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sync currently holding the token.
    pub fn active(&self) -> Option<String> {
        lock(&self.slot).clone()
    }

    /// Claim the token for `sync_id` without consulting history.
    pub fn claim(&self, sync_id: &str) -> Result<SyncPermit, SyncError> {
        let mut slot = lock(&self.slot);
        if let Some(active) = slot.as_ref() {
            return Err(SyncError::SyncInProgress {
                active_sync_id: active.clone(),
            });
        }
        *slot = Some(sync_id.to_string());
        Ok(SyncPermit {
            slot: Arc::clone(&self.slot),
            sync_id: sync_id.to_string(),
        })
    }

    /// Claim the token, then reject if history still shows a running record.
    pub async fn try_acquire(
        &self,
        sync_id: &str,
        store: &dyn HistoryStore,
    ) -> Result<SyncPermit, SyncError> {
        let permit = self.claim(sync_id)?;
        let running = store.running().await?;
        if let Some(other) = running.into_iter().find(|r| r.sync_id != sync_id) {
            // dropping the permit frees the slot
            return Err(SyncError::SyncInProgress {
                active_sync_id: other.sync_id,
            });
        }
        Ok(permit)
    }
}

/// Proof of holding the token. Dropping it releases the slot.
#[derive(Debug)]
pub struct SyncPermit {
    slot: Arc<Mutex<Option<String>>>,
    sync_id: String,
}

impl SyncPermit {
    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.as_deref() == Some(self.sync_id.as_str()) {
            *slot = None;
        }
    }
}
