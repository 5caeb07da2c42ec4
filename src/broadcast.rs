//! # Broadcast — Live Status Fan-out
//!
//! One `tokio::sync::broadcast` channel per sync id with active subscribers,
//! plus a firehose channel carrying every update for dashboard-wide views.
//! Messages are full [`SyncRecord`] snapshots.
//!
//! The broadcaster mirrors the history store and holds no other state:
//! channels with no receivers are pruned on the next publish, and a sync's
//! channel is dropped after its terminal snapshot goes out. A subscriber
//! that arrives late reads the snapshot from the store first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::record::SyncRecord;

const CHANNEL_CAPACITY: usize = 64;
const FIREHOSE_CAPACITY: usize = 256;

pub struct StatusBroadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<SyncRecord>>>,
    firehose: broadcast::Sender<SyncRecord>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (firehose, _) = broadcast::channel(FIREHOSE_CAPACITY);
        StatusBroadcaster {
            channels: Mutex::new(HashMap::new()),
            firehose,
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<SyncRecord>>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, sync_id: &str) -> broadcast::Receiver<SyncRecord> {
        self.channels()
            .entry(sync_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<SyncRecord> {
        self.firehose.subscribe()
    }

    pub fn publish(&self, record: &SyncRecord) {
        let _ = self.firehose.send(record.clone());
        let mut channels = self.channels();
        channels.retain(|id, tx| id == &record.sync_id || tx.receiver_count() > 0);
        if let Some(tx) = channels.get(&record.sync_id) {
            let _ = tx.send(record.clone());
        }
        if record.status.is_terminal() {
            channels.remove(&record.sync_id);
        }
    }

    pub fn subscriber_count(&self, sync_id: &str) -> usize {
        self.channels()
            .get(sync_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Channels currently held, including ones awaiting pruning.
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}
