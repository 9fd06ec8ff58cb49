//! The shared change log handle
//!
//! Wraps a [`LogStore`] in validation and fans out every appended entry:
//! the new head goes out on a `watch` channel (fold loops wake on it and read
//! gaplessly from their cursor) and the entry itself on a `broadcast`
//! channel for observers that want to tail the feed.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::NodeResult;
use crate::log::entry::{Action, LogEntry};
use crate::log::store::LogStore;
use crate::log::validating::ValidatingLog;

pub struct ChangeLog {
    store: ValidatingLog<Arc<dyn LogStore>>,
    // Serializes append + publish so subscribers see seq order
    append_lock: Mutex<()>,
    head_tx: watch::Sender<u64>,
    entries_tx: broadcast::Sender<LogEntry>,
}

impl ChangeLog {
    pub fn new(store: Arc<dyn LogStore>, capacity: usize) -> NodeResult<Self> {
        let head = store.head()?;
        let (head_tx, _) = watch::channel(head);
        let (entries_tx, _) = broadcast::channel(capacity.max(1));
        Ok(Self {
            store: ValidatingLog::new(store),
            append_lock: Mutex::new(()),
            head_tx,
            entries_tx,
        })
    }

    /// Validate and durably append, then publish.
    ///
    /// Nothing is published when validation or storage fails.
    pub fn append(&self, timestamp: u64, action: Action) -> NodeResult<LogEntry> {
        let _guard = self.append_lock.lock();
        let topic = action.topic();
        let entry = match self.store.append(timestamp, action) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%topic, error = %e, "append rejected");
                return Err(e);
            }
        };
        debug!(seq = entry.seq, %topic, "appended");
        self.head_tx.send_replace(entry.seq);
        // No receivers is fine
        let _ = self.entries_tx.send(entry.clone());
        Ok(entry)
    }

    pub fn read_from(&self, seq: u64, limit: usize) -> NodeResult<Vec<LogEntry>> {
        self.store.read_from(seq, limit)
    }

    /// Seq of the last appended entry
    pub fn head(&self) -> u64 {
        *self.head_tx.borrow()
    }

    pub fn watch_head(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.entries_tx.subscribe()
    }
}
