//! Log storage engines

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{NodeError, NodeResult};
use crate::log::entry::{Action, LogEntry};

/// Append-only storage of log entries.
///
/// Implementations assign `seq` on append: the first entry gets 1 and every
/// later entry the previous head plus one.
pub trait LogStore: Send + Sync {
    /// Durably append `action`, returning the sequenced entry
    fn append(&self, timestamp: u64, action: Action) -> NodeResult<LogEntry>;

    /// Up to `limit` entries starting at `seq` (inclusive), in order
    fn read_from(&self, seq: u64, limit: usize) -> NodeResult<Vec<LogEntry>>;

    /// Seq of the last entry, 0 when empty
    fn head(&self) -> NodeResult<u64>;
}

impl<L: LogStore + ?Sized> LogStore for Arc<L> {
    fn append(&self, timestamp: u64, action: Action) -> NodeResult<LogEntry> {
        (**self).append(timestamp, action)
    }

    fn read_from(&self, seq: u64, limit: usize) -> NodeResult<Vec<LogEntry>> {
        (**self).read_from(seq, limit)
    }

    fn head(&self) -> NodeResult<u64> {
        (**self).head()
    }
}

/// In-memory log used by tests and replays
#[derive(Default)]
pub struct MemoryLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload entries, e.g. copied from another log. Seqs must be gapless from 1.
    pub fn from_entries(entries: Vec<LogEntry>) -> NodeResult<Self> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.seq != i as u64 + 1 {
                return Err(NodeError::Validation(format!(
                    "entry {} has seq {}",
                    i + 1,
                    entry.seq
                )));
            }
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }
}

impl LogStore for MemoryLog {
    fn append(&self, timestamp: u64, action: Action) -> NodeResult<LogEntry> {
        let mut entries = self.entries.write();
        let entry = LogEntry {
            seq: entries.len() as u64 + 1,
            timestamp,
            action,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    fn read_from(&self, seq: u64, limit: usize) -> NodeResult<Vec<LogEntry>> {
        let entries = self.entries.read();
        let start = seq.max(1) as usize - 1;
        Ok(entries.iter().skip(start).take(limit).cloned().collect())
    }

    fn head(&self) -> NodeResult<u64> {
        Ok(self.entries.read().len() as u64)
    }
}
