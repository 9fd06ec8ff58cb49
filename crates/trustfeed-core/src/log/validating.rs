use crate::error::NodeResult;
use crate::log::entry::{Action, LogEntry};
use crate::log::store::LogStore;

/// Runs [`Action::validate`] before handing the action to the wrapped log.
///
/// A rejected action never reaches the underlying store.
pub struct ValidatingLog<L> {
    inner: L,
}

impl<L: LogStore> ValidatingLog<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: LogStore> LogStore for ValidatingLog<L> {
    fn append(&self, timestamp: u64, action: Action) -> NodeResult<LogEntry> {
        action.validate()?;
        self.inner.append(timestamp, action)
    }

    fn read_from(&self, seq: u64, limit: usize) -> NodeResult<Vec<LogEntry>> {
        self.inner.read_from(seq, limit)
    }

    fn head(&self) -> NodeResult<u64> {
        self.inner.head()
    }
}
