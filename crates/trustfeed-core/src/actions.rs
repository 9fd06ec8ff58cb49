//! Typed append operations
//!
//! [`Actions`] is the only writer of the change log. Each operation stamps
//! the current time, validates and appends one entry; subscribers learn about
//! it through the [`ChangeLog`] channels once the append is durable.

use std::sync::Arc;

use crate::error::NodeResult;
use crate::log::{
    Action, AddContact, ChangeLog, LinkRef, LogEntry, NewObject, NewWatch, QueueSeal, ReadSeal,
    WroteSeal,
};
use crate::types::{now_millis, Link};

#[derive(Clone)]
pub struct Actions {
    log: Arc<ChangeLog>,
}

impl Actions {
    pub fn new(log: Arc<ChangeLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<ChangeLog> {
        &self.log
    }

    fn emit(&self, action: Action) -> NodeResult<LogEntry> {
        self.log.append(now_millis(), action)
    }

    pub fn create_object(&self, object: NewObject) -> NodeResult<LogEntry> {
        self.emit(Action::NewObj(object))
    }

    pub fn add_contact(&self, contact: AddContact) -> NodeResult<LogEntry> {
        self.emit(Action::AddContact(contact))
    }

    pub fn create_watch(&self, watch: NewWatch) -> NodeResult<LogEntry> {
        self.emit(Action::NewWatch(watch))
    }

    /// Queue a seal for the sealer (topic `queueseal`)
    pub fn write_seal(&self, seal: QueueSeal) -> NodeResult<LogEntry> {
        self.emit(Action::QueueSeal(seal))
    }

    pub fn wrote_seal(&self, seal: WroteSeal) -> NodeResult<LogEntry> {
        self.emit(Action::WroteSeal(seal))
    }

    pub fn read_seal(&self, seal: ReadSeal) -> NodeResult<LogEntry> {
        self.emit(Action::ReadSeal(seal))
    }

    pub fn sent_message(&self, link: Link) -> NodeResult<LogEntry> {
        self.emit(Action::Sent(LinkRef { link }))
    }

    pub fn abort_message(&self, link: Link) -> NodeResult<LogEntry> {
        self.emit(Action::SendAborted(LinkRef { link }))
    }

    pub fn archive_object(&self, link: Link) -> NodeResult<LogEntry> {
        self.emit(Action::ArchiveObj(LinkRef { link }))
    }

    pub fn unarchive_object(&self, link: Link) -> NodeResult<LogEntry> {
        self.emit(Action::UnarchiveObj(LinkRef { link }))
    }

    pub fn forget_object(&self, link: Link) -> NodeResult<LogEntry> {
        self.emit(Action::ForgetObj(LinkRef { link }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::types::Topic;

    #[test]
    fn test_actions_append_with_topic_and_timestamp() {
        let log = Arc::new(ChangeLog::new(Arc::new(MemoryLog::new()), 8).unwrap());
        let actions = Actions::new(log.clone());
        let link = Link::from_bytes([3; 32]);

        let before = now_millis();
        let entry = actions.archive_object(link).unwrap();
        assert_eq!(entry.topic(), Topic::ArchiveObj);
        assert!(entry.timestamp >= before);

        actions.forget_object(link).unwrap();
        let topics: Vec<Topic> = log
            .read_from(1, 10)
            .unwrap()
            .iter()
            .map(|e| e.topic())
            .collect();
        assert_eq!(topics, vec![Topic::ArchiveObj, Topic::ForgetObj]);
    }
}
