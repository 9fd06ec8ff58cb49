//! Append-only change log

mod changelog;
mod entry;
mod store;
mod validating;

pub use changelog::ChangeLog;
pub use entry::{
    Action, AddContact, LinkRef, LogEntry, NewObject, NewWatch, QueueSeal, ReadSeal, WroteSeal,
};
pub use store::{LogStore, MemoryLog};
pub use validating::ValidatingLog;
