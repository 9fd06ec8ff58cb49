//! The node's projections over the change log

mod addressbook;
mod objects;
mod seals;
mod watches;

pub use addressbook::{AddressBook, AddressBookReducer, IdentityInfo};
pub use objects::{missing_in, pair, MessageMetadata, ObjectState, ObjectsDb, ObjectsReducer};
pub use seals::{seal_uid, SealState, SealsDb, SealsReducer};
pub use watches::{watch_key, WatchState, WatchesDb, WatchesReducer};
