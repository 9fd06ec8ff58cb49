use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::content::ObjectStore;
use crate::error::NodeResult;
use crate::log::{Action, LogEntry};
use crate::projection::index::Index;
use crate::projection::state::StateStore;
use crate::types::Link;

/// Folds log entries into keyed state.
///
/// Reducers are pure with respect to the log: given the same entries in the
/// same order they produce the same state, which is what makes rebuilding a
/// projection from an empty store equivalent to the incremental result.
pub trait Reducer: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Namespace of the projection in the key-value store
    const NAME: &'static str;

    /// Whether entries of this action concern the projection at all
    fn filter(&self, action: &Action) -> bool;

    /// Key of the state an entry updates; `None` skips the entry
    fn primary_key(
        &self,
        entry: &LogEntry,
        ctx: &ReduceContext<'_, Self::State>,
    ) -> NodeResult<Option<String>>;

    /// Next state for `primary_key`; `Ok(None)` deletes it
    fn reduce(
        &self,
        state: Option<&Self::State>,
        entry: &LogEntry,
        ctx: &ReduceContext<'_, Self::State>,
    ) -> NodeResult<Option<Self::State>>;

    fn indexes(&self) -> Vec<Index<Self::State>>;

    /// Stored object backing a state, for hydrated reads
    fn object_link(&self, _state: &Self::State) -> Option<Link> {
        None
    }

    /// Archived states are left out of live views that exclude them
    fn is_archived(&self, _state: &Self::State) -> bool {
        false
    }
}

/// Read access available to a reducer while folding
pub struct ReduceContext<'a, S> {
    pub(crate) store: &'a StateStore<S>,
    pub(crate) content: &'a ObjectStore,
}

impl<'a, S: Serialize + DeserializeOwned> ReduceContext<'a, S> {
    pub fn get(&self, pk: &str) -> NodeResult<Option<S>> {
        self.store.get(pk)
    }

    pub fn find(&self, index: &str, value: &str) -> NodeResult<Vec<S>> {
        self.store.find(index, value)
    }

    /// Primary keys under an index value
    pub fn find_keys(&self, index: &str, value: &str) -> NodeResult<Vec<String>> {
        Ok(self
            .store
            .index_scan(index, value)?
            .into_iter()
            .map(|(_, pk)| pk)
            .collect())
    }

    pub fn content(&self) -> &ObjectStore {
        self.content
    }
}

/// A state transition produced by one fold step
#[derive(Debug, Clone)]
pub struct Change<S> {
    pub entry: LogEntry,
    pub key: String,
    pub old: Option<S>,
    pub new: Option<S>,
}
