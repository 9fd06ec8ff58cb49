//! Incremental, persistent projections over the change log
//!
//! A [`Projection`] owns one [`Reducer`] and folds the log into keyed state
//! stored under the reducer's namespace. Every state change is committed in
//! one atomic batch together with its secondary index updates and the new
//! cursor, so a restarted node resumes exactly where it stopped and folding
//! the same entries twice is a no-op.
//!
//! Readers get point lookups, index scans and a `live` view: a snapshot of an
//! index value plus a receiver of every later [`Change`], taken under the
//! same lock the fold step commits and broadcasts under. [`LiveOptions`]
//! narrows a live view to non-archived states and joins each state with its
//! stored object.

mod index;
mod reducer;
mod state;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::content::ObjectStore;
use crate::error::{NodeError, NodeResult};
use crate::kv::{KeyValueStore, Sublevel};
use crate::log::{ChangeLog, LogEntry};
use crate::object::Object;

pub use index::{composite, ordered, Index, IndexEntry};
pub use reducer::{Change, ReduceContext, Reducer};

use state::StateStore;

/// Why a fold loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldHalt {
    pub projection: &'static str,
    pub seq: u64,
    pub reason: String,
}

impl std::fmt::Display for FoldHalt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "projection {} halted at seq {}: {}",
            self.projection, self.seq, self.reason
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectionOptions {
    /// Entries read from the log per round trip
    pub fold_batch_size: usize,
    /// Capacity of the change broadcast
    pub event_capacity: usize,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            fold_batch_size: 256,
            event_capacity: 1024,
        }
    }
}

/// State joined with the stored object it describes
#[derive(Debug, Clone)]
pub struct Hydrated<S> {
    pub state: S,
    pub object: Option<Object>,
}

/// Filtering and hydration of a live view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveOptions {
    pub include_archived: bool,
    pub hydrate: bool,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            include_archived: true,
            hydrate: false,
        }
    }
}

impl LiveOptions {
    /// Only states that are not archived
    pub fn active() -> Self {
        Self {
            include_archived: false,
            hydrate: false,
        }
    }

    pub fn hydrated(self) -> Self {
        Self {
            hydrate: true,
            ..self
        }
    }
}

/// One change as seen through a live view
#[derive(Debug, Clone)]
pub struct LiveChange<S> {
    pub entry: LogEntry,
    pub key: String,
    /// `None` when the state left the view: deleted, archived or moved to
    /// another index value
    pub state: Option<Hydrated<S>>,
}

/// Snapshot of a live view plus its later changes
pub struct LiveView<R: Reducer> {
    pub snapshot: Vec<Hydrated<R::State>>,
    pub changes: LiveChanges<R>,
}

/// Receiver half of a [`LiveView`]
pub struct LiveChanges<R: Reducer> {
    projection: Arc<Projection<R>>,
    index: Option<(String, String)>,
    options: LiveOptions,
    rx: broadcast::Receiver<Change<R::State>>,
}

impl<R: Reducer> LiveChanges<R> {
    /// Next change that touches the view; `Ok(None)` once the projection is gone.
    ///
    /// Falling behind the change broadcast is an error: the view can no longer
    /// be trusted and has to be reopened.
    pub async fn recv(&mut self) -> NodeResult<Option<LiveChange<R::State>>> {
        loop {
            let change = match self.rx.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(NodeError::Storage(format!(
                        "live view of {} lagged by {} changes",
                        R::NAME,
                        n
                    )))
                }
            };
            let was = change.old.as_ref().is_some_and(|s| self.admits(s));
            let now = change.new.as_ref().filter(|s| self.admits(s));
            let state = match now {
                Some(state) => Some(self.projection.hydrate(state.clone(), self.options.hydrate)?),
                None if was => None,
                None => continue,
            };
            return Ok(Some(LiveChange {
                entry: change.entry,
                key: change.key,
                state,
            }));
        }
    }

    fn admits(&self, state: &R::State) -> bool {
        let indexed = match &self.index {
            Some((index, value)) => self.projection.indexed_under(index, state, value),
            None => true,
        };
        indexed && (self.options.include_archived || !self.projection.reducer.is_archived(state))
    }
}

pub struct Projection<R: Reducer> {
    reducer: R,
    indexes: Vec<Index<R::State>>,
    store: StateStore<R::State>,
    content: ObjectStore,
    log: Arc<ChangeLog>,
    batch_size: usize,
    // Only one fold runs at a time
    fold_mutex: Mutex<()>,
    // Held for writing while a step commits and broadcasts
    fold_lock: RwLock<()>,
    folded_tx: watch::Sender<u64>,
    halted_tx: watch::Sender<Option<FoldHalt>>,
    changes_tx: broadcast::Sender<Change<R::State>>,
}

impl<R: Reducer> Projection<R> {
    pub fn new(
        reducer: R,
        kv: Arc<dyn KeyValueStore>,
        content: ObjectStore,
        log: Arc<ChangeLog>,
        options: ProjectionOptions,
    ) -> NodeResult<Self> {
        let store = StateStore::new(Sublevel::new(kv, R::NAME));
        let cursor = store.cursor()?;
        let (folded_tx, _) = watch::channel(cursor);
        let (halted_tx, _) = watch::channel(None);
        let (changes_tx, _) = broadcast::channel(options.event_capacity.max(1));
        Ok(Self {
            indexes: reducer.indexes(),
            reducer,
            store,
            content,
            log,
            batch_size: options.fold_batch_size.max(1),
            fold_mutex: Mutex::new(()),
            fold_lock: RwLock::new(()),
            folded_tx,
            halted_tx,
            changes_tx,
        })
    }

    pub fn name(&self) -> &'static str {
        R::NAME
    }

    pub fn reducer(&self) -> &R {
        &self.reducer
    }

    /// Fold every entry appended since the cursor.
    ///
    /// Returns the new cursor. Once a fold has failed with a fatal error the
    /// projection stays halted and every later call fails.
    pub fn catch_up(&self) -> NodeResult<u64> {
        let _fold = self.fold_mutex.lock();
        if let Some(halt) = self.halted() {
            return Err(NodeError::Invariant(halt.to_string()));
        }
        let mut cursor = self.folded();
        let result = self.fold_from(&mut cursor);
        if let Err(e) = &result {
            let halt = FoldHalt {
                projection: R::NAME,
                seq: cursor + 1,
                reason: e.to_string(),
            };
            error!(projection = R::NAME, seq = halt.seq, error = %e, "fold loop halted");
            self.halted_tx.send_replace(Some(halt));
        }
        result.map(|_| cursor)
    }

    fn fold_from(&self, cursor: &mut u64) -> NodeResult<()> {
        loop {
            let entries = self.log.read_from(*cursor + 1, self.batch_size)?;
            if entries.is_empty() {
                return Ok(());
            }
            let mut unsaved = false;
            for entry in entries {
                if entry.seq != *cursor + 1 {
                    return Err(NodeError::Storage(format!(
                        "log gap: expected seq {}, read {}",
                        *cursor + 1,
                        entry.seq
                    )));
                }
                let committed = self.fold_entry(&entry)?;
                *cursor = entry.seq;
                if !committed {
                    unsaved = true;
                    self.folded_tx.send_replace(entry.seq);
                } else {
                    unsaved = false;
                }
            }
            if unsaved {
                self.store
                    .commit(vec![StateStore::<R::State>::cursor_op(*cursor)])?;
            }
        }
    }

    /// Returns whether a state change was committed
    fn fold_entry(&self, entry: &LogEntry) -> NodeResult<bool> {
        if !self.reducer.filter(&entry.action) {
            return Ok(false);
        }
        let ctx = ReduceContext {
            store: &self.store,
            content: &self.content,
        };
        let key = match self.reducer.primary_key(entry, &ctx) {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(false),
            Err(e) => return self.reject(entry, e),
        };
        let old = self.store.get(&key)?;
        let new = match self.reducer.reduce(old.as_ref(), entry, &ctx) {
            Ok(new) => new,
            Err(e) => return self.reject(entry, e),
        };
        if old == new {
            return Ok(false);
        }

        let mut ops = self
            .store
            .write_ops(&key, old.as_ref(), new.as_ref(), &self.indexes)?;
        ops.push(StateStore::<R::State>::cursor_op(entry.seq));

        let _guard = self.fold_lock.write();
        self.store.commit(ops)?;
        self.folded_tx.send_replace(entry.seq);
        debug!(projection = R::NAME, seq = entry.seq, %key, "folded");
        let _ = self.changes_tx.send(Change {
            entry: entry.clone(),
            key,
            old,
            new,
        });
        Ok(true)
    }

    fn reject(&self, entry: &LogEntry, e: NodeError) -> NodeResult<bool> {
        if e.is_fatal() {
            return Err(e);
        }
        warn!(
            projection = R::NAME,
            seq = entry.seq,
            topic = %entry.topic(),
            error = %e,
            "entry rejected"
        );
        Ok(false)
    }

    /// Spawn the fold loop: catch up now and again on every new log head.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut head = this.log.watch_head();
            loop {
                head.borrow_and_update();
                if this.catch_up().is_err() {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = head.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn get(&self, key: &str) -> NodeResult<Option<R::State>> {
        self.store.get(key)
    }

    /// State plus the object [`Reducer::object_link`] points at
    pub fn get_hydrated(&self, key: &str) -> NodeResult<Option<Hydrated<R::State>>> {
        match self.store.get(key)? {
            Some(state) => Ok(Some(self.hydrate(state, true)?)),
            None => Ok(None),
        }
    }

    fn hydrate(&self, state: R::State, load: bool) -> NodeResult<Hydrated<R::State>> {
        let object = match self.reducer.object_link(&state) {
            Some(link) if load => self.content.get_opt(&link)?,
            _ => None,
        };
        Ok(Hydrated { state, object })
    }

    /// All states under an index value, ordered by disambiguator
    pub fn find(&self, index: &str, value: &str) -> NodeResult<Vec<R::State>> {
        self.store.find(index, value)
    }

    pub fn find_one(&self, index: &str, value: &str) -> NodeResult<Option<R::State>> {
        Ok(self.store.find(index, value)?.into_iter().next())
    }

    pub fn find_last(&self, index: &str, value: &str) -> NodeResult<Option<R::State>> {
        Ok(self.store.find(index, value)?.pop())
    }

    pub fn find_keys(&self, index: &str, value: &str) -> NodeResult<Vec<String>> {
        Ok(self
            .store
            .index_scan(index, value)?
            .into_iter()
            .map(|(_, pk)| pk)
            .collect())
    }

    /// Index entries as `(disambiguator, key)` pairs
    pub fn scan_index(&self, index: &str, value: &str) -> NodeResult<Vec<(String, String)>> {
        self.store.index_scan(index, value)
    }

    /// States under an index value whose disambiguator is in `[from, to)`
    pub fn find_range(
        &self,
        index: &str,
        value: &str,
        from: &str,
        to: &str,
    ) -> NodeResult<Vec<R::State>> {
        self.store.find_range(index, value, from, to)
    }

    pub fn list(&self) -> NodeResult<Vec<(String, R::State)>> {
        self.store.list()
    }

    pub fn keys(&self) -> NodeResult<Vec<String>> {
        self.store.keys()
    }

    /// Whether `state` has an entry with `value` in the named index
    pub fn indexed_under(&self, index: &str, state: &R::State, value: &str) -> bool {
        self.indexes
            .iter()
            .filter(|i| i.name == index)
            .flat_map(|i| (i.extract)(state))
            .any(|e| e.value == value)
    }

    /// Consistent snapshot of an index value plus every later change
    pub fn live(
        &self,
        index: &str,
        value: &str,
    ) -> NodeResult<(Vec<R::State>, broadcast::Receiver<Change<R::State>>)> {
        let _guard = self.fold_lock.read();
        let rx = self.changes_tx.subscribe();
        Ok((self.store.find(index, value)?, rx))
    }

    /// Consistent snapshot of every state plus every later change
    pub fn live_all(
        &self,
    ) -> NodeResult<(Vec<(String, R::State)>, broadcast::Receiver<Change<R::State>>)> {
        let _guard = self.fold_lock.read();
        let rx = self.changes_tx.subscribe();
        Ok((self.store.list()?, rx))
    }

    /// [`Projection::live`] with filtering and hydration; `index` of `None`
    /// covers every state
    pub fn live_with(
        self: &Arc<Self>,
        index: Option<(&str, &str)>,
        options: LiveOptions,
    ) -> NodeResult<LiveView<R>> {
        let (states, rx) = {
            let _guard = self.fold_lock.read();
            let rx = self.changes_tx.subscribe();
            let states = match index {
                Some((index, value)) => self.store.find(index, value)?,
                None => self.store.list()?.into_iter().map(|(_, s)| s).collect(),
            };
            (states, rx)
        };
        let snapshot = states
            .into_iter()
            .filter(|s| options.include_archived || !self.reducer.is_archived(s))
            .map(|s| self.hydrate(s, options.hydrate))
            .collect::<NodeResult<Vec<_>>>()?;
        Ok(LiveView {
            snapshot,
            changes: LiveChanges {
                projection: self.clone(),
                index: index.map(|(i, v)| (i.to_string(), v.to_string())),
                options,
                rx,
            },
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change<R::State>> {
        self.changes_tx.subscribe()
    }

    /// Seq of the last folded entry
    pub fn folded(&self) -> u64 {
        *self.folded_tx.borrow()
    }

    pub fn watch_folded(&self) -> watch::Receiver<u64> {
        self.folded_tx.subscribe()
    }

    pub fn halted(&self) -> Option<FoldHalt> {
        self.halted_tx.borrow().clone()
    }

    pub fn watch_halted(&self) -> watch::Receiver<Option<FoldHalt>> {
        self.halted_tx.subscribe()
    }

    /// Wait until the entry with `seq` has been folded
    pub async fn wait_for(&self, seq: u64) -> NodeResult<()> {
        let mut folded = self.folded_tx.subscribe();
        let mut halted = self.halted_tx.subscribe();
        loop {
            if *folded.borrow_and_update() >= seq {
                return Ok(());
            }
            if let Some(halt) = halted.borrow_and_update().clone() {
                return Err(NodeError::Invariant(halt.to_string()));
            }
            tokio::select! {
                _ = folded.changed() => {}
                _ = halted.changed() => {}
            }
        }
    }

    /// Wait until everything appended so far has been folded
    pub async fn wait_live(&self) -> NodeResult<()> {
        self.wait_for(self.log.head()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Ed25519Protocol;
    use crate::kv::MemoryStore;
    use crate::log::{Action, LinkRef, MemoryLog};
    use crate::types::Link;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tally {
        link: Link,
        count: u32,
    }

    /// Counts `sent` entries per link. `sendaborted` undoes one count, is
    /// rejected at zero and is fatal above five.
    struct Tallies;

    impl Reducer for Tallies {
        type State = Tally;
        const NAME: &'static str = "tallies";

        fn filter(&self, action: &Action) -> bool {
            matches!(action, Action::Sent(_) | Action::SendAborted(_))
        }

        fn primary_key(
            &self,
            entry: &LogEntry,
            _ctx: &ReduceContext<'_, Tally>,
        ) -> NodeResult<Option<String>> {
            Ok(match &entry.action {
                Action::Sent(r) | Action::SendAborted(r) => Some(r.link.to_hex()),
                _ => None,
            })
        }

        fn reduce(
            &self,
            state: Option<&Tally>,
            entry: &LogEntry,
            _ctx: &ReduceContext<'_, Tally>,
        ) -> NodeResult<Option<Tally>> {
            match (&entry.action, state) {
                (Action::Sent(r), None) => Ok(Some(Tally {
                    link: r.link,
                    count: 1,
                })),
                (Action::Sent(_), Some(t)) => Ok(Some(Tally {
                    count: t.count + 1,
                    ..t.clone()
                })),
                (Action::SendAborted(_), None) => {
                    Err(NodeError::Validation("nothing to undo".into()))
                }
                (Action::SendAborted(_), Some(t)) if t.count > 5 => {
                    Err(NodeError::Invariant("too many".into()))
                }
                (Action::SendAborted(_), Some(t)) if t.count == 1 => Ok(None),
                (Action::SendAborted(_), Some(t)) => Ok(Some(Tally {
                    count: t.count - 1,
                    ..t.clone()
                })),
                _ => Ok(state.cloned()),
            }
        }

        fn indexes(&self) -> Vec<Index<Tally>> {
            vec![Index::new("count", |t| {
                vec![IndexEntry::value(t.count.to_string())]
            })]
        }
    }

    fn link(b: u8) -> Link {
        Link::from_bytes([b; 32])
    }

    fn sent(b: u8) -> Action {
        Action::Sent(LinkRef { link: link(b) })
    }

    fn aborted(b: u8) -> Action {
        Action::SendAborted(LinkRef { link: link(b) })
    }

    struct Fixture {
        kv: Arc<dyn KeyValueStore>,
        log: Arc<ChangeLog>,
        content: ObjectStore,
    }

    impl Fixture {
        fn new() -> Self {
            let kv = MemoryStore::shared();
            Self {
                content: ObjectStore::new(kv.clone(), Arc::new(Ed25519Protocol)),
                log: Arc::new(ChangeLog::new(Arc::new(MemoryLog::new()), 64).unwrap()),
                kv,
            }
        }

        fn projection(&self) -> Projection<Tallies> {
            Projection::new(
                Tallies,
                self.kv.clone(),
                self.content.clone(),
                self.log.clone(),
                ProjectionOptions {
                    fold_batch_size: 2,
                    event_capacity: 64,
                },
            )
            .unwrap()
        }
    }

    #[test]
    fn test_fold_updates_state_and_index() {
        let f = Fixture::new();
        f.log.append(0, sent(1)).unwrap();
        f.log.append(0, sent(1)).unwrap();
        f.log.append(0, sent(2)).unwrap();

        let p = f.projection();
        assert_eq!(p.catch_up().unwrap(), 3);
        assert_eq!(p.get(&link(1).to_hex()).unwrap().unwrap().count, 2);
        assert_eq!(p.find("count", "1").unwrap()[0].link, link(2));
        assert!(p.find("count", "3").unwrap().is_empty());
        assert_eq!(p.keys().unwrap().len(), 2);
    }

    #[test]
    fn test_cursor_survives_restart() {
        let f = Fixture::new();
        f.log.append(0, sent(1)).unwrap();
        f.projection().catch_up().unwrap();

        f.log.append(0, sent(1)).unwrap();
        let p = f.projection();
        assert_eq!(p.folded(), 1);
        p.catch_up().unwrap();
        assert_eq!(p.get(&link(1).to_hex()).unwrap().unwrap().count, 2);
    }

    #[test]
    fn test_rejected_entry_only_advances_cursor() {
        let f = Fixture::new();
        f.log.append(0, aborted(1)).unwrap();
        f.log.append(0, sent(2)).unwrap();
        f.log.append(0, aborted(3)).unwrap();

        let p = f.projection();
        assert_eq!(p.catch_up().unwrap(), 3);
        assert!(p.get(&link(1).to_hex()).unwrap().is_none());
        assert!(p.halted().is_none());
        // The trailing rejected entry's cursor was persisted too
        assert_eq!(f.projection().folded(), 3);
    }

    #[test]
    fn test_delete_removes_index_entries() {
        let f = Fixture::new();
        f.log.append(0, sent(1)).unwrap();
        f.log.append(0, aborted(1)).unwrap();

        let p = f.projection();
        p.catch_up().unwrap();
        assert!(p.get(&link(1).to_hex()).unwrap().is_none());
        assert!(p.find_keys("count", "1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invariant_halts_and_fails_waiters() {
        let f = Fixture::new();
        for _ in 0..6 {
            f.log.append(0, sent(1)).unwrap();
        }
        f.log.append(0, aborted(1)).unwrap();
        f.log.append(0, sent(2)).unwrap();

        let p = f.projection();
        assert!(matches!(p.catch_up(), Err(NodeError::Invariant(_))));
        let halt = p.halted().unwrap();
        assert_eq!(halt.seq, 7);
        assert_eq!(p.folded(), 6);
        assert!(p.get(&link(2).to_hex()).unwrap().is_none());
        assert!(p.wait_for(8).await.is_err());
        assert!(p.catch_up().is_err());
    }

    #[tokio::test]
    async fn test_live_snapshot_then_changes() {
        let f = Fixture::new();
        f.log.append(0, sent(1)).unwrap();
        let p = Arc::new(f.projection());
        p.catch_up().unwrap();

        let (snapshot, mut rx) = p.live("count", "1").unwrap();
        assert_eq!(snapshot.len(), 1);

        f.log.append(0, sent(2)).unwrap();
        p.catch_up().unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, link(2).to_hex());
        assert!(change.old.is_none());
        assert!(p.indexed_under("count", change.new.as_ref().unwrap(), "1"));
    }

    #[tokio::test]
    async fn test_spawned_loop_follows_the_log() {
        let f = Fixture::new();
        let p = Arc::new(f.projection());
        let cancel = CancellationToken::new();
        let handle = p.spawn(cancel.clone());

        let entry = f.log.append(0, sent(4)).unwrap();
        p.wait_for(entry.seq).await.unwrap();
        assert_eq!(p.get(&link(4).to_hex()).unwrap().unwrap().count, 1);
        p.wait_live().await.unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_replay_matches_incremental_fold() {
        let f = Fixture::new();
        let p = f.projection();
        for b in [1, 2, 1, 3, 1] {
            f.log.append(0, sent(b)).unwrap();
            p.catch_up().unwrap();
        }
        f.log.append(0, aborted(2)).unwrap();
        p.catch_up().unwrap();

        let fresh = Fixture {
            kv: MemoryStore::shared(),
            log: f.log.clone(),
            content: f.content.clone(),
        };
        let replayed = fresh.projection();
        replayed.catch_up().unwrap();
        assert_eq!(replayed.list().unwrap(), p.list().unwrap());
    }
}
