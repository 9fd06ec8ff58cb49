//! Key-value store abstraction
//!
//! Projections and the content-addressed object store only need ordered
//! byte keys with atomic single-key writes and atomic batches. [`MemoryStore`]
//! backs tests and replays; `storage::RedbStore` backs running nodes.
//! [`Sublevel`] namespaces one store into many by key prefix.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::NodeResult;

/// One write in an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        BatchOp::Del { key: key.into() }
    }

    fn prefixed(self, prefix: &[u8]) -> Self {
        match self {
            BatchOp::Put { key, value } => BatchOp::Put {
                key: [prefix, key.as_slice()].concat(),
                value,
            },
            BatchOp::Del { key } => BatchOp::Del {
                key: [prefix, key.as_slice()].concat(),
            },
        }
    }
}

/// Ordered byte key-value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> NodeResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> NodeResult<()>;

    fn del(&self, key: &[u8]) -> NodeResult<()>;

    /// Apply all ops atomically
    fn batch(&self, ops: Vec<BatchOp>) -> NodeResult<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> NodeResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory ordered store
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle, ready to pass where an `Arc<dyn KeyValueStore>` is expected
    pub fn shared() -> Arc<dyn KeyValueStore> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> NodeResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> NodeResult<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> NodeResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> NodeResult<()> {
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Del { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> NodeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// A prefix-namespaced view of another store.
///
/// Keys passed in and returned are relative to the namespace.
#[derive(Clone)]
pub struct Sublevel {
    inner: Arc<dyn KeyValueStore>,
    prefix: Vec<u8>,
}

impl Sublevel {
    /// Namespace `inner` under `name`
    pub fn new(inner: Arc<dyn KeyValueStore>, name: &str) -> Self {
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(b'/');
        Self { inner, prefix }
    }

    /// Nested namespace
    pub fn sublevel(&self, name: &str) -> Self {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(name.as_bytes());
        prefix.push(b'/');
        Self {
            inner: self.inner.clone(),
            prefix,
        }
    }

    fn key(&self, key: &[u8]) -> Vec<u8> {
        [self.prefix.as_slice(), key].concat()
    }

    /// Translate relative ops into ops on the underlying store, so several
    /// sublevels can commit in one atomic batch.
    pub fn ops(&self, ops: Vec<BatchOp>) -> Vec<BatchOp> {
        ops.into_iter().map(|op| op.prefixed(&self.prefix)).collect()
    }

    /// Underlying store, for cross-namespace batches
    pub fn root(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner
    }
}

impl KeyValueStore for Sublevel {
    fn get(&self, key: &[u8]) -> NodeResult<Option<Vec<u8>>> {
        self.inner.get(&self.key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> NodeResult<()> {
        self.inner.put(&self.key(key), value)
    }

    fn del(&self, key: &[u8]) -> NodeResult<()> {
        self.inner.del(&self.key(key))
    }

    fn batch(&self, ops: Vec<BatchOp>) -> NodeResult<()> {
        self.inner.batch(self.ops(ops))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> NodeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let plen = self.prefix.len();
        Ok(self
            .inner
            .scan_prefix(&self.key(prefix))?
            .into_iter()
            .map(|(k, v)| (k[plen..].to_vec(), v))
            .collect())
    }
}
