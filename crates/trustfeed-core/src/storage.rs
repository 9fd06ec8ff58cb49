//! Persistent storage using redb.
//!
//! One database file holds:
//! - the change log (`changelog`, seq -> JSON entry)
//! - every projection and the content-addressed object store (`kv`)
//! - the node's own keys (`node_keys`)
//!
//! All handles share one `Arc<RwLock<Database>>`.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::identity::Keypair;
use crate::kv::{BatchOp, KeyValueStore};
use crate::log::{Action, LogEntry, LogStore};
use crate::types::Link;

const CHANGELOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("changelog");
const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");
const NODE_KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("node_keys");

const NODE_KEYS_KEY: &str = "node";

/// The node's own secrets and the permalink of the identity it published
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeKeys {
    pub sign_seed: [u8; 32],
    pub identity: Option<Link>,
}

impl NodeKeys {
    pub fn generate() -> NodeResult<Self> {
        Ok(Self {
            sign_seed: Keypair::generate()?.seed(),
            identity: None,
        })
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::from_seed(&self.sign_seed)
    }
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public", &self.keypair().public_key().to_hex())
            .field("identity", &self.identity)
            .finish()
    }
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open or create the database at `path`, creating parent directories
    /// and all tables.
    pub fn new(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CHANGELOG_TABLE)?;
            let _ = write_txn.open_table(KV_TABLE)?;
            let _ = write_txn.open_table(NODE_KEYS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Shared database handle
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    /// Change log backed by this database
    pub fn log(&self) -> RedbLog {
        RedbLog {
            db: self.db.clone(),
        }
    }

    /// Key-value store backed by this database
    pub fn kv(&self) -> RedbStore {
        RedbStore {
            db: self.db.clone(),
        }
    }

    pub fn save_keys(&self, keys: &NodeKeys) -> NodeResult<()> {
        let data =
            postcard::to_allocvec(keys).map_err(|e| NodeError::Serialization(e.to_string()))?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(NODE_KEYS_TABLE)?;
            table.insert(NODE_KEYS_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_keys(&self) -> NodeResult<Option<NodeKeys>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NODE_KEYS_TABLE)?;
        match table.get(NODE_KEYS_KEY)? {
            Some(v) => {
                let keys = postcard::from_bytes(v.value())
                    .map_err(|e| NodeError::Serialization(e.to_string()))?;
                Ok(Some(keys))
            }
            None => Ok(None),
        }
    }
}

/// [`LogStore`] on the `changelog` table
#[derive(Clone)]
pub struct RedbLog {
    db: Arc<RwLock<Database>>,
}

impl LogStore for RedbLog {
    fn append(&self, timestamp: u64, action: Action) -> NodeResult<LogEntry> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let entry = {
            let mut table = write_txn.open_table(CHANGELOG_TABLE)?;
            let head = match table.last()? {
                Some((k, _)) => k.value(),
                None => 0,
            };
            let entry = LogEntry {
                seq: head + 1,
                timestamp,
                action,
            };
            table.insert(entry.seq, entry.to_bytes()?.as_slice())?;
            entry
        };
        write_txn.commit()?;
        Ok(entry)
    }

    fn read_from(&self, seq: u64, limit: usize) -> NodeResult<Vec<LogEntry>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHANGELOG_TABLE)?;

        let mut entries = Vec::new();
        for item in table.range(seq.max(1)..)?.take(limit) {
            let (_, value) = item?;
            entries.push(LogEntry::from_bytes(value.value())?);
        }
        Ok(entries)
    }

    fn head(&self) -> NodeResult<u64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHANGELOG_TABLE)?;
        let head = table.last()?.map(|(k, _)| k.value()).unwrap_or(0);
        Ok(head)
    }
}

/// [`KeyValueStore`] on the `kv` table
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl KeyValueStore for RedbStore {
    fn get(&self, key: &[u8]) -> NodeResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> NodeResult<()> {
        self.batch(vec![BatchOp::put(key, value)])
    }

    fn del(&self, key: &[u8]) -> NodeResult<()> {
        self.batch(vec![BatchOp::del(key)])
    }

    fn batch(&self, ops: Vec<BatchOp>) -> NodeResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Del { key } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> NodeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        let mut out = Vec::new();
        for item in table.range(prefix..)? {
            let (key, value) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.value().to_vec()));
        }
        Ok(out)
    }
}
