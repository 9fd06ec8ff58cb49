//! Key layout of one projection inside its namespace
//!
//! ```text
//! s/<pk>                                  -> state (JSON)
//! i/<index>/<value>\0<disambig>\0<pk>     -> pk
//! m/cursor                                -> last folded seq (decimal)
//! ```

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{NodeError, NodeResult};
use crate::kv::{BatchOp, KeyValueStore, Sublevel};
use crate::projection::index::{Index, IndexEntry};

const CURSOR_KEY: &[u8] = b"m/cursor";

pub(crate) struct StateStore<S> {
    kv: Sublevel,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for StateStore<S> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            _state: PhantomData,
        }
    }
}

fn state_key(pk: &str) -> Vec<u8> {
    [b"s/".as_slice(), pk.as_bytes()].concat()
}

fn index_prefix(name: &str, value: &str) -> Vec<u8> {
    format!("i/{}/{}\0", name, value).into_bytes()
}

fn index_key(name: &str, entry: &IndexEntry, pk: &str) -> Vec<u8> {
    format!("i/{}/{}\0{}\0{}", name, entry.value, entry.disambiguator, pk).into_bytes()
}

impl<S: Serialize + DeserializeOwned> StateStore<S> {
    pub fn new(kv: Sublevel) -> Self {
        Self {
            kv,
            _state: PhantomData,
        }
    }

    pub fn get(&self, pk: &str) -> NodeResult<Option<S>> {
        match self.kv.get(&state_key(pk))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn cursor(&self) -> NodeResult<u64> {
        match self.kv.get(CURSOR_KEY)? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| NodeError::Storage("corrupt projection cursor".to_string())),
            None => Ok(0),
        }
    }

    pub fn cursor_op(seq: u64) -> BatchOp {
        BatchOp::put(CURSOR_KEY, seq.to_string())
    }

    /// Index entries as `(disambiguator, pk)` pairs in key order
    pub fn index_scan(&self, name: &str, value: &str) -> NodeResult<Vec<(String, String)>> {
        let prefix = index_prefix(name, value);
        let mut out = Vec::new();
        for (key, pk) in self.kv.scan_prefix(&prefix)? {
            let rest = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            let disambiguator = rest.split('\0').next().unwrap_or_default().to_string();
            out.push((disambiguator, String::from_utf8_lossy(&pk).into_owned()));
        }
        Ok(out)
    }

    pub fn find(&self, name: &str, value: &str) -> NodeResult<Vec<S>> {
        self.load_all(self.index_scan(name, value)?.into_iter().map(|(_, pk)| pk))
    }

    /// States whose disambiguator lies in `[from, to)`
    pub fn find_range(&self, name: &str, value: &str, from: &str, to: &str) -> NodeResult<Vec<S>> {
        let pks = self
            .index_scan(name, value)?
            .into_iter()
            .filter(|(d, _)| d.as_str() >= from && d.as_str() < to)
            .map(|(_, pk)| pk);
        self.load_all(pks)
    }

    fn load_all(&self, pks: impl Iterator<Item = String>) -> NodeResult<Vec<S>> {
        let mut out = Vec::new();
        for pk in pks {
            if let Some(state) = self.get(&pk)? {
                out.push(state);
            }
        }
        Ok(out)
    }

    pub fn list(&self) -> NodeResult<Vec<(String, S)>> {
        let mut out = Vec::new();
        for (key, bytes) in self.kv.scan_prefix(b"s/")? {
            let pk = String::from_utf8_lossy(&key[2..]).into_owned();
            out.push((pk, serde_json::from_slice(&bytes)?));
        }
        Ok(out)
    }

    pub fn keys(&self) -> NodeResult<Vec<String>> {
        Ok(self
            .kv
            .scan_prefix(b"s/")?
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key[2..]).into_owned())
            .collect())
    }

    /// Ops replacing `old` with `new` under `pk`, indexes included
    pub fn write_ops(
        &self,
        pk: &str,
        old: Option<&S>,
        new: Option<&S>,
        indexes: &[Index<S>],
    ) -> NodeResult<Vec<BatchOp>> {
        let mut ops = Vec::new();
        for index in indexes {
            let before = old.map(|s| (index.extract)(s)).unwrap_or_default();
            let after = new.map(|s| (index.extract)(s)).unwrap_or_default();
            for entry in before.iter().filter(|e| !after.contains(e)) {
                ops.push(BatchOp::del(index_key(index.name, entry, pk)));
            }
            for entry in after.iter().filter(|e| !before.contains(e)) {
                ops.push(BatchOp::put(index_key(index.name, entry, pk), pk));
            }
        }
        match new {
            Some(state) => ops.push(BatchOp::put(state_key(pk), serde_json::to_vec(state)?)),
            None => ops.push(BatchOp::del(state_key(pk))),
        }
        Ok(ops)
    }

    pub fn commit(&self, ops: Vec<BatchOp>) -> NodeResult<()> {
        self.kv.batch(ops)
    }
}
