//! Watched addresses
//!
//! A watch lives until the seal transaction on its address has at least
//! `confirmed_after` confirmations; the fold step that observes that deletes
//! it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::log::{Action, LogEntry};
use crate::projection::{Index, IndexEntry, Projection, ReduceContext, Reducer};
use crate::types::{Link, Network, PubKey, WatchType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchState {
    pub address: String,
    pub link: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    pub watch_type: WatchType,
    pub base_pub_key: PubKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_hash: Option<String>,
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

impl WatchState {
    pub fn key(&self) -> String {
        watch_key(&self.address, &self.link)
    }
}

pub fn watch_key(address: &str, link: &Link) -> String {
    format!("{}:{}", address, link)
}

pub struct WatchesReducer {
    pub confirmed_after: u32,
}

impl Reducer for WatchesReducer {
    type State = WatchState;
    const NAME: &'static str = "watches";

    fn filter(&self, action: &Action) -> bool {
        matches!(action, Action::NewWatch(_) | Action::ReadSeal(_))
    }

    fn primary_key(
        &self,
        entry: &LogEntry,
        _ctx: &ReduceContext<'_, WatchState>,
    ) -> NodeResult<Option<String>> {
        Ok(match &entry.action {
            Action::NewWatch(w) => Some(watch_key(&w.address, &w.link)),
            // A next-version watch sits on the version we hold, which the
            // successor's seal names as its prev
            Action::ReadSeal(r) => match r.watch_type {
                WatchType::ThisVersion => match (&r.seal_address, &r.link) {
                    (Some(address), Some(link)) => Some(watch_key(address, link)),
                    _ => None,
                },
                WatchType::NextVersion => match (&r.seal_prev_address, &r.prev_link) {
                    (Some(address), Some(link)) => Some(watch_key(address, link)),
                    _ => None,
                },
            },
            _ => None,
        })
    }

    fn reduce(
        &self,
        state: Option<&WatchState>,
        entry: &LogEntry,
        _ctx: &ReduceContext<'_, WatchState>,
    ) -> NodeResult<Option<WatchState>> {
        match (&entry.action, state) {
            (Action::NewWatch(w), None) => Ok(Some(WatchState {
                address: w.address.clone(),
                link: w.link,
                prev_link: w.prev_link,
                watch_type: w.watch_type,
                base_pub_key: w.base_pub_key,
                header_hash: w.header_hash.clone(),
                network: w.network.clone(),
                confirmations: None,
                tx_id: None,
            })),
            (Action::NewWatch(w), Some(_)) => Err(NodeError::Exists(format!(
                "watch on {} for {}",
                w.address, w.link
            ))),
            (Action::ReadSeal(r), Some(w)) => {
                let confirmations = w.confirmations.unwrap_or(0).max(r.confirmations);
                if confirmations >= self.confirmed_after {
                    return Ok(None);
                }
                Ok(Some(WatchState {
                    confirmations: Some(confirmations),
                    tx_id: Some(r.tx_id.clone()),
                    ..w.clone()
                }))
            }
            (_, state) => Ok(state.cloned()),
        }
    }

    fn indexes(&self) -> Vec<Index<WatchState>> {
        vec![
            Index::new("address", |w| vec![IndexEntry::value(w.address.clone())]),
            Index::new("link", |w| vec![IndexEntry::value(w.link.to_hex())]),
            Index::new("network", |w| vec![IndexEntry::value(w.network.to_string())]),
        ]
    }
}

#[derive(Clone)]
pub struct WatchesDb {
    projection: Arc<Projection<WatchesReducer>>,
}

impl WatchesDb {
    pub fn new(projection: Arc<Projection<WatchesReducer>>) -> Self {
        Self { projection }
    }

    pub fn projection(&self) -> &Arc<Projection<WatchesReducer>> {
        &self.projection
    }

    pub fn get(&self, address: &str, link: &Link) -> NodeResult<Option<WatchState>> {
        self.projection.get(&watch_key(address, link))
    }

    pub fn all(&self) -> NodeResult<Vec<WatchState>> {
        Ok(self.projection.list()?.into_iter().map(|(_, w)| w).collect())
    }

    pub fn by_address(&self, address: &str) -> NodeResult<Vec<WatchState>> {
        self.projection.find("address", address)
    }

    pub fn for_link(&self, link: &Link) -> NodeResult<Vec<WatchState>> {
        self.projection.find("link", &link.to_hex())
    }
}
