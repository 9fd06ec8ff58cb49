//! Seal lifecycle projection
//!
//! A seal is keyed by its network and the address its transaction pays to:
//! the seal-prev address when the sealed version has a predecessor, the seal
//! address otherwise. A `thisVersion` read that only knows the seal address is
//! folded into the seal already registered under that address on the same
//! network.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::content::ObjectStore;
use crate::error::{NodeError, NodeResult};
use crate::events::NodeEvent;
use crate::log::{Action, LogEntry, QueueSeal, ReadSeal, WroteSeal};
use crate::projection::{Change, Index, IndexEntry, Projection, ReduceContext, Reducer};
use crate::types::{Link, Network, PubKey, SealStatus, WatchType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealState {
    /// Primary key: network id followed by the seal's address
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_prev_address: Option<String>,
    pub base_pub_key: PubKey,
    pub network: Network,
    pub status: SealStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_hash: Option<String>,
}

impl SealState {
    pub fn is_sealed(&self) -> bool {
        self.status == SealStatus::Sealed
    }
}

/// Seal key of `address` on `network`
pub fn seal_uid(network: &Network, address: &str) -> String {
    format!("{}:{}", network, address)
}

fn queued(seal: &QueueSeal, key: &str) -> SealState {
    SealState {
        uid: key.to_string(),
        link: Some(seal.link),
        prev_link: seal.prev_link,
        seal_address: Some(seal.seal_address.clone()),
        seal_prev_address: seal.seal_prev_address.clone(),
        base_pub_key: seal.base_pub_key,
        network: seal.network.clone(),
        status: SealStatus::Pending,
        tx_id: None,
        confirmations: None,
        header_hash: seal.header_hash.clone(),
    }
}

fn wrote(state: Option<&SealState>, seal: &WroteSeal, key: &str) -> SealState {
    let mut next = state.cloned().unwrap_or_else(|| SealState {
        uid: key.to_string(),
        link: Some(seal.link),
        prev_link: seal.prev_link,
        seal_address: Some(seal.seal_address.clone()),
        seal_prev_address: seal.seal_prev_address.clone(),
        base_pub_key: seal.base_pub_key,
        network: seal.network.clone(),
        status: SealStatus::Sealed,
        tx_id: None,
        confirmations: None,
        header_hash: None,
    });
    next.status = SealStatus::Sealed;
    next.tx_id = Some(seal.tx_id.clone());
    next
}

fn read(state: Option<&SealState>, seal: &ReadSeal, key: &str) -> SealState {
    let mut next = state.cloned().unwrap_or_else(|| SealState {
        uid: key.to_string(),
        link: None,
        prev_link: None,
        seal_address: None,
        seal_prev_address: None,
        base_pub_key: seal.base_pub_key,
        network: seal.network.clone(),
        status: SealStatus::Sealed,
        tx_id: None,
        confirmations: None,
        header_hash: None,
    });
    next.status = SealStatus::Sealed;
    next.link = next.link.or(seal.link);
    next.prev_link = next.prev_link.or(seal.prev_link);
    next.seal_address = next.seal_address.take().or_else(|| seal.seal_address.clone());
    next.seal_prev_address = next
        .seal_prev_address
        .take()
        .or_else(|| seal.seal_prev_address.clone());
    next.tx_id = Some(seal.tx_id.clone());
    next.confirmations = Some(next.confirmations.unwrap_or(0).max(seal.confirmations));
    if seal.header_hash.is_some() {
        next.header_hash = seal.header_hash.clone();
    }
    next
}

pub struct SealsReducer;

impl Reducer for SealsReducer {
    type State = SealState;
    const NAME: &'static str = "seals";

    fn filter(&self, action: &Action) -> bool {
        matches!(
            action,
            Action::QueueSeal(_) | Action::WroteSeal(_) | Action::ReadSeal(_)
        )
    }

    fn primary_key(
        &self,
        entry: &LogEntry,
        ctx: &ReduceContext<'_, SealState>,
    ) -> NodeResult<Option<String>> {
        Ok(match &entry.action {
            Action::QueueSeal(s) => Some(seal_uid(
                &s.network,
                s.seal_prev_address.as_ref().unwrap_or(&s.seal_address),
            )),
            Action::WroteSeal(s) => Some(seal_uid(
                &s.network,
                s.seal_prev_address.as_ref().unwrap_or(&s.seal_address),
            )),
            Action::ReadSeal(s) => match (&s.seal_prev_address, &s.seal_address) {
                (Some(prev), _) => Some(seal_uid(&s.network, prev)),
                (None, Some(address)) => {
                    let uid = seal_uid(&s.network, address);
                    Some(ctx.find_keys("address", &uid)?.into_iter().next().unwrap_or(uid))
                }
                (None, None) => None,
            },
            _ => None,
        })
    }

    fn reduce(
        &self,
        state: Option<&SealState>,
        entry: &LogEntry,
        ctx: &ReduceContext<'_, SealState>,
    ) -> NodeResult<Option<SealState>> {
        let key = self
            .primary_key(entry, ctx)?
            .ok_or_else(|| NodeError::Validation("seal entry without address".to_string()))?;
        let next = match (&entry.action, state) {
            (Action::QueueSeal(seal), None) => queued(seal, &key),
            (Action::QueueSeal(seal), Some(existing)) => {
                if existing.is_sealed() {
                    existing.clone()
                } else {
                    return Err(NodeError::Exists(format!("seal of {}", seal.link)));
                }
            }
            (Action::WroteSeal(seal), state) => wrote(state, seal, &key),
            (Action::ReadSeal(seal), state) => read(state, seal, &key),
            _ => return Ok(state.cloned()),
        };
        if let Some(old) = state {
            if old.is_sealed() && !next.is_sealed() {
                return Err(NodeError::Invariant(format!("seal {} went back to pending", old.uid)));
            }
        }
        Ok(Some(next))
    }

    fn indexes(&self) -> Vec<Index<SealState>> {
        vec![
            Index::new("status", |s| vec![IndexEntry::value(s.status.as_str())]),
            Index::new("link", |s| {
                s.link
                    .map(|l| IndexEntry::value(l.to_hex()))
                    .into_iter()
                    .collect()
            }),
            Index::new("address", |s| {
                s.seal_address
                    .iter()
                    .chain(s.seal_prev_address.iter())
                    .map(|address| IndexEntry::value(seal_uid(&s.network, address)))
                    .collect()
            }),
            Index::new("network", |s| vec![IndexEntry::value(s.network.to_string())]),
        ]
    }
}

/// Queries and events over the seals projection
#[derive(Clone)]
pub struct SealsDb {
    projection: Arc<Projection<SealsReducer>>,
    content: ObjectStore,
    confirmed_after: u32,
}

impl SealsDb {
    pub fn new(
        projection: Arc<Projection<SealsReducer>>,
        content: ObjectStore,
        confirmed_after: u32,
    ) -> Self {
        Self {
            projection,
            content,
            confirmed_after,
        }
    }

    pub fn projection(&self) -> &Arc<Projection<SealsReducer>> {
        &self.projection
    }

    pub fn get(&self, key: &str) -> NodeResult<Option<SealState>> {
        self.projection.get(key)
    }

    pub fn pending(&self) -> NodeResult<Vec<SealState>> {
        self.projection.find("status", SealStatus::Pending.as_str())
    }

    pub fn sealed(&self) -> NodeResult<Vec<SealState>> {
        self.projection.find("status", SealStatus::Sealed.as_str())
    }

    /// Seals of one object version
    pub fn for_link(&self, link: &Link) -> NodeResult<Vec<SealState>> {
        self.projection.find("link", &link.to_hex())
    }

    /// The seal paying to `address` on `network`, as seal or seal-prev address
    pub fn by_address(&self, network: &Network, address: &str) -> NodeResult<Option<SealState>> {
        self.projection.find_one("address", &seal_uid(network, address))
    }

    /// Events announced by a fold step
    pub fn domain_events(&self, change: &Change<SealState>) -> NodeResult<Vec<NodeEvent>> {
        let Some(new) = change.new.as_ref() else {
            return Ok(vec![]);
        };
        let old = change.old.as_ref();
        let mut events = Vec::new();
        match &change.entry.action {
            Action::WroteSeal(_) => {
                if old.map(|o| o.status) == Some(SealStatus::Pending) && new.is_sealed() {
                    events.push(NodeEvent::WroteSeal(new.clone()));
                }
            }
            Action::ReadSeal(seal) => {
                let first_read = old.and_then(|o| o.confirmations).is_none();
                if first_read {
                    events.push(NodeEvent::ReadSeal(new.clone()));
                }
                let before = old.and_then(|o| o.confirmations).unwrap_or(0);
                let after = new.confirmations.unwrap_or(0);
                if before < self.confirmed_after && after >= self.confirmed_after {
                    events.push(NodeEvent::SealConfirmed(new.clone()));
                }
                if first_read && seal.watch_type == WatchType::NextVersion {
                    let held = match new.link {
                        Some(link) => self.content.has(&link)?,
                        None => false,
                    };
                    if !held {
                        events.push(NodeEvent::NewVersion(new.clone()));
                    }
                }
            }
            _ => {}
        }
        Ok(events)
    }
}
