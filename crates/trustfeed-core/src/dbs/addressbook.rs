//! Known identities, by permalink, key, fingerprint and link

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::log::{Action, LogEntry};
use crate::object::Identity;
use crate::projection::{Index, IndexEntry, Projection, ReduceContext, Reducer};
use crate::types::{Link, PubKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub permalink: Link,
    pub link: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    pub identity: Identity,
}

pub struct AddressBookReducer;

impl AddressBookReducer {
    fn check_collisions(
        info: &IdentityInfo,
        ctx: &ReduceContext<'_, IdentityInfo>,
    ) -> NodeResult<()> {
        let own = info.permalink.to_hex();
        for key in &info.identity.pub_keys {
            let claims = [
                ("pubkey", key.pub_key.to_hex()),
                ("fingerprint", key.fingerprint.clone()),
            ];
            for (index, value) in claims {
                if ctx.find_keys(index, &value)?.iter().any(|pk| *pk != own) {
                    return Err(NodeError::Collision(format!(
                        "{} {} is claimed by another identity",
                        index, value
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Reducer for AddressBookReducer {
    type State = IdentityInfo;
    const NAME: &'static str = "addressbook";

    fn filter(&self, action: &Action) -> bool {
        matches!(action, Action::AddContact(_))
    }

    fn primary_key(
        &self,
        entry: &LogEntry,
        _ctx: &ReduceContext<'_, IdentityInfo>,
    ) -> NodeResult<Option<String>> {
        Ok(match &entry.action {
            Action::AddContact(c) => Some(c.permalink.to_hex()),
            _ => None,
        })
    }

    fn reduce(
        &self,
        state: Option<&IdentityInfo>,
        entry: &LogEntry,
        ctx: &ReduceContext<'_, IdentityInfo>,
    ) -> NodeResult<Option<IdentityInfo>> {
        let Action::AddContact(contact) = &entry.action else {
            return Ok(state.cloned());
        };
        if let Some(current) = state {
            if current.link == contact.link {
                return Ok(Some(current.clone()));
            }
            if contact.prev_link != Some(current.link) {
                return Err(NodeError::InvalidVersion(format!(
                    "identity {} is at {}, update builds on {:?}",
                    current.permalink, current.link, contact.prev_link
                )));
            }
        }
        let object = ctx.content().get(&contact.link)?;
        let info = IdentityInfo {
            permalink: contact.permalink,
            link: contact.link,
            prev_link: contact.prev_link,
            identity: Identity::from_object(&object)?,
        };
        Self::check_collisions(&info, ctx)?;
        Ok(Some(info))
    }

    fn indexes(&self) -> Vec<Index<IdentityInfo>> {
        vec![
            Index::new("pubkey", |i| {
                i.identity
                    .pub_keys
                    .iter()
                    .map(|k| IndexEntry::value(k.pub_key.to_hex()))
                    .collect()
            }),
            Index::new("fingerprint", |i| {
                i.identity
                    .pub_keys
                    .iter()
                    .map(|k| IndexEntry::value(k.fingerprint.clone()))
                    .collect()
            }),
            Index::new("link", |i| vec![IndexEntry::value(i.link.to_hex())]),
        ]
    }

    fn object_link(&self, state: &IdentityInfo) -> Option<Link> {
        Some(state.link)
    }
}

#[derive(Clone)]
pub struct AddressBook {
    projection: Arc<Projection<AddressBookReducer>>,
}

impl AddressBook {
    pub fn new(projection: Arc<Projection<AddressBookReducer>>) -> Self {
        Self { projection }
    }

    pub fn projection(&self) -> &Arc<Projection<AddressBookReducer>> {
        &self.projection
    }

    pub fn by_permalink(&self, permalink: &Link) -> NodeResult<Option<IdentityInfo>> {
        self.projection.get(&permalink.to_hex())
    }

    pub fn by_pub_key(&self, pub_key: &PubKey) -> NodeResult<Option<IdentityInfo>> {
        self.projection.find_one("pubkey", &pub_key.to_hex())
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> NodeResult<Option<IdentityInfo>> {
        self.projection.find_one("fingerprint", fingerprint)
    }

    pub fn by_link(&self, link: &Link) -> NodeResult<Option<IdentityInfo>> {
        self.projection.find_one("link", &link.to_hex())
    }

    /// Like [`by_permalink`](Self::by_permalink) but a miss is an error
    pub fn lookup(&self, permalink: &Link) -> NodeResult<IdentityInfo> {
        self.by_permalink(permalink)?
            .ok_or_else(|| NodeError::UnknownIdentity(permalink.to_hex()))
    }

    pub fn all(&self) -> NodeResult<Vec<IdentityInfo>> {
        Ok(self.projection.list()?.into_iter().map(|(_, i)| i).collect())
    }
}
