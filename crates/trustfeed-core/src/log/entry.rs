//! Change-log entries and their per-topic payloads
//!
//! [`Action`] is a closed tagged union: one variant per [`Topic`], each with a
//! statically typed payload. Shape is enforced by construction;
//! [`Action::validate`] covers the cross-field rules types cannot express.

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::object::MESSAGE_KIND;
use crate::types::{Link, Network, PubKey, SendStatus, Topic, WatchType};

/// An immutable, sequenced entry of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Assigned by the log on append: starts at 1, gapless
    pub seq: u64,
    /// Unix millis stamped by the action emitter
    pub timestamp: u64,
    pub action: Action,
}

impl LogEntry {
    pub fn topic(&self) -> Topic {
        self.action.topic()
    }

    pub fn to_bytes(&self) -> NodeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload of every topic that only references an object by link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRef {
    pub link: Link,
}

/// `newobj`: an object or message entered the node (created or received)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObject {
    pub link: Link,
    pub permalink: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    /// Permalink of the author identity
    pub author: Link,
    /// Permalink of the recipient identity (messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Link>,
    pub kind: String,
    /// Received from a peer rather than created here
    #[serde(default)]
    pub inbound: bool,
    /// Per sender/recipient sequence number (messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    /// Previous message in the same sender/recipient sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_msg: Option<Link>,
    /// Link of the payload a message carries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_link: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_permalink: Option<Link>,
    /// `pending` for outbound messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sendstatus: Option<SendStatus>,
}

impl NewObject {
    /// A plain (non-message) object
    pub fn object(link: Link, permalink: Link, prev_link: Option<Link>, author: Link, kind: &str) -> Self {
        Self {
            link,
            permalink,
            prev_link,
            author,
            recipient: None,
            kind: kind.to_string(),
            inbound: false,
            seq: None,
            prev_msg: None,
            object_link: None,
            object_permalink: None,
            sendstatus: None,
        }
    }

    pub fn is_message(&self) -> bool {
        self.kind == MESSAGE_KIND
    }
}

/// `addcontact`: an identity version was learned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddContact {
    pub link: Link,
    pub permalink: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
}

/// `newwatch`: start monitoring an address for a seal transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWatch {
    pub address: String,
    /// The watched object version
    pub link: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    pub watch_type: WatchType,
    pub base_pub_key: PubKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_hash: Option<String>,
    pub network: Network,
}

/// `queueseal`: we want to seal `link`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSeal {
    pub link: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    pub seal_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_prev_address: Option<String>,
    pub base_pub_key: PubKey,
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_hash: Option<String>,
}

/// `wroteseal`: our seal transaction was submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WroteSeal {
    pub link: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    pub seal_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_prev_address: Option<String>,
    pub base_pub_key: PubKey,
    pub network: Network,
    pub tx_id: String,
}

/// `readseal`: a seal transaction was observed on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSeal {
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
    pub tx_id: String,
    pub confirmations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_hash: Option<String>,
    /// Type of the watch that matched
    pub watch_type: WatchType,
}

/// Tagged union of everything that can be appended to the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "lowercase")]
pub enum Action {
    NewObj(NewObject),
    ArchiveObj(LinkRef),
    UnarchiveObj(LinkRef),
    AddContact(AddContact),
    NewWatch(NewWatch),
    QueueSeal(QueueSeal),
    WroteSeal(WroteSeal),
    ReadSeal(ReadSeal),
    Sent(LinkRef),
    SendAborted(LinkRef),
    ForgetObj(LinkRef),
}

impl Action {
    pub fn topic(&self) -> Topic {
        match self {
            Action::NewObj(_) => Topic::NewObj,
            Action::ArchiveObj(_) => Topic::ArchiveObj,
            Action::UnarchiveObj(_) => Topic::UnarchiveObj,
            Action::AddContact(_) => Topic::AddContact,
            Action::NewWatch(_) => Topic::NewWatch,
            Action::QueueSeal(_) => Topic::QueueSeal,
            Action::WroteSeal(_) => Topic::WroteSeal,
            Action::ReadSeal(_) => Topic::ReadSeal,
            Action::Sent(_) => Topic::Sent,
            Action::SendAborted(_) => Topic::SendAborted,
            Action::ForgetObj(_) => Topic::ForgetObj,
        }
    }

    /// Cross-field checks run before anything is appended.
    pub fn validate(&self) -> NodeResult<()> {
        match self {
            Action::NewObj(obj) => validate_new_object(obj),
            Action::AddContact(contact) => {
                if contact.prev_link == Some(contact.link) {
                    return invalid("addcontact prev_link equals link");
                }
                if contact.prev_link.is_none() && contact.permalink != contact.link {
                    return invalid("first identity version must be its own permalink");
                }
                Ok(())
            }
            Action::NewWatch(watch) => {
                if watch.address.is_empty() {
                    return invalid("newwatch address is empty");
                }
                if watch.prev_link == Some(watch.link) {
                    return invalid("newwatch prev_link equals link");
                }
                Ok(())
            }
            Action::QueueSeal(seal) => {
                both_or_neither(
                    seal.prev_link.is_some(),
                    seal.seal_prev_address.is_some(),
                    "queueseal prev_link and seal_prev_address",
                )?;
                non_empty(&seal.seal_address, "queueseal seal_address")
            }
            Action::WroteSeal(seal) => {
                both_or_neither(
                    seal.prev_link.is_some(),
                    seal.seal_prev_address.is_some(),
                    "wroteseal prev_link and seal_prev_address",
                )?;
                non_empty(&seal.seal_address, "wroteseal seal_address")?;
                non_empty(&seal.tx_id, "wroteseal tx_id")
            }
            Action::ReadSeal(seal) => validate_read_seal(seal),
            Action::ArchiveObj(_)
            | Action::UnarchiveObj(_)
            | Action::Sent(_)
            | Action::SendAborted(_)
            | Action::ForgetObj(_) => Ok(()),
        }
    }
}

fn validate_new_object(obj: &NewObject) -> NodeResult<()> {
    if obj.kind.is_empty() {
        return invalid("newobj kind is empty");
    }
    if obj.prev_link == Some(obj.link) {
        return invalid("newobj prev_link equals link");
    }
    if obj.prev_link.is_none() && obj.permalink != obj.link {
        return invalid("first object version must be its own permalink");
    }
    if obj.is_message() {
        if obj.recipient.is_none() || obj.seq.is_none() {
            return invalid("message newobj needs recipient and seq");
        }
        if obj.object_link.is_none() || obj.object_permalink.is_none() {
            return invalid("message newobj needs object_link and object_permalink");
        }
        match (obj.inbound, obj.sendstatus) {
            (false, Some(SendStatus::Pending)) | (true, None) => Ok(()),
            (true, Some(_)) => invalid("inbound message cannot carry a sendstatus"),
            (false, _) => invalid("outbound message must start with sendstatus pending"),
        }
    } else {
        if obj.recipient.is_some() || obj.seq.is_some() || obj.sendstatus.is_some() {
            return invalid("only messages carry recipient, seq or sendstatus");
        }
        Ok(())
    }
}

fn validate_read_seal(seal: &ReadSeal) -> NodeResult<()> {
    non_empty(&seal.tx_id, "readseal tx_id")?;
    both_or_neither(
        seal.link.is_some(),
        seal.seal_address.is_some(),
        "readseal link and seal_address",
    )?;
    both_or_neither(
        seal.prev_link.is_some(),
        seal.seal_prev_address.is_some(),
        "readseal prev_link and seal_prev_address",
    )?;
    match seal.watch_type {
        WatchType::ThisVersion if seal.link.is_none() => {
            invalid("thisVersion readseal needs link and seal_address")
        }
        WatchType::NextVersion if seal.prev_link.is_none() => {
            invalid("nextVersion readseal needs prev_link and seal_prev_address")
        }
        _ => Ok(()),
    }
}

fn both_or_neither(a: bool, b: bool, what: &str) -> NodeResult<()> {
    if a != b {
        return invalid(&format!("{} must both be present or both absent", what));
    }
    Ok(())
}

fn non_empty(value: &str, what: &str) -> NodeResult<()> {
    if value.is_empty() {
        return invalid(&format!("{} is empty", what));
    }
    Ok(())
}

fn invalid(msg: &str) -> NodeResult<()> {
    Err(NodeError::Validation(msg.to_string()))
}
