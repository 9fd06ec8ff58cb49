//! Object and message lifecycle projection
//!
//! One state per object version, keyed by link. Messages carry their
//! delivery status and their place in the per sender/recipient sequence;
//! every version carries its seal status.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::events::NodeEvent;
use crate::log::{Action, LogEntry, NewObject};
use crate::projection::{
    composite, ordered, Change, Index, IndexEntry, LiveOptions, LiveView, Projection,
    ReduceContext, Reducer,
};
use crate::types::{Link, SealStatus, SendStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub link: Link,
    pub permalink: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_link: Option<Link>,
    pub author: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Link>,
    pub kind: String,
    pub inbound: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealstatus: Option<SealStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sendstatus: Option<SendStatus>,
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_msg: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_link: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_permalink: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    /// Seq of the `newobj` entry that created this state
    pub log_seq: u64,
    pub timestamp: u64,
}

impl ObjectState {
    fn from_new(obj: &NewObject, entry: &LogEntry) -> Self {
        Self {
            link: obj.link,
            permalink: obj.permalink,
            prev_link: obj.prev_link,
            author: obj.author,
            recipient: obj.recipient,
            kind: obj.kind.clone(),
            inbound: obj.inbound,
            sealstatus: None,
            sendstatus: obj.sendstatus,
            archived: false,
            seq: obj.seq,
            prev_msg: obj.prev_msg,
            object_link: obj.object_link,
            object_permalink: obj.object_permalink,
            tx_id: None,
            confirmations: None,
            log_seq: entry.seq,
            timestamp: entry.timestamp,
        }
    }

    pub fn is_message(&self) -> bool {
        self.recipient.is_some()
    }

    /// Outbound message still waiting for delivery
    pub fn is_unsent(&self) -> bool {
        !self.inbound && self.sendstatus == Some(SendStatus::Pending)
    }
}

/// Index value of a sender -> recipient pair
pub fn pair(author: &Link, recipient: &Link) -> String {
    composite(&[&author.to_hex(), &recipient.to_hex()])
}

pub struct ObjectsReducer;

impl Reducer for ObjectsReducer {
    type State = ObjectState;
    const NAME: &'static str = "objects";

    fn filter(&self, action: &Action) -> bool {
        match action {
            Action::NewObj(_)
            | Action::ArchiveObj(_)
            | Action::UnarchiveObj(_)
            | Action::QueueSeal(_)
            | Action::WroteSeal(_)
            | Action::ReadSeal(_)
            | Action::Sent(_)
            | Action::SendAborted(_)
            | Action::ForgetObj(_) => true,
            Action::AddContact(_) | Action::NewWatch(_) => false,
        }
    }

    fn primary_key(
        &self,
        entry: &LogEntry,
        _ctx: &ReduceContext<'_, ObjectState>,
    ) -> NodeResult<Option<String>> {
        let link = match &entry.action {
            Action::NewObj(obj) => Some(obj.link),
            Action::ArchiveObj(r)
            | Action::UnarchiveObj(r)
            | Action::Sent(r)
            | Action::SendAborted(r)
            | Action::ForgetObj(r) => Some(r.link),
            Action::QueueSeal(seal) => Some(seal.link),
            Action::WroteSeal(seal) => Some(seal.link),
            Action::ReadSeal(seal) => seal.link,
            Action::AddContact(_) | Action::NewWatch(_) => None,
        };
        Ok(link.map(|l| l.to_hex()))
    }

    fn reduce(
        &self,
        state: Option<&ObjectState>,
        entry: &LogEntry,
        _ctx: &ReduceContext<'_, ObjectState>,
    ) -> NodeResult<Option<ObjectState>> {
        let next = match (&entry.action, state) {
            (Action::NewObj(obj), None) => Some(ObjectState::from_new(obj, entry)),
            (Action::NewObj(obj), Some(_)) => {
                return Err(NodeError::Exists(format!("object {}", obj.link)));
            }
            (Action::ForgetObj(_), _) => None,
            // Seal bookkeeping only applies to objects we hold
            (Action::QueueSeal(_) | Action::WroteSeal(_) | Action::ReadSeal(_), None) => None,
            (_, None) => {
                return Err(NodeError::NotFound(format!(
                    "{} for unknown object",
                    entry.topic()
                )));
            }
            (Action::ArchiveObj(_), Some(s)) => Some(ObjectState {
                archived: true,
                ..s.clone()
            }),
            (Action::UnarchiveObj(_), Some(s)) => Some(ObjectState {
                archived: false,
                ..s.clone()
            }),
            (Action::QueueSeal(_), Some(s)) => {
                let mut s = s.clone();
                if s.sealstatus != Some(SealStatus::Sealed) {
                    s.sealstatus = Some(SealStatus::Pending);
                }
                Some(s)
            }
            (Action::WroteSeal(seal), Some(s)) => Some(ObjectState {
                sealstatus: Some(SealStatus::Sealed),
                tx_id: Some(seal.tx_id.clone()),
                ..s.clone()
            }),
            (Action::ReadSeal(seal), Some(s)) => Some(ObjectState {
                sealstatus: Some(SealStatus::Sealed),
                tx_id: Some(seal.tx_id.clone()),
                confirmations: Some(s.confirmations.unwrap_or(0).max(seal.confirmations)),
                ..s.clone()
            }),
            (Action::Sent(_), Some(s)) => Some(transition_send(s, SendStatus::Sent)?),
            (Action::SendAborted(_), Some(s)) => Some(transition_send(s, SendStatus::Aborted)?),
            (Action::AddContact(_) | Action::NewWatch(_), Some(s)) => Some(s.clone()),
        };

        if let (Some(old), Some(new)) = (state, next.as_ref()) {
            if old.sendstatus == Some(SendStatus::Sent) && new.sendstatus == Some(SendStatus::Pending)
            {
                return Err(NodeError::Invariant(format!(
                    "message {} went from sent back to pending",
                    old.link
                )));
            }
        }
        Ok(next)
    }

    fn indexes(&self) -> Vec<Index<ObjectState>> {
        vec![
            Index::new("type", |s| {
                vec![IndexEntry::new(s.kind.clone(), ordered(s.log_seq))]
            }),
            Index::new("from", |s| {
                vec![IndexEntry::new(s.author.to_hex(), ordered(s.log_seq))]
            }),
            Index::new("to", |s| {
                s.recipient
                    .map(|r| IndexEntry::new(r.to_hex(), ordered(s.log_seq)))
                    .into_iter()
                    .collect()
            }),
            Index::new("unsent", |s| match (s.is_unsent(), s.recipient, s.seq) {
                (true, Some(r), Some(seq)) => {
                    vec![IndexEntry::new(r.to_hex(), ordered(seq as u64))]
                }
                _ => vec![],
            }),
            Index::new("sealstatus", |s| {
                s.sealstatus
                    .map(|st| IndexEntry::new(st.as_str(), ordered(s.log_seq)))
                    .into_iter()
                    .collect()
            }),
            Index::new("msgseq", |s| match (s.recipient, s.seq) {
                (Some(r), Some(seq)) => {
                    vec![IndexEntry::new(pair(&s.author, &r), ordered(seq as u64))]
                }
                _ => vec![],
            }),
            Index::new("conversation", |s| {
                s.recipient
                    .map(|r| IndexEntry::new(pair(&s.author, &r), ordered(s.log_seq)))
                    .into_iter()
                    .collect()
            }),
            Index::new("payload", |s| match (s.object_permalink, s.object_link) {
                (Some(p), Some(l)) => vec![IndexEntry::new(p.to_hex(), l.to_hex())],
                _ => vec![],
            }),
            Index::new("permalink", |s| {
                vec![IndexEntry::new(s.permalink.to_hex(), ordered(s.log_seq))]
            }),
            Index::new("prev", |s| {
                s.prev_link
                    .map(|p| IndexEntry::value(p.to_hex()))
                    .into_iter()
                    .collect()
            }),
        ]
    }

    fn object_link(&self, state: &ObjectState) -> Option<Link> {
        Some(state.link)
    }

    fn is_archived(&self, state: &ObjectState) -> bool {
        state.archived
    }
}

fn transition_send(state: &ObjectState, to: SendStatus) -> NodeResult<ObjectState> {
    match state.sendstatus {
        None => Err(NodeError::Validation(format!(
            "{} is not an outbound message",
            state.link
        ))),
        Some(current) if current == to => Ok(state.clone()),
        Some(SendStatus::Pending) => Ok(ObjectState {
            sendstatus: Some(to),
            ..state.clone()
        }),
        Some(current) => Err(NodeError::Validation(format!(
            "message {} is already {}",
            state.link,
            current.as_str()
        ))),
    }
}

/// Sequence position of the next outbound message to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadata {
    pub seq: u32,
    /// Link of the last message we sent to the same peer
    pub prev_to_sender: Option<Link>,
}

/// Queries over the objects projection
#[derive(Clone)]
pub struct ObjectsDb {
    projection: Arc<Projection<ObjectsReducer>>,
}

impl ObjectsDb {
    pub fn new(projection: Arc<Projection<ObjectsReducer>>) -> Self {
        Self { projection }
    }

    pub fn projection(&self) -> &Arc<Projection<ObjectsReducer>> {
        &self.projection
    }

    pub fn get(&self, link: &Link) -> NodeResult<Option<ObjectState>> {
        self.projection.get(&link.to_hex())
    }

    /// Latest known version of an object
    pub fn latest(&self, permalink: &Link) -> NodeResult<Option<ObjectState>> {
        self.projection.find_last("permalink", &permalink.to_hex())
    }

    /// Every known version, oldest first
    pub fn versions(&self, permalink: &Link) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("permalink", &permalink.to_hex())
    }

    /// Known versions whose previous version is `link`
    pub fn successors(&self, link: &Link) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("prev", &link.to_hex())
    }

    pub fn by_type(&self, kind: &str) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("type", kind)
    }

    pub fn by_status(&self, status: SealStatus) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("sealstatus", status.as_str())
    }

    pub fn from(&self, author: &Link) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("from", &author.to_hex())
    }

    pub fn to(&self, recipient: &Link) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("to", &recipient.to_hex())
    }

    /// Outbound messages to `recipient` still waiting for delivery, in seq order
    pub fn unsent(&self, recipient: &Link) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("unsent", &recipient.to_hex())
    }

    /// Messages carrying any version of the object `permalink`
    pub fn carrying(&self, permalink: &Link) -> NodeResult<Vec<ObjectState>> {
        self.projection.find("payload", &permalink.to_hex())
    }

    /// Message `from` sent to `to` with the given seq
    pub fn message_by_seq(&self, from: &Link, to: &Link, seq: u32) -> NodeResult<Option<ObjectState>> {
        let lo = ordered(seq as u64);
        let hi = ordered(seq as u64 + 1);
        Ok(self
            .projection
            .find_range("msgseq", &pair(from, to), &lo, &hi)?
            .into_iter()
            .next())
    }

    pub fn next_message_metadata(&self, me: &Link, peer: &Link) -> NodeResult<MessageMetadata> {
        Ok(match self.projection.find_last("msgseq", &pair(me, peer))? {
            Some(last) => MessageMetadata {
                seq: last.seq.map(|s| s + 1).unwrap_or(0),
                prev_to_sender: Some(last.link),
            },
            None => MessageMetadata {
                seq: 0,
                prev_to_sender: None,
            },
        })
    }

    /// Seqs in `0..=tip` we have no message for from `from` to `to`
    pub fn missing_messages(&self, from: &Link, to: &Link, tip: u32) -> NodeResult<Vec<u32>> {
        let seen = self
            .projection
            .scan_index("msgseq", &pair(from, to))?
            .into_iter()
            .filter_map(|(d, _)| d.parse::<u32>().ok());
        Ok(missing_in(seen, tip))
    }

    /// Live view of every object version
    pub fn live_all(&self, options: LiveOptions) -> NodeResult<LiveView<ObjectsReducer>> {
        self.projection.live_with(None, options)
    }

    /// Live view of the messages sent to `recipient`
    pub fn live_to(
        &self,
        recipient: &Link,
        options: LiveOptions,
    ) -> NodeResult<LiveView<ObjectsReducer>> {
        let value = recipient.to_hex();
        self.projection.live_with(Some(("to", value.as_str())), options)
    }

    /// Live view of the objects of one type
    pub fn live_type(&self, kind: &str, options: LiveOptions) -> NodeResult<LiveView<ObjectsReducer>> {
        self.projection.live_with(Some(("type", kind)), options)
    }

    /// Messages between `a` and `b` in both directions, in log order
    pub fn conversation(&self, a: &Link, b: &Link) -> NodeResult<Vec<ObjectState>> {
        let ab = self.projection.find("conversation", &pair(a, b))?;
        if a == b {
            return Ok(ab);
        }
        let ba = self.projection.find("conversation", &pair(b, a))?;
        Ok(merge_by_log_seq(ab, ba))
    }

    /// Map a fold step to the event it announces, if any
    pub fn domain_event(change: &Change<ObjectState>) -> Option<NodeEvent> {
        let new = change.new.as_ref()?;
        let old_status = change.old.as_ref().and_then(|o| o.sendstatus);
        match &change.entry.action {
            Action::NewObj(_) if change.old.is_none() && new.inbound && new.is_message() => {
                Some(NodeEvent::Message(new.clone()))
            }
            Action::Sent(_)
                if new.sendstatus == Some(SendStatus::Sent)
                    && old_status != Some(SendStatus::Sent) =>
            {
                Some(NodeEvent::Sent(new.clone()))
            }
            Action::SendAborted(_)
                if new.sendstatus == Some(SendStatus::Aborted)
                    && old_status != Some(SendStatus::Aborted) =>
            {
                Some(NodeEvent::SendAborted(new.clone()))
            }
            _ => None,
        }
    }
}

/// Gap scan over an ascending stream of seen seqs
pub fn missing_in(seen: impl IntoIterator<Item = u32>, tip: u32) -> Vec<u32> {
    gaps_from(0, seen, tip)
}

/// Seqs in `start..=tip` absent from `seen`
fn gaps_from(start: u32, seen: impl IntoIterator<Item = u32>, tip: u32) -> Vec<u32> {
    let mut missing = Vec::new();
    let mut expected = start;
    for seq in seen {
        if seq > tip {
            break;
        }
        if seq < expected {
            continue;
        }
        missing.extend(expected..seq);
        match seq.checked_add(1) {
            Some(next) => expected = next,
            // Nothing can follow the last sequence number
            None => return missing,
        }
    }
    if expected <= tip {
        missing.extend(expected..=tip);
    }
    missing
}

fn merge_by_log_seq(a: Vec<ObjectState>, b: Vec<ObjectState>) -> Vec<ObjectState> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => x.log_seq <= y.log_seq,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return out,
        };
        let next = if take_a { a.next() } else { b.next() };
        out.extend(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ObjectStore;
    use crate::identity::Ed25519Protocol;
    use crate::kv::MemoryStore;
    use crate::log::{ChangeLog, LinkRef, MemoryLog, QueueSeal};
    use crate::object::{Object, MESSAGE_KIND};
    use crate::projection::ProjectionOptions;
    use crate::types::{Network, PubKey};

    fn link(b: u8) -> Link {
        Link::from_bytes([b; 32])
    }

    fn setup() -> (Arc<ChangeLog>, ObjectsDb) {
        let (log, db, _) = setup_with_content();
        (log, db)
    }

    fn setup_with_content() -> (Arc<ChangeLog>, ObjectsDb, ObjectStore) {
        let kv = MemoryStore::shared();
        let content = ObjectStore::new(kv.clone(), Arc::new(Ed25519Protocol));
        let log = Arc::new(ChangeLog::new(Arc::new(MemoryLog::new()), 64).unwrap());
        let projection = Projection::new(
            ObjectsReducer,
            kv,
            content.clone(),
            log.clone(),
            ProjectionOptions::default(),
        )
        .unwrap();
        (log, ObjectsDb::new(Arc::new(projection)), content)
    }

    /// Inbound message from 1 to 2 whose stored body carries `n`
    fn stored_message(content: &ObjectStore, n: i64, seq: u32) -> (Link, Action) {
        let stored = content
            .put(&Object::new(MESSAGE_KIND).with("n", n).with("seq", seq))
            .unwrap();
        let mut obj = NewObject::object(stored, stored, None, link(1), MESSAGE_KIND);
        obj.recipient = Some(link(2));
        obj.seq = Some(seq);
        obj.object_link = Some(link(200));
        obj.object_permalink = Some(link(200));
        obj.inbound = true;
        (stored, Action::NewObj(obj))
    }

    fn message(l: u8, from: u8, to: u8, seq: u32, inbound: bool) -> Action {
        let mut obj = NewObject::object(link(l), link(l), None, link(from), MESSAGE_KIND);
        obj.recipient = Some(link(to));
        obj.seq = Some(seq);
        obj.object_link = Some(link(200));
        obj.object_permalink = Some(link(200));
        obj.inbound = inbound;
        if !inbound {
            obj.sendstatus = Some(SendStatus::Pending);
        }
        Action::NewObj(obj)
    }

    fn fold(log: &ChangeLog, db: &ObjectsDb, actions: Vec<Action>) {
        for action in actions {
            log.append(0, action).unwrap();
        }
        db.projection().catch_up().unwrap();
    }

    #[test]
    fn test_missing_in_gap_scan() {
        assert_eq!(missing_in([0, 1, 3, 4, 7], 8), vec![2, 5, 6, 8]);
        assert_eq!(missing_in([], 2), vec![0, 1, 2]);
        assert_eq!(missing_in([0, 1, 2], 2), Vec::<u32>::new());
        assert_eq!(missing_in([1, 9], 3), vec![0, 2, 3]);
    }

    #[test]
    fn test_gap_scan_reaches_last_seq() {
        let max = u32::MAX;
        assert_eq!(gaps_from(max - 2, [max - 1, max], max), vec![max - 2]);
        assert_eq!(gaps_from(max - 2, [max], max), vec![max - 2, max - 1]);
        assert_eq!(gaps_from(max, [max], max), Vec::<u32>::new());
        assert_eq!(gaps_from(max - 1, [], max), vec![max - 1, max]);
    }

    #[test]
    fn test_next_message_metadata_follows_last_seq() {
        let (log, db) = setup();
        let meta = db.next_message_metadata(&link(1), &link(2)).unwrap();
        assert_eq!(meta, MessageMetadata { seq: 0, prev_to_sender: None });

        fold(&log, &db, vec![message(10, 1, 2, 0, false), message(11, 1, 2, 1, false)]);
        let meta = db.next_message_metadata(&link(1), &link(2)).unwrap();
        assert_eq!(meta.seq, 2);
        assert_eq!(meta.prev_to_sender, Some(link(11)));
        // Other direction is independent
        assert_eq!(db.next_message_metadata(&link(2), &link(1)).unwrap().seq, 0);
    }

    #[test]
    fn test_missing_messages_reads_msgseq_index() {
        let (log, db) = setup();
        let msgs = [0u32, 1, 3, 4, 7]
            .iter()
            .enumerate()
            .map(|(i, seq)| message(20 + i as u8, 2, 1, *seq, true))
            .collect();
        fold(&log, &db, msgs);
        assert_eq!(db.missing_messages(&link(2), &link(1), 8).unwrap(), vec![2, 5, 6, 8]);
        assert!(db.message_by_seq(&link(2), &link(1), 3).unwrap().is_some());
        assert!(db.message_by_seq(&link(2), &link(1), 2).unwrap().is_none());
    }

    #[test]
    fn test_conversation_merges_by_log_position() {
        let (log, db) = setup();
        fold(
            &log,
            &db,
            vec![
                message(30, 1, 2, 0, false),
                message(31, 2, 1, 0, true),
                message(32, 2, 1, 1, true),
                message(33, 1, 2, 1, false),
            ],
        );
        let links: Vec<Link> = db
            .conversation(&link(1), &link(2))
            .unwrap()
            .iter()
            .map(|s| s.link)
            .collect();
        assert_eq!(links, vec![link(30), link(31), link(32), link(33)]);
    }

    #[test]
    fn test_send_status_transitions() {
        let (log, db) = setup();
        fold(&log, &db, vec![message(40, 1, 2, 0, false)]);
        assert_eq!(db.unsent(&link(2)).unwrap().len(), 1);

        fold(&log, &db, vec![Action::Sent(LinkRef { link: link(40) })]);
        let state = db.get(&link(40)).unwrap().unwrap();
        assert_eq!(state.sendstatus, Some(SendStatus::Sent));
        assert!(db.unsent(&link(2)).unwrap().is_empty());

        // Aborting a delivered message is rejected, state unchanged
        fold(&log, &db, vec![Action::SendAborted(LinkRef { link: link(40) })]);
        assert_eq!(
            db.get(&link(40)).unwrap().unwrap().sendstatus,
            Some(SendStatus::Sent)
        );
    }

    #[test]
    fn test_duplicate_newobj_keeps_first() {
        let (log, db) = setup();
        fold(&log, &db, vec![message(50, 1, 2, 0, true), message(50, 1, 2, 5, true)]);
        assert_eq!(db.get(&link(50)).unwrap().unwrap().seq, Some(0));
    }

    #[test]
    fn test_seal_status_and_latest_version() {
        let (log, db) = setup();
        let v1 = NewObject::object(link(60), link(60), None, link(1), "thang");
        let v2 = NewObject::object(link(61), link(60), Some(link(60)), link(1), "thang");
        fold(
            &log,
            &db,
            vec![
                Action::NewObj(v1),
                Action::NewObj(v2),
                Action::QueueSeal(QueueSeal {
                    link: link(60),
                    prev_link: None,
                    seal_address: "a".into(),
                    seal_prev_address: None,
                    base_pub_key: PubKey::from_bytes([1; 32]),
                    network: Network::new("bitcoin", "testnet"),
                    header_hash: None,
                }),
            ],
        );
        assert_eq!(db.latest(&link(60)).unwrap().unwrap().link, link(61));
        assert_eq!(db.versions(&link(60)).unwrap().len(), 2);
        assert_eq!(db.successors(&link(60)).unwrap()[0].link, link(61));
        assert_eq!(db.by_status(SealStatus::Pending).unwrap()[0].link, link(60));
    }

    #[test]
    fn test_forget_removes_state_and_indexes() {
        let (log, db) = setup();
        fold(&log, &db, vec![message(70, 1, 2, 0, true)]);
        assert_eq!(db.carrying(&link(200)).unwrap().len(), 1);
        fold(&log, &db, vec![Action::ForgetObj(LinkRef { link: link(70) })]);
        assert!(db.get(&link(70)).unwrap().is_none());
        assert!(db.carrying(&link(200)).unwrap().is_empty());
        assert!(db.to(&link(2)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_domain_events() {
        let (log, db) = setup();
        let mut rx = db.projection().subscribe();
        fold(
            &log,
            &db,
            vec![
                message(80, 2, 1, 0, true),
                message(81, 1, 2, 0, false),
                Action::Sent(LinkRef { link: link(81) }),
            ],
        );
        let mut kinds = Vec::new();
        while let Ok(change) = rx.try_recv() {
            if let Some(event) = ObjectsDb::domain_event(&change) {
                kinds.push(event.kind());
            }
        }
        assert_eq!(kinds, vec!["message", "sent"]);
    }

    #[tokio::test]
    async fn test_live_view_skips_archived_and_hydrates() {
        let (log, db, content) = setup_with_content();
        let (a, new_a) = stored_message(&content, 1, 0);
        let (b, new_b) = stored_message(&content, 2, 1);
        fold(&log, &db, vec![new_a, new_b, Action::ArchiveObj(LinkRef { link: a })]);

        let everything = db.live_to(&link(2), LiveOptions::default()).unwrap();
        assert_eq!(everything.snapshot.len(), 2);
        assert!(everything.snapshot.iter().all(|h| h.object.is_none()));

        let mut view = db.live_to(&link(2), LiveOptions::active().hydrated()).unwrap();
        assert_eq!(view.snapshot.len(), 1);
        assert_eq!(view.snapshot[0].state.link, b);
        let body = &view.snapshot[0].object.as_ref().unwrap().body;
        assert_eq!(body.get("n"), Some(&2.into()));

        let (c, new_c) = stored_message(&content, 3, 2);
        fold(&log, &db, vec![new_c]);
        let change = view.changes.recv().await.unwrap().unwrap();
        assert_eq!(change.key, c.to_hex());
        let hydrated = change.state.unwrap();
        assert_eq!(hydrated.object.unwrap().body.get("n"), Some(&3.into()));

        // Archiving takes a message out of the view, unarchiving brings it back
        fold(&log, &db, vec![Action::ArchiveObj(LinkRef { link: b })]);
        let change = view.changes.recv().await.unwrap().unwrap();
        assert_eq!(change.key, b.to_hex());
        assert!(change.state.is_none());

        fold(&log, &db, vec![Action::UnarchiveObj(LinkRef { link: a })]);
        let change = view.changes.recv().await.unwrap().unwrap();
        assert_eq!(change.key, a.to_hex());
        assert!(!change.state.unwrap().state.archived);
    }

    #[tokio::test]
    async fn test_live_view_ignores_other_index_values() {
        let (log, db) = setup();
        let mut view = db.live_to(&link(2), LiveOptions::default()).unwrap();
        fold(&log, &db, vec![message(91, 2, 3, 0, true), message(92, 1, 2, 0, true)]);
        let change = view.changes.recv().await.unwrap().unwrap();
        assert_eq!(change.key, link(92).to_hex());
        assert!(change.state.unwrap().object.is_none());
    }
}
