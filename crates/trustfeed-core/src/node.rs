//! The node: wires the change log, projections and background components
//! together and exposes the public API.
//!
//! Every public operation follows the same path: check what can be checked
//! against current projections, append through [`Actions`], then wait for
//! the owning projection to fold the new entry so the caller reads its own
//! write. Background components react to projection changes on their own.
//!
//! # Example
//!
//! ```ignore
//! use trustfeed_core::node::{Node, NodeOptions};
//! use trustfeed_core::object::Object;
//! use trustfeed_core::storage::NodeKeys;
//!
//! let alice = Node::open(NodeOptions::memory(NodeKeys::generate()?).named("alice")).await?;
//! alice.add_contact(bob_identity).await?;
//! alice.start()?;
//!
//! let message = alice
//!     .sign_and_send(Object::new("thang").with("a", 1), &bob_permalink)
//!     .await?;
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::Actions;
use crate::chain::{Adapters, NoTransactor, Transactor};
use crate::config::NodeConfig;
use crate::content::ObjectStore;
use crate::dbs::{
    seal_uid, AddressBook, AddressBookReducer, IdentityInfo, ObjectState, ObjectsDb,
    ObjectsReducer, SealState, SealsDb, SealsReducer, WatchState, WatchesDb, WatchesReducer,
};
use crate::error::{NodeError, NodeResult};
use crate::events::NodeEvent;
use crate::identity::{Ed25519Protocol, Keypair, Protocol};
use crate::kv::{KeyValueStore, MemoryStore};
use crate::locks::Locks;
use crate::log::{AddContact, ChangeLog, LogStore, MemoryLog, NewObject, NewWatch, QueueSeal};
use crate::object::{Identity, MessageBody, Object, PubKeyInfo, MESSAGE_KIND, SIGN_PURPOSE};
use crate::projection::{Change, FoldHalt, Projection, Reducer};
use crate::sealer::Sealer;
use crate::sealwatch::{SealWatcher, WatcherConfig};
use crate::sender::{Deliver, Sender, Undeliverable};
use crate::storage::{NodeKeys, Storage};
use crate::types::{Link, Network, PubKey, SendStatus, WatchType};

/// Database file inside a node's data directory
pub const DB_FILE: &str = "trustfeed.redb";

/// Everything a node is assembled from
pub struct NodeOptions {
    pub config: NodeConfig,
    pub keys: NodeKeys,
    /// Name published in a freshly created identity
    pub name: Option<String>,
    pub kv: Arc<dyn KeyValueStore>,
    pub log: Arc<dyn LogStore>,
    pub protocol: Arc<dyn Protocol>,
    pub adapters: Adapters,
    pub transactor: Arc<dyn Transactor>,
    pub deliver: Arc<dyn Deliver>,
}

impl NodeOptions {
    /// In-memory node with no chains and no transport
    pub fn memory(keys: NodeKeys) -> Self {
        Self {
            config: NodeConfig::default(),
            keys,
            name: None,
            kv: MemoryStore::shared(),
            log: Arc::new(MemoryLog::new()),
            protocol: Arc::new(Ed25519Protocol),
            adapters: Adapters::new(),
            transactor: Arc::new(NoTransactor),
            deliver: Arc::new(Undeliverable),
        }
    }

    /// Node persisted in `storage`
    pub fn persistent(storage: &Storage, keys: NodeKeys) -> Self {
        Self {
            kv: Arc::new(storage.kv()),
            log: Arc::new(storage.log()),
            ..Self::memory(keys)
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_adapters(mut self, adapters: Adapters) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_transactor(mut self, transactor: Arc<dyn Transactor>) -> Self {
        self.transactor = transactor;
        self
    }

    pub fn with_deliver(mut self, deliver: Arc<dyn Deliver>) -> Self {
        self.deliver = deliver;
        self
    }

    pub fn with_log(mut self, log: Arc<dyn LogStore>) -> Self {
        self.log = log;
        self
    }
}

/// Removes a link from the in-flight set when the save finishes
struct Saving<'a> {
    set: &'a Mutex<HashSet<Link>>,
    link: Link,
}

impl Drop for Saving<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.link);
    }
}

pub struct Node {
    config: NodeConfig,
    keys: NodeKeys,
    keypair: Keypair,
    me: IdentityInfo,
    protocol: Arc<dyn Protocol>,
    log: Arc<ChangeLog>,
    actions: Actions,
    content: ObjectStore,
    adapters: Adapters,
    objects: ObjectsDb,
    seals: SealsDb,
    watches: WatchesDb,
    book: AddressBook,
    sealer: Sealer,
    sender: Sender,
    watcher: SealWatcher,
    locks: Locks,
    saving: Mutex<HashSet<Link>>,
    events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
    // Fold loops and event forwarders
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Assemble a node, start its fold loops and make sure it has a
    /// published identity. Background components stay stopped until
    /// [`Node::start`].
    pub async fn open(options: NodeOptions) -> NodeResult<Self> {
        let NodeOptions {
            config,
            mut keys,
            name,
            kv,
            log,
            protocol,
            adapters,
            transactor,
            deliver,
        } = options;
        config.validate()?;

        let log = Arc::new(ChangeLog::new(log, config.event_capacity)?);
        let content = ObjectStore::new(kv.clone(), protocol.clone());
        let actions = Actions::new(log.clone());
        let opts = config.projection_options();

        let objects_p = Arc::new(Projection::new(
            ObjectsReducer,
            kv.clone(),
            content.clone(),
            log.clone(),
            opts,
        )?);
        let seals_p = Arc::new(Projection::new(
            SealsReducer,
            kv.clone(),
            content.clone(),
            log.clone(),
            opts,
        )?);
        let watches_p = Arc::new(Projection::new(
            WatchesReducer {
                confirmed_after: config.confirmed_after,
            },
            kv.clone(),
            content.clone(),
            log.clone(),
            opts,
        )?);
        let book_p = Arc::new(Projection::new(
            AddressBookReducer,
            kv,
            content.clone(),
            log.clone(),
            opts,
        )?);

        let objects = ObjectsDb::new(objects_p.clone());
        let seals = SealsDb::new(seals_p.clone(), content.clone(), config.confirmed_after);
        let watches = WatchesDb::new(watches_p.clone());
        let book = AddressBook::new(book_p.clone());

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let cancel = CancellationToken::new();

        // Subscribe before the fold loops run so no change is missed
        let seal_events = seals.clone();
        let tasks = vec![
            forward(objects_p.subscribe(), &events, &cancel, |change| {
                ObjectsDb::domain_event(change).into_iter().collect()
            }),
            forward(seals_p.subscribe(), &events, &cancel, move |change| {
                match seal_events.domain_events(change) {
                    Ok(events) => events,
                    Err(e) => vec![NodeEvent::error("seals", e.to_string())],
                }
            }),
            forward_halt(objects_p.watch_halted(), &events, &cancel),
            forward_halt(seals_p.watch_halted(), &events, &cancel),
            forward_halt(watches_p.watch_halted(), &events, &cancel),
            forward_halt(book_p.watch_halted(), &events, &cancel),
            objects_p.spawn(cancel.child_token()),
            seals_p.spawn(cancel.child_token()),
            watches_p.spawn(cancel.child_token()),
            book_p.spawn(cancel.child_token()),
        ];

        let keypair = keys.keypair();
        let me = ensure_identity(
            &book,
            &content,
            &actions,
            protocol.as_ref(),
            &keypair,
            &mut keys,
            name,
        )
        .await?;

        let sealer = Sealer::new(
            seals.clone(),
            adapters.clone(),
            transactor,
            actions.clone(),
            config.retry.clone(),
            events.clone(),
        );
        let sender = Sender::new(
            objects.clone(),
            book.clone(),
            content.clone(),
            deliver,
            actions.clone(),
            config.retry.clone(),
        );
        let watcher = SealWatcher::new(
            watches.clone(),
            objects.clone(),
            actions.clone(),
            adapters.clone(),
            protocol.clone(),
            WatcherConfig {
                interval: config.sync_interval(),
                batch_size: config.sync_batch_size,
                batch_delay: config.sync_batch_delay(),
            },
            events.clone(),
        );

        info!(permalink = %me.permalink, head = log.head(), "node open");

        Ok(Self {
            locks: Locks::new(config.lock_timeout()),
            config,
            keys,
            keypair,
            me,
            protocol,
            log,
            actions,
            content,
            adapters,
            objects,
            seals,
            watches,
            book,
            sealer,
            sender,
            watcher,
            saving: Mutex::new(HashSet::new()),
            events,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Open (or create) a persistent node in `data_dir`, generating and
    /// saving node keys on first use.
    pub async fn open_dir(
        data_dir: impl AsRef<Path>,
        config: NodeConfig,
        configure: impl FnOnce(NodeOptions) -> NodeOptions,
    ) -> NodeResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let storage = Storage::new(data_dir.join(DB_FILE))?;

        let keys = match storage.load_keys()? {
            Some(keys) => keys,
            None => {
                let keys = NodeKeys::generate()?;
                storage.save_keys(&keys)?;
                keys
            }
        };
        let node = Self::open(configure(
            NodeOptions::persistent(&storage, keys).with_config(config),
        ))
        .await?;
        storage.save_keys(node.keys())?;
        Ok(node)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the sealer, the sender and the seal watcher
    pub fn start(&self) -> NodeResult<()> {
        self.sealer.start()?;
        self.sender.start()?;
        self.watcher.start()?;
        info!("node started");
        Ok(())
    }

    /// Stop the background components. Fold loops keep running.
    pub fn stop(&self) {
        self.watcher.stop();
        self.sender.stop();
        self.sealer.stop();
        info!("node stopped");
    }

    /// Stop everything, fold loops included
    pub fn close(&self) {
        self.stop();
        self.cancel.cancel();
    }

    /// Close and wait for the fold loops to exit, releasing their store
    /// handles so the same database can be opened again.
    pub async fn shutdown(self) {
        self.close();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "node task failed");
            }
        }
        // Let cancelled component tasks observe their tokens
        tokio::task::yield_now().await;
        debug!(permalink = %self.me.permalink, "node shut down");
    }

    /// Wait until every projection has folded the whole log
    pub async fn wait_live(&self) -> NodeResult<()> {
        self.objects.projection().wait_live().await?;
        self.seals.projection().wait_live().await?;
        self.watches.projection().wait_live().await?;
        self.book.projection().wait_live().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn keys(&self) -> &NodeKeys {
        &self.keys
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Permalink of this node's identity
    pub fn permalink(&self) -> Link {
        self.me.permalink
    }

    pub fn identity(&self) -> &IdentityInfo {
        &self.me
    }

    pub fn pub_key(&self) -> PubKey {
        self.keypair.public_key()
    }

    /// The signed identity object peers need to add us as a contact
    pub fn identity_object(&self) -> NodeResult<Object> {
        self.content.get(&self.me.link)
    }

    pub fn log(&self) -> &Arc<ChangeLog> {
        &self.log
    }

    pub fn actions(&self) -> &Actions {
        &self.actions
    }

    pub fn content(&self) -> &ObjectStore {
        &self.content
    }

    pub fn objects(&self) -> &ObjectsDb {
        &self.objects
    }

    pub fn seals(&self) -> &SealsDb {
        &self.seals
    }

    pub fn watches(&self) -> &WatchesDb {
        &self.watches
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.book
    }

    pub fn sealer(&self) -> &Sealer {
        &self.sealer
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn watcher(&self) -> &SealWatcher {
        &self.watcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn begin_save(&self, link: Link) -> NodeResult<Saving<'_>> {
        if !self.saving.lock().insert(link) {
            return Err(NodeError::AlreadySaving(link.to_hex()));
        }
        Ok(Saving {
            set: &self.saving,
            link,
        })
    }

    async fn folded_object(&self, seq: u64, link: &Link) -> NodeResult<ObjectState> {
        self.objects.projection().wait_for(seq).await?;
        self.objects
            .get(link)?
            .ok_or_else(|| NodeError::NotFound(format!("object {} was rejected", link)))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Objects
    // ═══════════════════════════════════════════════════════════════════════

    /// Sign and store an object (or a new version of one) authored by us
    pub async fn create(&self, object: Object) -> NodeResult<ObjectState> {
        if object.is_message() {
            return Err(NodeError::Validation(
                "messages are created with sign_and_send".to_string(),
            ));
        }
        let object = Object {
            author: Some(self.me.permalink),
            ..object
        };
        let signed = self.protocol.sign(object, &self.keypair)?;
        let link = self.protocol.link(&signed)?;
        let permalink = signed.permalink_or(link);
        let _saving = self.begin_save(link)?;

        if self.objects.get(&link)?.is_some() {
            return Err(NodeError::Exists(format!("object {}", link)));
        }
        if let Some(prev) = signed.prev {
            match self.objects.latest(&permalink)? {
                Some(latest) if latest.link == prev => {}
                Some(latest) => {
                    return Err(NodeError::InvalidVersion(format!(
                        "{} is not the latest version of {} (latest is {})",
                        prev, permalink, latest.link
                    )))
                }
                None => {
                    return Err(NodeError::InvalidVersion(format!(
                        "unknown object {}",
                        permalink
                    )))
                }
            }
        }

        self.content.put(&signed)?;
        let entry = self.actions.create_object(NewObject::object(
            link,
            permalink,
            signed.prev,
            self.me.permalink,
            &signed.kind,
        ))?;
        debug!(%link, kind = %signed.kind, seq = entry.seq, "object created");
        self.folded_object(entry.seq, &link).await
    }

    pub async fn archive(&self, link: &Link) -> NodeResult<ObjectState> {
        self.objects
            .get(link)?
            .ok_or_else(|| NodeError::NotFound(format!("object {}", link)))?;
        let entry = self.actions.archive_object(*link)?;
        self.folded_object(entry.seq, link).await
    }

    pub async fn unarchive(&self, link: &Link) -> NodeResult<ObjectState> {
        self.objects
            .get(link)?
            .ok_or_else(|| NodeError::NotFound(format!("object {}", link)))?;
        let entry = self.actions.unarchive_object(*link)?;
        self.folded_object(entry.seq, link).await
    }

    /// Drop every version of an object and every message carrying it.
    /// Returns how many records were forgotten.
    pub async fn forget(&self, permalink: &Link) -> NodeResult<usize> {
        let mut links: Vec<Link> = self
            .objects
            .versions(permalink)?
            .into_iter()
            .map(|s| s.link)
            .collect();
        links.extend(self.objects.carrying(permalink)?.into_iter().map(|s| s.link));
        links.sort();
        links.dedup();
        if links.is_empty() {
            return Err(NodeError::NotFound(format!("object {}", permalink)));
        }

        let mut last = 0;
        for link in &links {
            last = self.actions.forget_object(*link)?.seq;
        }
        self.objects.projection().wait_for(last).await?;
        for link in &links {
            self.content.del(link)?;
        }
        info!(%permalink, count = links.len(), "object forgotten");
        Ok(links.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Contacts
    // ═══════════════════════════════════════════════════════════════════════

    /// Learn a peer's identity (a self-signed identity object)
    pub async fn add_contact(&self, object: Object) -> NodeResult<IdentityInfo> {
        let signer = self.protocol.verify(&object)?;
        let identity = Identity::from_object(&object)?;
        if !identity.has_key(&signer) {
            return Err(NodeError::Author(format!(
                "identity signed by foreign key {}",
                signer
            )));
        }
        let link = self.protocol.link(&object)?;
        let permalink = object.permalink_or(link);
        let _lock = self.locks.lock(&format!("contact:{}", permalink)).await;

        if self.book.by_link(&link)?.is_some() {
            return Err(NodeError::Exists(format!("contact {}", link)));
        }
        for key in &identity.pub_keys {
            let claimed = [
                self.book.by_pub_key(&key.pub_key)?,
                self.book.by_fingerprint(&key.fingerprint)?,
            ];
            if let Some(other) = claimed.into_iter().flatten().find(|o| o.permalink != permalink) {
                return Err(NodeError::Collision(format!(
                    "key {} already belongs to {}",
                    key.fingerprint, other.permalink
                )));
            }
        }
        if let Some(current) = self.book.by_permalink(&permalink)? {
            if object.prev != Some(current.link) {
                return Err(NodeError::InvalidVersion(format!(
                    "identity {} is at {}, update builds on {:?}",
                    permalink, current.link, object.prev
                )));
            }
        }

        self.content.put(&object)?;
        let entry = self.actions.add_contact(AddContact {
            link,
            permalink,
            prev_link: object.prev,
        })?;
        self.book.projection().wait_for(entry.seq).await?;
        let info = self
            .book
            .by_link(&link)?
            .ok_or_else(|| NodeError::Collision(format!("identity {} was rejected", link)))?;
        info!(%permalink, name = ?info.identity.name, "contact added");
        Ok(info)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════════════════════════════════

    /// Wrap `object` in a message to `recipient` and queue it for delivery.
    ///
    /// Unsigned objects are signed as ours first. Sequence assignment, signing
    /// and append run under the recipient's lock.
    pub async fn sign_and_send(&self, object: Object, recipient: &Link) -> NodeResult<ObjectState> {
        let peer = self.book.lookup(recipient)?;
        let recipient_pub_key = peer
            .identity
            .signing_key()
            .map(|k| k.pub_key)
            .ok_or_else(|| NodeError::UnknownIdentity(format!("{} has no signing key", recipient)))?;

        let _lock = self.locks.lock(&format!("send:{}", recipient)).await;

        let payload = if object.is_signed() {
            self.protocol.verify(&object)?;
            object
        } else {
            let object = Object {
                author: Some(object.author.unwrap_or(self.me.permalink)),
                ..object
            };
            self.protocol.sign(object, &self.keypair)?
        };
        let payload_link = self.content.put(&payload)?;
        let payload_permalink = payload.permalink_or(payload_link);

        let meta = self
            .objects
            .next_message_metadata(&self.me.permalink, recipient)?;
        let body = MessageBody {
            object: payload.clone(),
            recipient_pub_key,
            seq: meta.seq,
            prev: meta.prev_to_sender,
        };
        let message = self.protocol.sign(
            Object {
                author: Some(self.me.permalink),
                ..body.to_object()?
            },
            &self.keypair,
        )?;
        let link = self.content.put(&message)?;

        if self.objects.get(&payload_link)?.is_none() {
            self.actions.create_object(NewObject::object(
                payload_link,
                payload_permalink,
                payload.prev,
                payload.author.unwrap_or(self.me.permalink),
                &payload.kind,
            ))?;
        }
        let entry = self.actions.create_object(NewObject {
            link,
            permalink: link,
            prev_link: None,
            author: self.me.permalink,
            recipient: Some(*recipient),
            kind: MESSAGE_KIND.to_string(),
            inbound: false,
            seq: Some(meta.seq),
            prev_msg: meta.prev_to_sender,
            object_link: Some(payload_link),
            object_permalink: Some(payload_permalink),
            sendstatus: Some(SendStatus::Pending),
        })?;
        debug!(%link, %recipient, seq = meta.seq, "message queued");
        self.folded_object(entry.seq, &link).await
    }

    /// Accept a serialized message from a peer
    pub async fn receive(&self, bytes: &[u8]) -> NodeResult<ObjectState> {
        let message = Object::from_bytes(bytes)?;
        let body = MessageBody::from_object(&message)?;

        let signer = self.protocol.verify(&message)?;
        let author = message
            .author
            .ok_or_else(|| NodeError::Author("message has no author".to_string()))?;
        let sender = self.book.lookup(&author)?;
        if !sender.identity.has_key(&signer) {
            return Err(NodeError::Author(format!(
                "message from {} signed by foreign key {}",
                author, signer
            )));
        }
        if !self.me.identity.has_key(&body.recipient_pub_key) {
            return Err(NodeError::Validation(format!(
                "message addressed to {}",
                body.recipient_pub_key
            )));
        }

        let payload = &body.object;
        let payload_signer = self.protocol.verify(payload)?;
        let payload_author = payload.author.unwrap_or(author);
        if let Some(info) = self.book.by_permalink(&payload_author)? {
            if !info.identity.has_key(&payload_signer) {
                return Err(NodeError::Author(format!(
                    "payload claims author {} but is signed by {}",
                    payload_author, payload_signer
                )));
            }
        }

        let link = self.protocol.link(&message)?;
        let _lock = self.locks.lock(&format!("recv:{}", author)).await;
        let _saving = self.begin_save(link)?;

        if self.objects.get(&link)?.is_some() {
            return Err(NodeError::Exists(format!("message {}", link)));
        }
        if let Some(other) = self
            .objects
            .message_by_seq(&author, &self.me.permalink, body.seq)?
        {
            return Err(NodeError::Exists(format!(
                "message {} from {} already received as {}",
                body.seq, author, other.link
            )));
        }

        let payload_link = self.content.put(payload)?;
        let payload_permalink = payload.permalink_or(payload_link);
        self.content.put(&message)?;

        if self.objects.get(&payload_link)?.is_none() {
            let mut record = NewObject::object(
                payload_link,
                payload_permalink,
                payload.prev,
                payload_author,
                &payload.kind,
            );
            record.inbound = true;
            self.actions.create_object(record)?;
        }
        let entry = self.actions.create_object(NewObject {
            link,
            permalink: link,
            prev_link: None,
            author,
            recipient: Some(self.me.permalink),
            kind: MESSAGE_KIND.to_string(),
            inbound: true,
            seq: Some(body.seq),
            prev_msg: body.prev,
            object_link: Some(payload_link),
            object_permalink: Some(payload_permalink),
            sendstatus: None,
        })?;
        info!(%link, from = %author, seq = body.seq, "message received");
        self.folded_object(entry.seq, &link).await
    }

    /// Messages exchanged with `peer`, in log order
    pub fn conversation(&self, peer: &Link) -> NodeResult<Vec<ObjectState>> {
        self.objects.conversation(&self.me.permalink, peer)
    }

    /// Seqs up to `tip` of messages from `peer` we have not received
    pub fn missing_messages(&self, peer: &Link, tip: u32) -> NodeResult<Vec<u32>> {
        self.objects.missing_messages(peer, &self.me.permalink, tip)
    }

    /// Give up on every undelivered message to `peer`
    pub async fn abort_messages(&self, peer: &Link) -> NodeResult<usize> {
        let count = self.sender.abort(peer)?;
        self.objects.projection().wait_live().await?;
        Ok(count)
    }

    pub fn pause_recipient(&self, peer: &Link) {
        self.sender.pause_recipient(peer)
    }

    pub fn resume_recipient(&self, peer: &Link) -> NodeResult<()> {
        self.sender.resume_recipient(peer)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Seals and watches
    // ═══════════════════════════════════════════════════════════════════════

    fn seal_base(&self, network: &Network) -> NodeResult<PubKey> {
        self.me
            .identity
            .seal_key(network)
            .map(|k| k.pub_key)
            .ok_or_else(|| NodeError::UnknownIdentity(format!("no seal key for {}", network)))
    }

    /// Queue a seal of `link` on `network` and watch for it and for the
    /// object's next version.
    pub async fn seal(&self, link: &Link, network: &Network) -> NodeResult<SealState> {
        let state = self
            .objects
            .get(link)?
            .ok_or_else(|| NodeError::NotFound(format!("object {}", link)))?;
        let adapter = self.adapters.get(network)?;
        let base = self.seal_base(network)?;

        let seal_address = adapter.pub_key_to_address(&self.protocol.seal_pub_key(link, &base))?;
        let seal_prev_address = match state.prev_link {
            Some(prev) => Some(adapter.pub_key_to_address(&self.protocol.seal_prev_pub_key(&prev, &base))?),
            None => None,
        };
        let key = seal_uid(network, seal_prev_address.as_ref().unwrap_or(&seal_address));
        let _lock = self.locks.lock(&format!("seal:{}", key)).await;

        if let Some(existing) = self.seals.get(&key)? {
            return Err(NodeError::Exists(format!(
                "seal of {} ({})",
                link,
                existing.status.as_str()
            )));
        }

        let entry = self.actions.write_seal(QueueSeal {
            link: *link,
            prev_link: state.prev_link,
            seal_address: seal_address.clone(),
            seal_prev_address,
            base_pub_key: base,
            network: network.clone(),
            header_hash: None,
        })?;
        self.ensure_watch(NewWatch {
            address: seal_address,
            link: *link,
            prev_link: state.prev_link,
            watch_type: WatchType::ThisVersion,
            base_pub_key: base,
            header_hash: None,
            network: network.clone(),
        })?;
        let next_address = adapter.pub_key_to_address(&self.protocol.seal_prev_pub_key(link, &base))?;
        self.ensure_watch(NewWatch {
            address: next_address,
            link: *link,
            prev_link: None,
            watch_type: WatchType::NextVersion,
            base_pub_key: base,
            header_hash: None,
            network: network.clone(),
        })?;

        self.seals.projection().wait_for(entry.seq).await?;
        self.watches.projection().wait_live().await?;
        info!(%link, %network, %key, "seal queued");
        self.seals
            .get(&key)?
            .ok_or_else(|| NodeError::NotFound(format!("seal {} was rejected", key)))
    }

    fn ensure_watch(&self, watch: NewWatch) -> NodeResult<bool> {
        if self.watches.get(&watch.address, &watch.link)?.is_some() {
            return Ok(false);
        }
        self.actions.create_watch(watch)?;
        Ok(true)
    }

    async fn add_watch(&self, watch: NewWatch) -> NodeResult<WatchState> {
        let (address, link) = (watch.address.clone(), watch.link);
        if self.watches.get(&address, &link)?.is_some() {
            return Err(NodeError::Exists(format!("watch {}:{}", address, link)));
        }
        let entry = self.actions.create_watch(watch)?;
        self.watches.projection().wait_for(entry.seq).await?;
        self.watches
            .get(&address, &link)?
            .ok_or_else(|| NodeError::NotFound(format!("watch {} was rejected", address)))
    }

    /// Watch for a seal of `link` made with `base` (someone else's seal key)
    pub async fn watch_seal(
        &self,
        link: &Link,
        prev_link: Option<Link>,
        base: &PubKey,
        network: &Network,
    ) -> NodeResult<WatchState> {
        let adapter = self.adapters.get(network)?;
        let address = adapter.pub_key_to_address(&self.protocol.seal_pub_key(link, base))?;
        self.add_watch(NewWatch {
            address,
            link: *link,
            prev_link,
            watch_type: WatchType::ThisVersion,
            base_pub_key: *base,
            header_hash: None,
            network: network.clone(),
        })
        .await
    }

    /// Watch for a seal of whatever version follows `link`
    pub async fn watch_next_version(
        &self,
        link: &Link,
        base: &PubKey,
        network: &Network,
    ) -> NodeResult<WatchState> {
        let adapter = self.adapters.get(network)?;
        let address = adapter.pub_key_to_address(&self.protocol.seal_prev_pub_key(link, base))?;
        self.add_watch(NewWatch {
            address,
            link: *link,
            prev_link: None,
            watch_type: WatchType::NextVersion,
            base_pub_key: *base,
            header_hash: None,
            network: network.clone(),
        })
        .await
    }

    /// Poll the chains for watched addresses now, then wait for the results
    /// to be folded.
    pub async fn sync(&self) -> NodeResult<()> {
        if !self.watcher.controls().is_running() {
            self.watcher.reload()?;
        }
        self.watcher.sync().await;
        self.wait_live().await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Row counts of every projection after folding a whole log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionCounts {
    pub head: u64,
    pub objects: usize,
    pub seals: usize,
    pub watches: usize,
    pub contacts: usize,
}

/// Fold `log` into projections kept in `state`, reading identities from
/// `content`. With an empty `state` this is a full replay; with a node's own
/// store it catches that node's projections up.
pub fn fold_all(
    log: Arc<dyn LogStore>,
    content: ObjectStore,
    state: Arc<dyn KeyValueStore>,
    config: &NodeConfig,
) -> NodeResult<ProjectionCounts> {
    let log = Arc::new(ChangeLog::new(log, config.event_capacity)?);
    let opts = config.projection_options();

    let objects = rows(Projection::new(
        ObjectsReducer,
        state.clone(),
        content.clone(),
        log.clone(),
        opts,
    )?)?;
    let seals = rows(Projection::new(
        SealsReducer,
        state.clone(),
        content.clone(),
        log.clone(),
        opts,
    )?)?;
    let watches = rows(Projection::new(
        WatchesReducer {
            confirmed_after: config.confirmed_after,
        },
        state.clone(),
        content.clone(),
        log.clone(),
        opts,
    )?)?;
    let contacts = rows(Projection::new(
        AddressBookReducer,
        state,
        content,
        log.clone(),
        opts,
    )?)?;

    Ok(ProjectionCounts {
        head: log.head(),
        objects,
        seals,
        watches,
        contacts,
    })
}

fn rows<R: Reducer>(projection: Projection<R>) -> NodeResult<usize> {
    projection.catch_up()?;
    if let Some(halt) = projection.halted() {
        warn!(projection = projection.name(), %halt, "fold halted");
        return Err(NodeError::Invariant(halt.to_string()));
    }
    Ok(projection.list()?.len())
}

/// Create and publish our identity unless the address book already has it
async fn ensure_identity(
    book: &AddressBook,
    content: &ObjectStore,
    actions: &Actions,
    protocol: &dyn Protocol,
    keypair: &Keypair,
    keys: &mut NodeKeys,
    name: Option<String>,
) -> NodeResult<IdentityInfo> {
    book.projection().wait_live().await?;

    if let Some(permalink) = keys.identity {
        if let Some(info) = book.by_permalink(&permalink)? {
            return Ok(info);
        }
        warn!(%permalink, "stored identity is not in the address book, looking up by key");
    }
    if let Some(info) = book.by_pub_key(&keypair.public_key())? {
        keys.identity = Some(info.permalink);
        return Ok(info);
    }

    let identity = Identity::new(
        name,
        vec![PubKeyInfo::new(SIGN_PURPOSE, keypair.public_key())],
    );
    let signed = protocol.sign(identity.to_object()?, keypair)?;
    let link = content.put(&signed)?;
    let entry = actions.add_contact(AddContact {
        link,
        permalink: link,
        prev_link: None,
    })?;
    book.projection().wait_for(entry.seq).await?;
    let info = book
        .by_permalink(&link)?
        .ok_or_else(|| NodeError::Collision(format!("own identity {} was rejected", link)))?;
    keys.identity = Some(link);
    info!(permalink = %link, "identity created");
    Ok(info)
}

/// Map every projection change to node events until cancelled
fn forward<S, F>(
    mut changes: broadcast::Receiver<Change<S>>,
    events: &broadcast::Sender<NodeEvent>,
    cancel: &CancellationToken,
    map: F,
) -> JoinHandle<()>
where
    S: Clone + Send + 'static,
    F: Fn(&Change<S>) -> Vec<NodeEvent> + Send + 'static,
{
    let events = events.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = cancel.cancelled() => return,
                change = changes.recv() => change,
            };
            match change {
                Ok(change) => {
                    for event in map(&change) {
                        debug!(kind = event.kind(), seq = change.entry.seq, "node event");
                        let _ = events.send(event);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event forwarding lagged, events dropped");
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

fn forward_halt(
    mut halted: watch::Receiver<Option<FoldHalt>>,
    events: &broadcast::Sender<NodeEvent>,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    let events = events.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = halted.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let halt = halted.borrow_and_update().clone();
            if let Some(halt) = halt {
                let _ = events.send(NodeEvent::error(halt.projection, halt.to_string()));
                return;
            }
        }
    })
}
