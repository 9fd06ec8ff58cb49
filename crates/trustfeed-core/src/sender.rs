//! Per-recipient message delivery
//!
//! Every recipient with undelivered messages gets its own [`Channel`], a
//! [`RetryStream`] with its own backoff, so a peer that is offline never
//! delays delivery to the others. Channels are created on the first unsent
//! message to a recipient and can be paused, resumed or stopped one by one.
//!
//! A channel caches its recipient's identity and drops the cached copy
//! whenever the address book changes that identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::Actions;
use crate::config::RetryConfig;
use crate::content::ObjectStore;
use crate::controls::{ControlState, Controls, ResumeFn, StopFn};
use crate::dbs::{AddressBook, IdentityInfo, ObjectState, ObjectsDb};
use crate::error::{NodeError, NodeResult};
use crate::projection::Change;
use crate::retry::{RetryItem, RetryStream, RetryWorker, WorkerError};
use crate::types::Link;

/// Hands a serialized message to the network
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Fail with [`NodeError::DeliveryRejected`] when retrying cannot help
    async fn deliver(&self, message: &[u8], recipient: &IdentityInfo) -> NodeResult<()>;
}

/// Default transport: every delivery fails
pub struct Undeliverable;

#[async_trait]
impl Deliver for Undeliverable {
    async fn deliver(&self, _message: &[u8], _recipient: &IdentityInfo) -> NodeResult<()> {
        Err(NodeError::Delivery("not implemented".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageJob {
    pub link: Link,
    pub recipient: Link,
}

impl RetryItem for MessageJob {
    fn key(&self) -> String {
        self.link.to_hex()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Sent or aborted before the worker got to it
    NotPending,
}

pub struct ChannelWorker {
    recipient: Link,
    identity: Mutex<Option<IdentityInfo>>,
    objects: ObjectsDb,
    book: AddressBook,
    content: ObjectStore,
    deliver: Arc<dyn Deliver>,
    actions: Actions,
}

impl ChannelWorker {
    fn identity(&self) -> NodeResult<IdentityInfo> {
        let mut cached = self.identity.lock();
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }
        let identity = self.book.lookup(&self.recipient)?;
        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// Look the recipient up again on the next delivery
    pub fn forget_identity(&self) {
        self.identity.lock().take();
    }

    /// Version of the recipient's identity deliveries currently go to
    pub fn cached_identity(&self) -> Option<Link> {
        self.identity.lock().as_ref().map(|i| i.link)
    }
}

#[async_trait]
impl RetryWorker<MessageJob> for ChannelWorker {
    type Output = DeliveryOutcome;

    async fn process(&self, job: &MessageJob) -> Result<DeliveryOutcome, WorkerError> {
        match self.objects.get(&job.link)? {
            None => {
                return Err(WorkerError::skip(NodeError::NotFound(format!(
                    "message {}",
                    job.link
                ))))
            }
            Some(state) if !state.is_unsent() => return Ok(DeliveryOutcome::NotPending),
            Some(_) => {}
        }

        let identity = self.identity()?;
        let bytes = self.content.get_bytes(&job.link)?;
        self.deliver.deliver(&bytes, &identity).await?;
        self.actions.sent_message(job.link)?;
        debug!(link = %job.link, recipient = %self.recipient, "delivered");
        Ok(DeliveryOutcome::Delivered)
    }
}

/// Delivery queue of one recipient
pub struct Channel {
    recipient: Link,
    worker: Arc<ChannelWorker>,
    stream: RetryStream<MessageJob, ChannelWorker>,
}

impl Channel {
    pub fn recipient(&self) -> &Link {
        &self.recipient
    }

    pub fn stream(&self) -> &RetryStream<MessageJob, ChannelWorker> {
        &self.stream
    }

    pub fn worker(&self) -> &Arc<ChannelWorker> {
        &self.worker
    }

    pub fn push(&self, link: Link) -> bool {
        self.stream.push(MessageJob {
            link,
            recipient: self.recipient,
        })
    }

    pub fn pause(&self) {
        self.stream.pause()
    }

    pub fn resume(&self) {
        self.stream.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.stream.is_paused()
    }
}

struct SenderInner {
    objects: ObjectsDb,
    book: AddressBook,
    content: ObjectStore,
    deliver: Arc<dyn Deliver>,
    actions: Actions,
    retry: RetryConfig,
    channels: Mutex<HashMap<Link, Arc<Channel>>>,
    // Recipients stopped one by one; not fed until resumed
    halted: Mutex<HashSet<Link>>,
    paused: Mutex<bool>,
    feeder: Mutex<Option<CancellationToken>>,
}

impl SenderInner {
    fn channel(&self, recipient: Link) -> Arc<Channel> {
        let mut channels = self.channels.lock();
        channels
            .entry(recipient)
            .or_insert_with(|| {
                info!(%recipient, "opening delivery channel");
                let worker = Arc::new(ChannelWorker {
                    recipient,
                    identity: Mutex::new(None),
                    objects: self.objects.clone(),
                    book: self.book.clone(),
                    content: self.content.clone(),
                    deliver: self.deliver.clone(),
                    actions: self.actions.clone(),
                });
                let stream = RetryStream::spawn(
                    format!("sender:{}", recipient),
                    worker.clone(),
                    &self.retry,
                );
                if *self.paused.lock() {
                    stream.pause();
                }
                Arc::new(Channel {
                    recipient,
                    worker,
                    stream,
                })
            })
            .clone()
    }

    fn route(&self, state: &ObjectState) {
        let Some(recipient) = state.recipient else {
            return;
        };
        if !state.is_unsent() || self.halted.lock().contains(&recipient) {
            return;
        }
        self.channel(recipient).push(state.link);
    }

    fn close(&self, recipient: &Link) {
        if let Some(channel) = self.channels.lock().remove(recipient) {
            channel.stream.close();
        }
    }

    fn identity_changed(&self, change: &Change<IdentityInfo>) {
        let Some(info) = change.new.as_ref().or(change.old.as_ref()) else {
            return;
        };
        if let Some(channel) = self.channels.lock().get(&info.permalink) {
            debug!(recipient = %info.permalink, link = %info.link, "recipient identity changed");
            channel.worker.forget_identity();
        }
    }

    fn feed_all(&self) -> NodeResult<broadcast::Receiver<Change<ObjectState>>> {
        let (snapshot, changes) = self.objects.projection().live_all()?;
        let mut unsent: Vec<ObjectState> = snapshot
            .into_iter()
            .map(|(_, s)| s)
            .filter(|s| s.is_unsent())
            .collect();
        unsent.sort_by_key(|s| (s.recipient, s.seq));
        for state in &unsent {
            self.route(state);
        }
        Ok(changes)
    }
}

/// Background component owning every delivery channel
pub struct Sender {
    inner: Arc<SenderInner>,
    controls: Controls,
}

impl Sender {
    pub fn new(
        objects: ObjectsDb,
        book: AddressBook,
        content: ObjectStore,
        deliver: Arc<dyn Deliver>,
        actions: Actions,
        retry: RetryConfig,
    ) -> Self {
        let inner = Arc::new(SenderInner {
            objects,
            book,
            content,
            deliver,
            actions,
            retry,
            channels: Mutex::new(HashMap::new()),
            halted: Mutex::new(HashSet::new()),
            paused: Mutex::new(false),
            feeder: Mutex::new(None),
        });

        let this = inner.clone();
        let start = move || -> NodeResult<StopFn> {
            let mut identities = this.book.projection().subscribe();
            let mut changes = this.feed_all()?;
            let cancel = CancellationToken::new();
            *this.feeder.lock() = Some(cancel.clone());

            let watcher = this.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let change = tokio::select! {
                        _ = token.cancelled() => return,
                        change = identities.recv() => change,
                    };
                    match change {
                        Ok(change) => watcher.identity_changed(&change),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "sender lagged behind identity changes, forgetting all");
                            for channel in watcher.channels.lock().values() {
                                channel.worker.forget_identity();
                            }
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            });

            let feeder = this.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let change = tokio::select! {
                        _ = token.cancelled() => return,
                        change = changes.recv() => change,
                    };
                    match change {
                        Ok(change) => {
                            if let Some(new) = &change.new {
                                feeder.route(new);
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "sender lagged behind object changes, rescanning");
                            match feeder.feed_all() {
                                Ok(fresh) => changes = fresh,
                                Err(e) => warn!(error = %e, "rescan failed"),
                            }
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            });

            let this = this.clone();
            Ok(Box::new(move || {
                if let Some(cancel) = this.feeder.lock().take() {
                    cancel.cancel();
                }
                for (_, channel) in this.channels.lock().drain() {
                    channel.stream.close();
                }
            }) as StopFn)
        };

        let this = inner.clone();
        let pause = move || -> ResumeFn {
            *this.paused.lock() = true;
            for channel in this.channels.lock().values() {
                channel.pause();
            }
            let this = this.clone();
            Box::new(move || {
                *this.paused.lock() = false;
                for channel in this.channels.lock().values() {
                    channel.resume();
                }
            })
        };

        Self {
            inner,
            controls: Controls::new("sender", start).with_pause(pause),
        }
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    pub fn start(&self) -> NodeResult<()> {
        self.controls.start()
    }

    pub fn stop(&self) {
        self.controls.stop()
    }

    pub fn pause(&self) -> NodeResult<()> {
        self.controls.pause()
    }

    pub fn resume(&self) -> NodeResult<()> {
        self.controls.resume()
    }

    pub fn state(&self) -> ControlState {
        self.controls.state()
    }

    pub fn channel(&self, recipient: &Link) -> Option<Arc<Channel>> {
        self.inner.channels.lock().get(recipient).cloned()
    }

    /// Hold delivery to one recipient
    pub fn pause_recipient(&self, recipient: &Link) {
        self.inner.channel(*recipient).pause();
    }

    /// Continue delivery to one recipient, reopening a stopped channel
    pub fn resume_recipient(&self, recipient: &Link) -> NodeResult<()> {
        let was_halted = self.inner.halted.lock().remove(recipient);
        if was_halted {
            if self.controls.is_running() {
                for state in self.inner.objects.unsent(recipient)? {
                    self.inner.route(&state);
                }
            }
        } else if let Some(channel) = self.channel(recipient) {
            channel.resume();
        }
        Ok(())
    }

    /// Close one recipient's channel; its messages stay pending
    pub fn stop_recipient(&self, recipient: &Link) {
        self.inner.halted.lock().insert(*recipient);
        self.inner.close(recipient);
    }

    /// Give up on every undelivered message to `recipient`
    pub fn abort(&self, recipient: &Link) -> NodeResult<usize> {
        self.inner.close(recipient);
        let unsent = self.inner.objects.unsent(recipient)?;
        for state in &unsent {
            self.inner.actions.abort_message(state.link)?;
        }
        if !unsent.is_empty() {
            info!(%recipient, count = unsent.len(), "aborted undelivered messages");
        }
        Ok(unsent.len())
    }
}
