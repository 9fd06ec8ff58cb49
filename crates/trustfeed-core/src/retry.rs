//! Keyed retry queue with shared exponential backoff
//!
//! Items are processed one at a time by a [`RetryWorker`]. At most one item
//! per key is queued or in flight: pushing a key that is already present is
//! dropped. A failed item stays at the head of the queue, so items behind it
//! keep their order, and the whole stream backs off; any success resets the
//! backoff.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::NodeError;

pub trait RetryItem: Clone + Send + Sync + 'static {
    /// Deduplication key
    fn key(&self) -> String;
}

/// Failure of one worker invocation
#[derive(Debug)]
pub struct WorkerError {
    pub error: NodeError,
    /// Drop the item instead of retrying it
    pub skip: bool,
}

impl WorkerError {
    pub fn retry(error: NodeError) -> Self {
        Self { error, skip: false }
    }

    pub fn skip(error: NodeError) -> Self {
        Self { error, skip: true }
    }
}

impl From<NodeError> for WorkerError {
    fn from(error: NodeError) -> Self {
        let skip = error.is_permanent();
        Self { error, skip }
    }
}

#[async_trait]
pub trait RetryWorker<T: RetryItem>: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    async fn process(&self, item: &T) -> Result<Self::Output, WorkerError>;
}

/// A successfully processed item and what the worker made of it
#[derive(Debug, Clone)]
pub struct Processed<T, O> {
    pub input: T,
    pub output: O,
}

#[derive(Debug, Clone)]
pub struct Failure<T> {
    pub input: T,
    pub error: String,
    pub attempt: u32,
    /// Dropped for good rather than requeued
    pub skipped: bool,
}

/// Exponential backoff state
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_millis),
            max: Duration::from_millis(config.max_delay_millis),
            factor: config.factor.max(1.0),
            current: None,
        }
    }

    /// Delay before the next attempt: initial, then growing by `factor` up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(d) => d.mul_f64(self.factor).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

struct Queue<T> {
    items: VecDeque<(T, u32)>,
    // Keys queued or in flight
    keys: HashSet<String>,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    notify: Notify,
    paused: watch::Sender<bool>,
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl<T> Shared<T> {
    fn release(&self, key: &str) {
        let mut queue = self.queue.lock();
        queue.keys.remove(key);
        self.pending.send_replace(queue.keys.len());
    }
}

pub struct RetryStream<T: RetryItem, W: RetryWorker<T>> {
    name: String,
    shared: Arc<Shared<T>>,
    outputs: broadcast::Sender<Processed<T, W::Output>>,
    failures: broadcast::Sender<Failure<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: RetryItem, W: RetryWorker<T>> RetryStream<T, W> {
    /// Create the stream and spawn its processing task
    pub fn spawn(name: impl Into<String>, worker: Arc<W>, config: &RetryConfig) -> Self {
        let name = name.into();
        let (paused, _) = watch::channel(false);
        let (pending, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                keys: HashSet::new(),
            }),
            notify: Notify::new(),
            paused,
            pending,
            cancel: CancellationToken::new(),
        });
        let (outputs, _) = broadcast::channel(256);
        let (failures, _) = broadcast::channel(256);

        let task = tokio::spawn(run(
            name.clone(),
            shared.clone(),
            worker,
            Backoff::new(config),
            outputs.clone(),
            failures.clone(),
        ));

        Self {
            name,
            shared,
            outputs,
            failures,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an item; returns false if its key is already queued or in flight
    pub fn push(&self, item: T) -> bool {
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        let key = item.key();
        let mut queue = self.shared.queue.lock();
        if !queue.keys.insert(key.clone()) {
            debug!(stream = %self.name, %key, "duplicate dropped");
            return false;
        }
        queue.items.push_back((item, 0));
        self.shared.pending.send_replace(queue.keys.len());
        drop(queue);
        self.shared.notify.notify_one();
        true
    }

    /// Items queued or in flight
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.queue.lock().keys.contains(key)
    }

    /// Stop before the next worker call; an in-flight call completes
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Wait until nothing is queued or in flight
    pub async fn drain(&self) {
        let mut pending = self.shared.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Stop processing for good without waiting
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Stop processing for good and wait for the task to exit
    pub async fn stop(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn outputs(&self) -> broadcast::Receiver<Processed<T, W::Output>> {
        self.outputs.subscribe()
    }

    pub fn failures(&self) -> broadcast::Receiver<Failure<T>> {
        self.failures.subscribe()
    }
}

impl<T: RetryItem, W: RetryWorker<T>> Drop for RetryStream<T, W> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Returns false once cancelled
async fn wait_unpaused<T>(shared: &Shared<T>) -> bool {
    let mut paused = shared.paused.subscribe();
    tokio::select! {
        _ = shared.cancel.cancelled() => false,
        res = paused.wait_for(|p| !*p) => res.is_ok(),
    }
}

async fn run<T: RetryItem, W: RetryWorker<T>>(
    name: String,
    shared: Arc<Shared<T>>,
    worker: Arc<W>,
    mut backoff: Backoff,
    outputs: broadcast::Sender<Processed<T, W::Output>>,
    failures: broadcast::Sender<Failure<T>>,
) {
    loop {
        if !wait_unpaused(&shared).await {
            return;
        }
        let next = shared.queue.lock().items.pop_front();
        let (item, attempt) = match next {
            Some(next) => next,
            None => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = shared.notify.notified() => {}
                }
                continue;
            }
        };

        let key = item.key();
        match worker.process(&item).await {
            Ok(output) => {
                backoff.reset();
                shared.release(&key);
                debug!(stream = %name, %key, "processed");
                let _ = outputs.send(Processed {
                    input: item,
                    output,
                });
            }
            Err(WorkerError { error, skip: true }) => {
                warn!(stream = %name, %key, error = %error, "dropping item");
                shared.release(&key);
                let _ = failures.send(Failure {
                    input: item,
                    error: error.to_string(),
                    attempt: attempt + 1,
                    skipped: true,
                });
            }
            Err(WorkerError { error, skip: false }) => {
                let delay = backoff.next_delay();
                warn!(
                    stream = %name,
                    %key,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "worker failed, retrying"
                );
                let _ = failures.send(Failure {
                    input: item.clone(),
                    error: error.to_string(),
                    attempt: attempt + 1,
                    skipped: false,
                });
                shared.queue.lock().items.push_front((item, attempt + 1));

                let mut paused = shared.paused.subscribe();
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                    _ = paused.wait_for(|p| *p) => {}
                }
            }
        }
    }
}
