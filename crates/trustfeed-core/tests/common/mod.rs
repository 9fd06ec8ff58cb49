//! Shared fixtures for node integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use trustfeed_core::chain::{Adapters, BlockchainAdapter, ChainTx, Transactor, TxOutput, TxReceipt};
use trustfeed_core::dbs::IdentityInfo;
use trustfeed_core::log::MemoryLog;
use trustfeed_core::{
    Action, Deliver, Link, LogEntry, LogStore, Network, Node, NodeConfig, NodeError, NodeEvent,
    NodeKeys, NodeOptions, NodeResult, PubKey, RetryConfig,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Config with short retries and no timer-driven syncs
pub fn test_config() -> NodeConfig {
    NodeConfig {
        confirmed_after: 3,
        sync_interval_secs: 3600,
        sync_batch_size: 2,
        sync_batch_delay_secs: 0,
        retry: RetryConfig {
            initial_delay_millis: 10,
            max_delay_millis: 50,
            factor: 2.0,
        },
        ..NodeConfig::default()
    }
}

/// In-memory chain that is both adapter and transactor
pub struct FakeChain {
    height: AtomicU64,
    next_tx: AtomicU64,
    txs: Mutex<Vec<ChainTx>>,
    offline: AtomicBool,
    queries: AtomicU64,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            height: AtomicU64::new(100),
            next_tx: AtomicU64::new(1),
            txs: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            queries: AtomicU64::new(0),
        })
    }

    pub fn network() -> Network {
        Network::new("fakecoin", "testnet")
    }

    pub fn adapters(self: &Arc<Self>) -> Adapters {
        Adapters::new().with(self.clone())
    }

    /// Include every unconfirmed tx in the next block and mine `blocks` in
    /// total, so those txs end up with `blocks` confirmations
    pub fn mine(&self, blocks: u64) {
        if blocks == 0 {
            return;
        }
        let included = self.height.fetch_add(blocks, Ordering::SeqCst) + 1;
        for tx in self.txs.lock().iter_mut() {
            if tx.block_height.is_none() {
                tx.block_height = Some(included);
            }
        }
    }

    /// Broadcast a tx paying to `to`, as someone else would
    pub fn pay(&self, to: &[String]) -> String {
        let tx_id = format!("tx{:04}", self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.txs.lock().push(ChainTx {
            tx_id: tx_id.clone(),
            confirmations: None,
            block_height: None,
            to: to.to_vec(),
        });
        tx_id
    }

    pub fn txs(&self) -> Vec<ChainTx> {
        self.txs.lock().clone()
    }

    /// Calls to `addresses_transactions` so far
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> NodeResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NodeError::Blockchain("fakecoin is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockchainAdapter for FakeChain {
    fn blockchain(&self) -> &str {
        "fakecoin"
    }

    fn network_name(&self) -> &str {
        "testnet"
    }

    fn pub_key_to_address(&self, pub_key: &PubKey) -> NodeResult<String> {
        Ok(format!("fk1{}", &pub_key.to_hex()[..40]))
    }

    fn min_output_amount(&self) -> u64 {
        546
    }

    async fn get_height(&self) -> NodeResult<u64> {
        self.check_online()?;
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn addresses_transactions(
        &self,
        addresses: &[String],
        height: u64,
    ) -> NodeResult<Vec<ChainTx>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self
            .txs
            .lock()
            .iter()
            .filter(|tx| tx.to.iter().any(|to| addresses.contains(to)))
            .map(|tx| ChainTx {
                // The including block counts as the first confirmation
                confirmations: tx.block_height.map(|b| (height + 1).saturating_sub(b) as u32),
                ..tx.clone()
            })
            .collect())
    }
}

#[async_trait]
impl Transactor for FakeChain {
    async fn send(&self, outputs: Vec<TxOutput>) -> NodeResult<TxReceipt> {
        self.check_online()?;
        let to: Vec<String> = outputs.into_iter().map(|o| o.address).collect();
        Ok(TxReceipt {
            tx_id: self.pay(&to),
        })
    }
}

/// Records every delivery and hands it to the recipient's node when one
/// is registered
#[derive(Default)]
pub struct Mailbox {
    delivered: Mutex<Vec<(Link, Vec<u8>)>>,
    // Identity version each delivery was addressed to
    versions: Mutex<Vec<Link>>,
    peers: Mutex<HashMap<Link, Weak<Node>>>,
    failing: AtomicBool,
    fail_next: AtomicU32,
    unreachable: Mutex<HashSet<Link>>,
    failures: AtomicU32,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(&self, peer: &Arc<Node>) {
        self.peers.lock().insert(peer.permalink(), Arc::downgrade(peer));
    }

    pub fn delivered(&self) -> Vec<(Link, Vec<u8>)> {
        self.delivered.lock().clone()
    }

    pub fn versions(&self) -> Vec<Link> {
        self.versions.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` deliveries, whoever they are for
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every delivery to `peer` until it is reachable again
    pub fn set_unreachable(&self, peer: &Link, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(*peer);
        } else {
            set.remove(peer);
        }
    }

    /// Deliveries that failed so far
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn should_fail(&self, recipient: &Link) -> bool {
        self.failing.load(Ordering::SeqCst)
            || self.unreachable.lock().contains(recipient)
            || take_one(&self.fail_next)
    }
}

#[async_trait]
impl Deliver for Mailbox {
    async fn deliver(&self, message: &[u8], recipient: &IdentityInfo) -> NodeResult<()> {
        if self.should_fail(&recipient.permalink) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(NodeError::Delivery("peer unreachable".to_string()));
        }
        self.delivered
            .lock()
            .push((recipient.permalink, message.to_vec()));
        self.versions.lock().push(recipient.link);

        let peer = self
            .peers
            .lock()
            .get(&recipient.permalink)
            .and_then(Weak::upgrade);
        match peer {
            Some(peer) => match peer.receive(message).await {
                Ok(_) | Err(NodeError::Exists(_)) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        }
    }
}

/// In-memory log that can be told to fail the next seal appends
#[derive(Default)]
pub struct FlakyLog {
    inner: MemoryLog,
    failing_wroteseals: AtomicU32,
    failing_readseals: AtomicU32,
}

impl FlakyLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_wroteseals(&self, n: u32) {
        self.failing_wroteseals.store(n, Ordering::SeqCst);
    }

    pub fn fail_readseals(&self, n: u32) {
        self.failing_readseals.store(n, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LogStore for FlakyLog {
    fn append(&self, timestamp: u64, action: Action) -> NodeResult<LogEntry> {
        let failing = match action {
            Action::WroteSeal(_) => take_one(&self.failing_wroteseals),
            Action::ReadSeal(_) => take_one(&self.failing_readseals),
            _ => false,
        };
        if failing {
            return Err(NodeError::Storage("disk full".to_string()));
        }
        self.inner.append(timestamp, action)
    }

    fn read_from(&self, seq: u64, limit: usize) -> NodeResult<Vec<LogEntry>> {
        self.inner.read_from(seq, limit)
    }

    fn head(&self) -> NodeResult<u64> {
        self.inner.head()
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub mailbox: Arc<Mailbox>,
}

pub async fn node(name: &str, chain: &Arc<FakeChain>) -> TestNode {
    node_with(name, chain, test_config(), |options| options).await
}

/// Node with its own config and any further option changes
pub async fn node_with(
    name: &str,
    chain: &Arc<FakeChain>,
    config: NodeConfig,
    configure: impl FnOnce(NodeOptions) -> NodeOptions,
) -> TestNode {
    let mailbox = Mailbox::new();
    let options = configure(
        NodeOptions::memory(NodeKeys::generate().unwrap())
            .named(name)
            .with_config(config)
            .with_adapters(chain.adapters())
            .with_transactor(chain.clone())
            .with_deliver(mailbox.clone()),
    );
    TestNode {
        node: Arc::new(Node::open(options).await.unwrap()),
        mailbox,
    }
}

/// Two nodes that know each other, with alice's deliveries reaching bob
pub async fn pair(chain: &Arc<FakeChain>) -> (TestNode, TestNode) {
    let alice = node("alice", chain).await;
    let bob = node("bob", chain).await;
    alice
        .node
        .add_contact(bob.node.identity_object().unwrap())
        .await
        .unwrap();
    bob.node
        .add_contact(alice.node.identity_object().unwrap())
        .await
        .unwrap();
    alice.mailbox.connect(&bob.node);
    bob.mailbox.connect(&alice.node);
    (alice, bob)
}

/// Wait for the first event `pick` accepts
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut pick: impl FnMut(&NodeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `check` until it returns true
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
