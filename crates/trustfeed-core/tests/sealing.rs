//! Seal lifecycle against a fake chain

mod common;

use std::time::Duration;

use common::{next_event, node, node_with, test_config, FakeChain, FlakyLog, TestNode};
use trustfeed_core::dbs::{ObjectState, SealState};
use trustfeed_core::{NodeConfig, NodeError, NodeEvent, Object, SealStatus, WatchType};

async fn sealed(alice: &TestNode, object: &ObjectState) -> SealState {
    let mut events = alice.node.subscribe();
    let network = FakeChain::network();
    let pending = alice.node.seal(&object.link, &network).await.unwrap();
    assert_eq!(pending.status, SealStatus::Pending);
    assert_eq!(pending.tx_id, None);

    alice.node.sealer().start().unwrap();
    let written = next_event(&mut events, |e| match e {
        NodeEvent::WroteSeal(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    alice.node.sealer().stop();
    alice.node.wait_live().await.unwrap();
    written
}

async fn create(alice: &TestNode, object: Object) -> ObjectState {
    alice.node.create(object).await.unwrap()
}

#[tokio::test]
async fn test_seal_is_written_and_confirmed() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let object = create(&alice, Object::new("thang").with("a", 1)).await;

    let written = sealed(&alice, &object).await;
    assert_eq!(written.status, SealStatus::Sealed);
    assert_eq!(written.link, Some(object.link));
    let txs = chain.txs();
    assert_eq!(txs.len(), 1);
    assert_eq!(written.tx_id.as_deref(), Some(txs[0].tx_id.as_str()));
    assert_eq!(txs[0].to, vec![written.seal_address.clone().unwrap()]);

    let state = alice.node.objects().get(&object.link).unwrap().unwrap();
    assert_eq!(state.sealstatus, Some(SealStatus::Sealed));
    assert_eq!(state.tx_id, written.tx_id);

    // Seen in the mempool, then confirmed
    let mut events = alice.node.subscribe();
    alice.node.sync().await.unwrap();
    let read = next_event(&mut events, |e| match e {
        NodeEvent::ReadSeal(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    assert_eq!(read.confirmations, Some(0));

    chain.mine(3);
    alice.node.sync().await.unwrap();
    let confirmed = next_event(&mut events, |e| match e {
        NodeEvent::SealConfirmed(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    assert_eq!(confirmed.confirmations, Some(3));
    assert_eq!(confirmed.uid, written.uid);

    // The this-version watch is done; the next-version watch stays
    let watches = alice.node.watches().for_link(&object.link).unwrap();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].watch_type, WatchType::NextVersion);
}

#[tokio::test]
async fn test_seal_twice_is_rejected() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let object = create(&alice, Object::new("thang")).await;
    let network = FakeChain::network();

    alice.node.seal(&object.link, &network).await.unwrap();
    let again = alice.node.seal(&object.link, &network).await;
    assert!(matches!(again, Err(NodeError::Exists(_))));
    assert_eq!(alice.node.seals().pending().unwrap().len(), 1);
    assert_eq!(alice.node.watches().for_link(&object.link).unwrap().len(), 2);
}

#[tokio::test]
async fn test_seal_without_adapter_fails() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let object = create(&alice, Object::new("thang")).await;

    let result = alice
        .node
        .seal(&object.link, &trustfeed_core::Network::new("other", "main"))
        .await;
    assert!(matches!(result, Err(NodeError::Blockchain(_))));
    assert!(alice.node.seals().pending().unwrap().is_empty());
}

#[tokio::test]
async fn test_new_version_seal_pays_prev_address() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let v1 = create(&alice, Object::new("thang").with("v", 1)).await;
    sealed(&alice, &v1).await;

    let body = alice.node.content().get(&v1.link).unwrap();
    let v2 = create(&alice, body.next_version(v1.link).with("v", 2)).await;
    assert_eq!(v2.permalink, v1.permalink);
    assert_eq!(v2.prev_link, Some(v1.link));

    let written = sealed(&alice, &v2).await;
    let prev_address = written.seal_prev_address.clone().unwrap();
    let tx = chain
        .txs()
        .into_iter()
        .find(|tx| Some(&tx.tx_id) == written.tx_id.as_ref())
        .unwrap();
    assert!(tx.to.contains(&prev_address));
    assert!(tx.to.contains(written.seal_address.as_ref().unwrap()));

    // v1's next-version watch sits on the address v2's seal pays to
    let next = alice
        .node
        .watches()
        .for_link(&v1.link)
        .unwrap()
        .into_iter()
        .find(|w| w.watch_type == WatchType::NextVersion)
        .unwrap();
    assert_eq!(next.address, prev_address);
}

#[tokio::test]
async fn test_peer_sees_new_version() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let bob = node("bob", &chain).await;
    let network = FakeChain::network();

    let v1 = create(&alice, Object::new("thang").with("v", 1)).await;
    bob.node
        .watch_next_version(&v1.link, &alice.node.pub_key(), &network)
        .await
        .unwrap();
    let duplicate = bob
        .node
        .watch_next_version(&v1.link, &alice.node.pub_key(), &network)
        .await;
    assert!(matches!(duplicate, Err(NodeError::Exists(_))));

    let body = alice.node.content().get(&v1.link).unwrap();
    let v2 = create(&alice, body.next_version(v1.link).with("v", 2)).await;
    let written = sealed(&alice, &v2).await;
    chain.mine(1);

    let mut events = bob.node.subscribe();
    bob.node.sync().await.unwrap();
    let seen = next_event(&mut events, |e| match e {
        NodeEvent::NewVersion(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    assert_eq!(seen.prev_link, Some(v1.link));
    assert_eq!(seen.tx_id, written.tx_id);
    assert_eq!(seen.confirmations, Some(1));
    // bob holds neither version, so the successor's link is unknown
    assert_eq!(seen.link, None);
}

#[tokio::test]
async fn test_peer_watches_a_specific_seal() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let bob = node("bob", &chain).await;
    let network = FakeChain::network();

    let object = create(&alice, Object::new("thang")).await;
    let watch = bob
        .node
        .watch_seal(&object.link, None, &alice.node.pub_key(), &network)
        .await
        .unwrap();
    assert_eq!(watch.watch_type, WatchType::ThisVersion);

    let written = sealed(&alice, &object).await;
    assert_eq!(written.seal_address.as_deref(), Some(watch.address.as_str()));

    chain.mine(1);
    bob.node.sync().await.unwrap();
    let seal = bob.node.seals().by_address(&watch.network, &watch.address).unwrap().unwrap();
    assert_eq!(seal.status, SealStatus::Sealed);
    assert_eq!(seal.tx_id, written.tx_id);
    assert_eq!(seal.link, Some(object.link));

    // Re-syncing at the same height records nothing new
    let head = bob.node.log().head();
    bob.node.sync().await.unwrap();
    assert_eq!(bob.node.log().head(), head);
}

#[tokio::test]
async fn test_sync_spans_address_batches() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let network = FakeChain::network();

    let mut objects = Vec::new();
    for i in 0..5 {
        let object = create(&alice, Object::new("thang").with("i", i)).await;
        alice.node.seal(&object.link, &network).await.unwrap();
        objects.push(object);
    }
    alice.node.sealer().start().unwrap();
    let node = alice.node.clone();
    common::eventually(|| {
        let node = node.clone();
        async move { node.seals().pending().unwrap().is_empty() }
    })
    .await;
    alice.node.sealer().stop();

    chain.mine(3);
    alice.node.sync().await.unwrap();
    for object in &objects {
        let seal = alice.node.seals().for_link(&object.link).unwrap();
        assert_eq!(seal.len(), 1);
        assert_eq!(seal[0].confirmations, Some(3));
    }
    // Only next-version watches remain
    let remaining = alice.node.watches().all().unwrap();
    assert_eq!(remaining.len(), objects.len());
    assert!(remaining
        .iter()
        .all(|w| w.watch_type == WatchType::NextVersion));
}

#[tokio::test]
async fn test_chain_outage_is_reported() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let object = create(&alice, Object::new("thang")).await;
    alice
        .node
        .seal(&object.link, &FakeChain::network())
        .await
        .unwrap();

    let mut events = alice.node.subscribe();
    chain.set_offline(true);
    alice.node.sync().await.unwrap();
    let component = next_event(&mut events, |e| match e {
        NodeEvent::Error { component, .. } => Some(component.clone()),
        _ => None,
    })
    .await;
    assert_eq!(component, "sealwatch");
}

#[tokio::test]
async fn test_paused_watcher_queues_sync() {
    let chain = FakeChain::new();
    let alice = node("alice", &chain).await;
    let object = create(&alice, Object::new("thang")).await;
    let written = sealed(&alice, &object).await;

    let watcher = alice.node.watcher();
    watcher.start().unwrap();
    watcher.pause().unwrap();
    chain.mine(1);

    let mut events = alice.node.subscribe();
    watcher.sync().await;
    assert!(watcher.is_queued());

    watcher.resume().unwrap();
    let read = next_event(&mut events, |e| match e {
        NodeEvent::ReadSeal(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    assert_eq!(read.tx_id, written.tx_id);
    watcher.stop();
}

#[tokio::test]
async fn test_failed_seal_record_does_not_pay_again() {
    let chain = FakeChain::new();
    let log = FlakyLog::new();
    let alice = node_with("alice", &chain, test_config(), |options| {
        options.with_log(log.clone())
    })
    .await;
    let object = create(&alice, Object::new("thang")).await;

    let mut events = alice.node.subscribe();
    log.fail_wroteseals(2);
    let written = sealed(&alice, &object).await;

    let txs = chain.txs();
    assert_eq!(txs.len(), 1);
    assert_eq!(written.tx_id.as_deref(), Some(txs[0].tx_id.as_str()));
    let message = next_event(&mut events, |e| match e {
        NodeEvent::Error { component, message } if component == "sealer" => {
            Some(message.clone())
        }
        _ => None,
    })
    .await;
    assert!(message.contains(&txs[0].tx_id));
}

#[tokio::test]
async fn test_rejected_readseal_is_reported_and_retried() {
    let chain = FakeChain::new();
    let log = FlakyLog::new();
    let alice = node_with("alice", &chain, test_config(), |options| {
        options.with_log(log.clone())
    })
    .await;
    let object = create(&alice, Object::new("thang")).await;
    let written = sealed(&alice, &object).await;

    let mut events = alice.node.subscribe();
    log.fail_readseals(1);
    alice.node.sync().await.unwrap();
    let component = next_event(&mut events, |e| match e {
        NodeEvent::Error { component, .. } => Some(component.clone()),
        _ => None,
    })
    .await;
    assert_eq!(component, "sealwatch");
    let seal = alice.node.seals().get(&written.uid).unwrap().unwrap();
    assert_eq!(seal.confirmations, None);

    alice.node.sync().await.unwrap();
    let read = next_event(&mut events, |e| match e {
        NodeEvent::ReadSeal(s) => Some(s.clone()),
        _ => None,
    })
    .await;
    assert_eq!(read.tx_id, written.tx_id);
}

/// One address per batch, a minute apart
fn throttled() -> NodeConfig {
    NodeConfig {
        sync_batch_size: 1,
        sync_batch_delay_secs: 60,
        ..test_config()
    }
}

#[tokio::test(start_paused = true)]
async fn test_sync_waits_between_batches() {
    let chain = FakeChain::new();
    let alice = node_with("alice", &chain, throttled(), |options| options).await;
    let object = create(&alice, Object::new("thang")).await;
    alice
        .node
        .seal(&object.link, &FakeChain::network())
        .await
        .unwrap();
    // this-version and next-version watches pay to two addresses
    assert_eq!(alice.node.watches().all().unwrap().len(), 2);

    let node = alice.node.clone();
    let sync = tokio::spawn(async move { node.sync().await });
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(chain.queries(), 1);
    assert!(!sync.is_finished());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(chain.queries(), 2);
    sync.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_syncs_during_a_sync_run_once_more() {
    let chain = FakeChain::new();
    let alice = node_with("alice", &chain, throttled(), |options| options).await;
    let object = create(&alice, Object::new("thang")).await;
    alice
        .node
        .seal(&object.link, &FakeChain::network())
        .await
        .unwrap();
    alice.node.watcher().reload().unwrap();

    let node = alice.node.clone();
    let first = tokio::spawn(async move { node.watcher().sync().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(chain.queries(), 1);

    for _ in 0..3 {
        alice.node.watcher().sync().await;
    }
    assert!(alice.node.watcher().is_queued());

    first.await.unwrap();
    // Two addresses per pass: the running pass and a single queued one
    assert_eq!(chain.queries(), 4);
    assert!(!alice.node.watcher().is_queued());
}
