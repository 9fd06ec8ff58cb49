//! Polls blockchains for seal transactions on watched addresses
//!
//! The watcher keeps a live copy of WatchesDB (snapshot plus tailed
//! changes). A sync groups the watches by network, asks each network's
//! adapter for the transactions paying to the watched addresses in throttled
//! batches, and records a `readseal` for every transaction that is deeper
//! than what the matching watch has already seen.
//!
//! Syncs never overlap: a sync requested while one runs, or while the
//! watcher is paused, sets a single `queued` flag and runs once afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::Actions;
use crate::chain::{Adapters, BlockchainAdapter, ChainTx};
use crate::controls::{ControlState, Controls, ResumeFn, StopFn};
use crate::dbs::{ObjectsDb, WatchState, WatchesDb};
use crate::error::{NodeError, NodeResult};
use crate::events::NodeEvent;
use crate::identity::Protocol;
use crate::log::ReadSeal;
use crate::projection::Change;
use crate::types::{Network, WatchType};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

#[derive(Default)]
struct SyncFlags {
    running: bool,
    queued: bool,
    paused: bool,
}

struct WatcherInner {
    watches: WatchesDb,
    objects: ObjectsDb,
    actions: Actions,
    adapters: Adapters,
    protocol: Arc<dyn Protocol>,
    config: WatcherConfig,
    events: broadcast::Sender<NodeEvent>,
    // Live copy of WatchesDB by key
    live: Mutex<HashMap<String, WatchState>>,
    flags: Mutex<SyncFlags>,
    cancel: Mutex<CancellationToken>,
}

impl WatcherInner {
    /// Run a sync now, or queue one if a sync is running or we are paused
    async fn sync(self: &Arc<Self>) {
        {
            let mut flags = self.flags.lock();
            if flags.running || flags.paused {
                flags.queued = true;
                return;
            }
            flags.running = true;
        }
        loop {
            self.sync_once().await;
            let mut flags = self.flags.lock();
            if flags.queued && !flags.paused {
                flags.queued = false;
                continue;
            }
            flags.running = false;
            return;
        }
    }

    async fn sync_once(&self) {
        let mut groups: BTreeMap<Network, Vec<WatchState>> = BTreeMap::new();
        for watch in self.live.lock().values() {
            groups
                .entry(watch.network.clone())
                .or_default()
                .push(watch.clone());
        }
        debug!(networks = groups.len(), "seal sync");
        for (network, watches) in groups {
            if let Err(e) = self.sync_network(&network, watches).await {
                warn!(%network, error = %e, "seal sync failed");
                let _ = self
                    .events
                    .send(NodeEvent::error("sealwatch", format!("{}: {}", network, e)));
            }
        }
    }

    async fn sync_network(&self, network: &Network, mut watches: Vec<WatchState>) -> NodeResult<()> {
        let adapter = self.adapters.get(network)?.clone();
        let height = adapter.get_height().await?;

        watches.sort_by(|a, b| a.address.cmp(&b.address));
        let mut addresses: Vec<String> = watches.iter().map(|w| w.address.clone()).collect();
        addresses.dedup();

        let cancel = self.cancel.lock().clone();
        for (i, batch) in addresses.chunks(self.config.batch_size.max(1)).enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.batch_delay) => {}
                }
            }
            let txs = adapter.addresses_transactions(batch, height).await?;
            for tx in &txs {
                self.record(adapter.as_ref(), tx, height);
            }
        }
        Ok(())
    }

    /// Emit a `readseal` for `tx` against the first watch it pays to
    fn record(&self, adapter: &dyn BlockchainAdapter, tx: &ChainTx, height: u64) {
        let confirmations = tx.confirmations_at(height);
        let network = adapter.network();
        let watch = {
            let live = self.live.lock();
            let mut candidates: Vec<&WatchState> = live
                .values()
                .filter(|w| w.network == network && tx.to.contains(&w.address))
                .collect();
            candidates.sort_by(|a, b| a.key().cmp(&b.key()));
            candidates.first().map(|w| (*w).clone())
        };
        let Some(watch) = watch else {
            return;
        };
        if let Some(seen) = watch.confirmations {
            if confirmations <= seen {
                return;
            }
        }

        let read = match self.read_seal(adapter, &watch, tx, confirmations) {
            Ok(read) => read,
            Err(e) => {
                warn!(tx_id = %tx.tx_id, error = %e, "cannot build readseal");
                let _ = self.events.send(NodeEvent::error(
                    "sealwatch",
                    format!("cannot build readseal for {}: {}", tx.tx_id, e),
                ));
                return;
            }
        };
        match self.actions.read_seal(read) {
            Ok(entry) => {
                info!(
                    seq = entry.seq,
                    tx_id = %tx.tx_id,
                    address = %watch.address,
                    confirmations,
                    "seal observed"
                );
                if let Some(w) = self.live.lock().get_mut(&watch.key()) {
                    w.confirmations = Some(confirmations);
                    w.tx_id = Some(tx.tx_id.clone());
                }
            }
            Err(NodeError::Exists(_)) => {
                debug!(tx_id = %tx.tx_id, "readseal already recorded");
            }
            Err(e) => {
                warn!(tx_id = %tx.tx_id, error = %e, "readseal rejected");
                let _ = self.events.send(NodeEvent::error(
                    "sealwatch",
                    format!("readseal for {} rejected: {}", tx.tx_id, e),
                ));
            }
        }
    }

    fn read_seal(
        &self,
        adapter: &dyn BlockchainAdapter,
        watch: &WatchState,
        tx: &ChainTx,
        confirmations: u32,
    ) -> NodeResult<ReadSeal> {
        let base = watch.base_pub_key;
        let mut read = ReadSeal {
            link: None,
            prev_link: None,
            seal_address: None,
            seal_prev_address: None,
            base_pub_key: base,
            network: watch.network.clone(),
            tx_id: tx.tx_id.clone(),
            confirmations,
            header_hash: watch.header_hash.clone(),
            watch_type: watch.watch_type,
        };
        match watch.watch_type {
            WatchType::ThisVersion => {
                read.link = Some(watch.link);
                read.seal_address = Some(watch.address.clone());
                if let Some(prev) = watch.prev_link {
                    let prev_key = self.protocol.seal_prev_pub_key(&prev, &base);
                    read.prev_link = Some(prev);
                    read.seal_prev_address = Some(adapter.pub_key_to_address(&prev_key)?);
                }
            }
            WatchType::NextVersion => {
                read.prev_link = Some(watch.link);
                read.seal_prev_address = Some(watch.address.clone());
                // The successor may already be known locally
                if let Some(next) = self.objects.successors(&watch.link)?.into_iter().next() {
                    let key = self.protocol.seal_pub_key(&next.link, &base);
                    read.link = Some(next.link);
                    read.seal_address = Some(adapter.pub_key_to_address(&key)?);
                }
            }
        }
        Ok(read)
    }

    fn load_live(&self) -> NodeResult<broadcast::Receiver<Change<WatchState>>> {
        let (snapshot, changes) = self.watches.projection().live_all()?;
        let mut live = self.live.lock();
        live.clear();
        live.extend(snapshot);
        Ok(changes)
    }
}

/// Background component syncing watched addresses
pub struct SealWatcher {
    inner: Arc<WatcherInner>,
    controls: Controls,
}

impl SealWatcher {
    pub fn new(
        watches: WatchesDb,
        objects: ObjectsDb,
        actions: Actions,
        adapters: Adapters,
        protocol: Arc<dyn Protocol>,
        config: WatcherConfig,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let inner = Arc::new(WatcherInner {
            watches,
            objects,
            actions,
            adapters,
            protocol,
            config,
            events,
            live: Mutex::new(HashMap::new()),
            flags: Mutex::new(SyncFlags::default()),
            cancel: Mutex::new(CancellationToken::new()),
        });

        let this = inner.clone();
        let start = move || -> NodeResult<StopFn> {
            let mut changes = this.load_live()?;
            let cancel = CancellationToken::new();
            *this.cancel.lock() = cancel.clone();

            let tail = this.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let change = tokio::select! {
                        _ = token.cancelled() => return,
                        change = changes.recv() => change,
                    };
                    match change {
                        Ok(change) => {
                            let mut live = tail.live.lock();
                            match change.new {
                                Some(watch) => {
                                    live.insert(change.key, watch);
                                }
                                None => {
                                    live.remove(&change.key);
                                }
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "watcher lagged behind watch changes, reloading");
                            match tail.load_live() {
                                Ok(fresh) => changes = fresh,
                                Err(e) => warn!(error = %e, "reload failed"),
                            }
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            });

            let timer = this.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(timer.config.interval);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticks.tick() => timer.sync().await,
                    }
                }
            });

            Ok(Box::new(move || cancel.cancel()) as StopFn)
        };

        let this = inner.clone();
        let pause = move || -> ResumeFn {
            this.flags.lock().paused = true;
            let this = this.clone();
            Box::new(move || {
                let run_queued = {
                    let mut flags = this.flags.lock();
                    flags.paused = false;
                    flags.queued && !flags.running
                };
                if run_queued {
                    this.flags.lock().queued = false;
                    let this = this.clone();
                    tokio::spawn(async move { this.sync().await });
                }
            })
        };

        Self {
            inner,
            controls: Controls::new("sealwatch", start).with_pause(pause),
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

    /// Sync now; coalesced with a sync already running
    pub async fn sync(&self) {
        self.inner.sync().await
    }

    /// Whether a sync is waiting to run
    pub fn is_queued(&self) -> bool {
        self.inner.flags.lock().queued
    }

    /// Number of watches in the live set
    pub fn watching(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Refresh the live set from WatchesDB without starting the watcher
    pub fn reload(&self) -> NodeResult<()> {
        self.inner.load_live().map(|_| ())
    }
}
