//! Submits pending seals
//!
//! Every seal in SealsDB's `status=pending` index becomes a [`SealJob`] in a
//! single [`RetryStream`] keyed by seal uid. The worker pays the minimum
//! output amount to the seal address (and to the seal-prev address when the
//! transactor allows several outputs), then records `wroteseal`.
//!
//! A transaction is paid for once. When recording `wroteseal` fails after
//! the payment went through, the receipt is kept and later attempts only
//! retry the append.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::Actions;
use crate::chain::{Adapters, Transactor, TxOutput, TxReceipt};
use crate::config::RetryConfig;
use crate::controls::{ControlState, Controls, ResumeFn, StopFn};
use crate::dbs::{SealState, SealsDb};
use crate::error::{NodeError, NodeResult};
use crate::events::NodeEvent;
use crate::log::WroteSeal;
use crate::retry::{RetryItem, RetryStream, RetryWorker, WorkerError};
use crate::types::SealStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealJob {
    /// Primary key in SealsDB
    pub uid: String,
}

impl SealJob {
    fn of(seal: &SealState) -> Self {
        Self {
            uid: seal.uid.clone(),
        }
    }
}

impl RetryItem for SealJob {
    fn key(&self) -> String {
        self.uid.clone()
    }
}

/// What the worker did with a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealOutcome {
    Written { tx_id: String },
    AlreadySealed,
}

pub struct SealWorker {
    seals: SealsDb,
    adapters: Adapters,
    transactor: Arc<dyn Transactor>,
    actions: Actions,
    events: broadcast::Sender<NodeEvent>,
    // Paid transactions whose `wroteseal` is not recorded yet, by seal uid
    paid: Mutex<HashMap<String, TxReceipt>>,
}

impl SealWorker {
    /// Receipt of a transaction already paid for `uid`, if any
    pub fn paid(&self, uid: &str) -> Option<TxReceipt> {
        self.paid.lock().get(uid).cloned()
    }

    async fn pay(&self, seal: &SealState, seal_address: &str) -> Result<TxReceipt, WorkerError> {
        if let Some(receipt) = self.paid(&seal.uid) {
            debug!(uid = %seal.uid, tx_id = %receipt.tx_id, "seal already paid, recording it again");
            return Ok(receipt);
        }

        let adapter = self.adapters.get(&seal.network)?;
        let amount = adapter.min_output_amount();
        let mut outputs = vec![TxOutput {
            address: seal_address.to_string(),
            amount,
        }];
        if let Some(prev) = &seal.seal_prev_address {
            if self.transactor.multiple_outputs() {
                outputs.push(TxOutput {
                    address: prev.clone(),
                    amount,
                });
            }
        }

        let receipt = self
            .transactor
            .send(outputs)
            .await
            .map_err(WorkerError::retry)?;
        self.paid.lock().insert(seal.uid.clone(), receipt.clone());
        Ok(receipt)
    }
}

#[async_trait]
impl RetryWorker<SealJob> for SealWorker {
    type Output = SealOutcome;

    async fn process(&self, job: &SealJob) -> Result<SealOutcome, WorkerError> {
        let seal = self
            .seals
            .get(&job.uid)?
            .ok_or_else(|| WorkerError::skip(NodeError::NotFound(format!("seal {}", job.uid))))?;
        if seal.is_sealed() {
            self.paid.lock().remove(&seal.uid);
            return Ok(SealOutcome::AlreadySealed);
        }
        let (Some(link), Some(seal_address)) = (seal.link, seal.seal_address.clone()) else {
            return Err(WorkerError::skip(NodeError::Validation(format!(
                "seal {} has no link or seal address",
                seal.uid
            ))));
        };

        let receipt = self.pay(&seal, &seal_address).await?;
        info!(uid = %seal.uid, %link, tx_id = %receipt.tx_id, "seal written");

        let written = self.actions.wrote_seal(WroteSeal {
            link,
            prev_link: seal.prev_link,
            seal_address,
            seal_prev_address: seal.seal_prev_address.clone(),
            base_pub_key: seal.base_pub_key,
            network: seal.network.clone(),
            tx_id: receipt.tx_id.clone(),
        });
        if let Err(e) = written {
            warn!(uid = %seal.uid, tx_id = %receipt.tx_id, error = %e, "paid seal not recorded");
            let _ = self.events.send(NodeEvent::error(
                "sealer",
                format!("seal {} paid in {} but not recorded: {}", seal.uid, receipt.tx_id, e),
            ));
            return Err(e.into());
        }
        self.paid.lock().remove(&seal.uid);
        Ok(SealOutcome::Written {
            tx_id: receipt.tx_id,
        })
    }
}

type SealStream = RetryStream<SealJob, SealWorker>;

struct Running {
    stream: Arc<SealStream>,
    cancel: CancellationToken,
}

/// Background component draining pending seals
pub struct Sealer {
    controls: Controls,
    running: Arc<Mutex<Option<Running>>>,
}

impl Sealer {
    pub fn new(
        seals: SealsDb,
        adapters: Adapters,
        transactor: Arc<dyn Transactor>,
        actions: Actions,
        retry: RetryConfig,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let running: Arc<Mutex<Option<Running>>> = Arc::new(Mutex::new(None));
        let worker = Arc::new(SealWorker {
            seals: seals.clone(),
            adapters,
            transactor,
            actions,
            events,
            paid: Mutex::new(HashMap::new()),
        });

        let slot = running.clone();
        let start = move || -> NodeResult<StopFn> {
            let stream = Arc::new(RetryStream::spawn("sealer", worker.clone(), &retry));
            let cancel = CancellationToken::new();
            feed(&seals, stream.clone(), cancel.clone())?;
            *slot.lock() = Some(Running {
                stream,
                cancel: cancel.clone(),
            });

            let slot = slot.clone();
            Ok(Box::new(move || {
                if let Some(running) = slot.lock().take() {
                    running.cancel.cancel();
                    running.stream.close();
                }
            }) as StopFn)
        };

        let slot = running.clone();
        let pause = move || -> ResumeFn {
            let stream = slot.lock().as_ref().map(|r| r.stream.clone());
            if let Some(stream) = &stream {
                stream.pause();
            }
            Box::new(move || {
                if let Some(stream) = stream {
                    stream.resume();
                }
            })
        };

        Self {
            controls: Controls::new("sealer", start).with_pause(pause),
            running,
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

    /// The running queue, for observing outputs and failures
    pub fn stream(&self) -> Option<Arc<RetryStream<SealJob, SealWorker>>> {
        self.running.lock().as_ref().map(|r| r.stream.clone())
    }
}

/// Push the pending snapshot, then every seal that becomes pending
fn feed(seals: &SealsDb, stream: Arc<SealStream>, cancel: CancellationToken) -> NodeResult<()> {
    let pending = SealStatus::Pending.as_str();
    let (snapshot, mut changes) = seals.projection().live("status", pending)?;
    for seal in &snapshot {
        stream.push(SealJob::of(seal));
    }

    let seals = seals.clone();
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = cancel.cancelled() => return,
                change = changes.recv() => change,
            };
            match change {
                Ok(change) => {
                    let Some(new) = change.new else { continue };
                    if seals.projection().indexed_under("status", &new, pending) {
                        stream.push(SealJob::of(&new));
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "sealer lagged behind seal changes, rescanning");
                    match seals.pending() {
                        Ok(all) => {
                            for seal in &all {
                                stream.push(SealJob::of(seal));
                            }
                        }
                        Err(e) => warn!(error = %e, "rescan failed"),
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    });
    Ok(())
}
