//! Blockchain collaborators
//!
//! The node never talks to a chain directly. Reads go through one
//! [`BlockchainAdapter`] per network, seal submissions through a
//! [`Transactor`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{NodeError, NodeResult};
use crate::types::{Network, PubKey};

/// A transaction paying to one or more watched addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTx {
    pub tx_id: String,
    /// Set when the adapter knows it; otherwise derived from `block_height`
    pub confirmations: Option<u32>,
    /// Height of the including block, `None` while unconfirmed
    pub block_height: Option<u64>,
    /// Output addresses
    pub to: Vec<String>,
}

impl ChainTx {
    /// Confirmations at chain height `height`
    pub fn confirmations_at(&self, height: u64) -> u32 {
        match (self.confirmations, self.block_height) {
            (Some(c), _) => c,
            (None, Some(block)) => height.saturating_sub(block).min(u32::MAX as u64) as u32,
            (None, None) => 0,
        }
    }
}

#[async_trait]
pub trait BlockchainAdapter: Send + Sync {
    fn blockchain(&self) -> &str;

    fn network_name(&self) -> &str;

    fn network(&self) -> Network {
        Network::new(self.blockchain(), self.network_name())
    }

    fn pub_key_to_address(&self, pub_key: &PubKey) -> NodeResult<String>;

    /// Smallest output amount the network relays
    fn min_output_amount(&self) -> u64;

    async fn get_height(&self) -> NodeResult<u64>;

    /// Transactions paying to any of `addresses`, as of chain height `height`
    async fn addresses_transactions(
        &self,
        addresses: &[String],
        height: u64,
    ) -> NodeResult<Vec<ChainTx>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_id: String,
}

/// Submits seal transactions
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn send(&self, outputs: Vec<TxOutput>) -> NodeResult<TxReceipt>;

    /// Whether one transaction may pay to several addresses
    fn multiple_outputs(&self) -> bool {
        true
    }
}

/// Adapters by network
#[derive(Clone, Default)]
pub struct Adapters {
    by_network: HashMap<Network, Arc<dyn BlockchainAdapter>>,
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn BlockchainAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn BlockchainAdapter>) {
        self.by_network.insert(adapter.network(), adapter);
    }

    pub fn get(&self, network: &Network) -> NodeResult<&Arc<dyn BlockchainAdapter>> {
        self.by_network
            .get(network)
            .ok_or_else(|| NodeError::Blockchain(format!("no adapter for {}", network)))
    }

    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.by_network.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_network.is_empty()
    }
}

/// Transactor for nodes that never seal
pub struct NoTransactor;

#[async_trait]
impl Transactor for NoTransactor {
    async fn send(&self, _outputs: Vec<TxOutput>) -> NodeResult<TxReceipt> {
        Err(NodeError::Blockchain("no transactor configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmations_prefer_adapter_value() {
        let tx = ChainTx {
            tx_id: "t".into(),
            confirmations: Some(4),
            block_height: Some(90),
            to: vec![],
        };
        assert_eq!(tx.confirmations_at(100), 4);

        let derived = ChainTx {
            confirmations: None,
            ..tx.clone()
        };
        assert_eq!(derived.confirmations_at(100), 10);
        assert_eq!(derived.confirmations_at(80), 0);

        let mempool = ChainTx {
            confirmations: None,
            block_height: None,
            ..tx
        };
        assert_eq!(mempool.confirmations_at(100), 0);
    }

    #[tokio::test]
    async fn test_no_transactor_fails() {
        assert!(NoTransactor.send(vec![]).await.is_err());
        assert!(Adapters::new().get(&Network::new("x", "y")).is_err());
    }
}
