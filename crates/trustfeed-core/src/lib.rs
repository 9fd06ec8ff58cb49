//! Trustfeed Core Library
//!
//! An event-sourced trust-messaging node: every fact the node knows is a
//! projection over one append-only change log.
//!
//! ## Overview
//!
//! ```text
//! API (Node) -> Actions -> ChangeLog -> projections (objects, seals,
//!                                        watches, address book)
//!                                           |
//!          sealer / sender / seal watcher <-+ (react by appending more)
//! ```
//!
//! - **Change log**: strictly ordered, validated, typed entries
//! - **Projections**: incremental folds with a persistent cursor, secondary
//!   indexes and change broadcasts; replaying from empty rebuilds them
//! - **Background components**: retry queues with backoff and
//!   pause/resume, driven by projection changes
//!
//! ## Quick Start
//!
//! ```ignore
//! use trustfeed_core::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::open_dir("~/.trustfeed", NodeConfig::default(), |o| o).await?;
//!     node.start()?;
//!
//!     let created = node.create(Object::new("thang").with("a", 1)).await?;
//!     println!("created {}", created.link);
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod chain;
pub mod config;
pub mod content;
pub mod controls;
pub mod dbs;
pub mod error;
pub mod events;
pub mod identity;
pub mod kv;
pub mod locks;
pub mod log;
pub mod logging;
pub mod node;
pub mod object;
pub mod projection;
pub mod retry;
pub mod sealer;
pub mod sealwatch;
pub mod sender;
pub mod storage;
pub mod types;

// Re-exports
pub use actions::Actions;
pub use chain::{Adapters, BlockchainAdapter, ChainTx, Transactor, TxOutput, TxReceipt};
pub use config::{NodeConfig, RetryConfig};
pub use error::{NodeError, NodeResult};
pub use events::NodeEvent;
pub use identity::{Ed25519Protocol, Keypair, Protocol};
pub use log::{Action, ChangeLog, LogEntry, LogStore};
pub use node::{Node, NodeOptions};
pub use object::{Identity, MessageBody, Object};
pub use sender::Deliver;
pub use storage::{NodeKeys, Storage};
pub use types::*;
