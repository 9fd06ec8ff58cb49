//! Trustfeed node
//!
//! Thin process bootstrap around trustfeed-core.
//!
//! ## Usage
//!
//! ```bash
//! # Create node keys and publish an identity
//! trustfeed-node init --name alice
//!
//! # Show identity and projection sizes
//! trustfeed-node info
//!
//! # Run the sealer, sender and seal watcher until Ctrl-C
//! trustfeed-node run
//!
//! # Print change log entries as JSON lines
//! trustfeed-node log --from 1 --limit 20
//!
//! # Rebuild every projection from the log and compare with the stored ones
//! trustfeed-node replay
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use trustfeed_core::content::ObjectStore;
use trustfeed_core::kv::MemoryStore;
use trustfeed_core::logging::LoggingBuilder;
use trustfeed_core::node::{fold_all, DB_FILE};
use trustfeed_core::{Ed25519Protocol, LogStore, Node, NodeConfig, NodeEvent, Storage};

/// Trustfeed - event-sourced P2P trust messaging
#[derive(Parser)]
#[command(name = "trustfeed-node")]
#[command(version = "0.1.0")]
#[command(about = "Trustfeed - event-sourced P2P trust messaging")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.trustfeed)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data dir>/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSONL logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create node keys and identity
    Init {
        /// Name published in the identity
        #[arg(long)]
        name: Option<String>,
    },

    /// Show node information
    Info,

    /// Run background components until Ctrl-C
    Run,

    /// Print change log entries
    Log {
        /// First seq to print
        #[arg(long, default_value_t = 1)]
        from: u64,

        /// Maximum number of entries
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Rebuild all projections from the log into memory and compare
    Replay,
}

/// Get the default data directory (~/.trustfeed)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trustfeed")
}

fn load_config(path: &Path) -> Result<NodeConfig> {
    NodeConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn require_node(data_dir: &Path) -> Result<PathBuf> {
    let path = data_dir.join(DB_FILE);
    if !path.exists() {
        anyhow::bail!(
            "no node at {} (run `trustfeed-node init` first)",
            data_dir.display()
        );
    }
    Ok(path)
}

fn open_storage(data_dir: &Path) -> Result<Storage> {
    let path = require_node(data_dir)?;
    Storage::new(&path).with_context(|| format!("opening {}", path.display()))
}

fn print_identity(node: &Node, data_dir: &Path) {
    let identity = node.identity();
    println!("Identity:");
    if let Some(name) = &identity.identity.name {
        println!("  Name: {}", name);
    }
    println!("  Permalink: {}", identity.permalink);
    println!("  Public key: {}", node.pub_key());
    println!();
    println!("Data directory: {}", data_dir.display());
}

fn describe(event: &NodeEvent) -> String {
    match event {
        NodeEvent::Message(m) => format!("from {} seq {:?}: {}", m.author, m.seq, m.link),
        NodeEvent::Sent(m) | NodeEvent::SendAborted(m) => {
            format!("to {:?}: {}", m.recipient, m.link)
        }
        NodeEvent::WroteSeal(s)
        | NodeEvent::ReadSeal(s)
        | NodeEvent::SealConfirmed(s)
        | NodeEvent::NewVersion(s) => format!(
            "{} tx {} ({} confirmations)",
            s.uid,
            s.tx_id.as_deref().unwrap_or("-"),
            s.confirmations.unwrap_or(0)
        ),
        NodeEvent::Error { component, message } => format!("{}: {}", component, message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config_path = cli
        .config
        .unwrap_or_else(|| data_dir.join("config.json"));

    let mut logging = LoggingBuilder::new().verbosity(cli.verbose);
    if let Some(log_dir) = &cli.log_dir {
        let node_name = data_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("node")
            .trim_start_matches('.')
            .to_string();
        logging = logging.jsonl(log_dir, node_name);
    }
    logging.init().context("installing logger")?;

    match cli.command {
        Commands::Init { name } => {
            let config = load_config(&config_path)?;
            let node = Node::open_dir(&data_dir, config.clone(), |options| match name {
                Some(name) => options.named(name),
                None => options,
            })
            .await
            .context("opening node")?;
            if !config_path.exists() {
                config
                    .save(&config_path)
                    .with_context(|| format!("writing {}", config_path.display()))?;
            }
            println!("Trustfeed node initialized");
            println!();
            print_identity(&node, &data_dir);
            node.shutdown().await;
        }

        Commands::Info => {
            require_node(&data_dir)?;
            let config = load_config(&config_path)?;
            let node = Node::open_dir(&data_dir, config, |options| options)
                .await
                .context("opening node")?;
            node.wait_live().await?;

            println!("Trustfeed node v0.1.0");
            println!();
            print_identity(&node, &data_dir);
            println!("Log head: {}", node.log().head());
            println!("Contacts: {}", node.address_book().all()?.len());
            println!("Pending seals: {}", node.seals().pending()?.len());
            println!("Watches: {}", node.watches().all()?.len());
            node.shutdown().await;
        }

        Commands::Run => {
            require_node(&data_dir)?;
            let config = load_config(&config_path)?;
            let node = Node::open_dir(&data_dir, config, |options| options)
                .await
                .context("opening node")?;
            let mut events = node.subscribe();
            node.start()?;
            println!("Running as {} (Ctrl-C to stop)", node.permalink());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => println!("[{}] {}", event.kind(), describe(&event)),
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "event output lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            node.shutdown().await;
            println!("Stopped");
        }

        Commands::Log { from, limit } => {
            let storage = open_storage(&data_dir)?;
            for entry in storage.log().read_from(from, limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }

        Commands::Replay => {
            let storage = open_storage(&data_dir)?;
            let config = load_config(&config_path)?;
            let content = ObjectStore::new(Arc::new(storage.kv()), Arc::new(Ed25519Protocol));
            let log: Arc<dyn LogStore> = Arc::new(storage.log());

            let replayed = fold_all(log.clone(), content.clone(), MemoryStore::shared(), &config)
                .context("replaying log")?;
            let stored = fold_all(log, content, Arc::new(storage.kv()), &config)
                .context("catching up stored projections")?;

            println!("Entries:  {}", replayed.head);
            println!("Objects:  {} (stored {})", replayed.objects, stored.objects);
            println!("Seals:    {} (stored {})", replayed.seals, stored.seals);
            println!("Watches:  {} (stored {})", replayed.watches, stored.watches);
            println!("Contacts: {} (stored {})", replayed.contacts, stored.contacts);

            if replayed != stored {
                anyhow::bail!("replayed projections differ from stored ones");
            }
            println!("Replay matches stored projections");
        }
    }

    Ok(())
}
