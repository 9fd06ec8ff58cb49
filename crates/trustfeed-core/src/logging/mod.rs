//! Logging setup for a node process.
//!
//! Console output goes through `tracing_subscriber::fmt`; a node can also
//! append structured JSONL to `<dir>/<date>_<node>.jsonl`:
//!
//! ```ignore
//! use trustfeed_core::logging::LoggingBuilder;
//!
//! let jsonl = LoggingBuilder::new()
//!     .verbosity(1)
//!     .jsonl("./logs", "alice")
//!     .init()?;
//! ```
//!
//! `RUST_LOG` overrides the verbosity level when set.
//!
//! ```bash
//! jq 'select(.level == "warn")' logs/*.jsonl
//! ```

mod layer;
mod line;

use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use layer::JsonlLayer;
pub use line::{read_dir_entries, read_entries, LogLine};

/// Map `-v` counts to a default filter
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Builds and installs the global subscriber
pub struct LoggingBuilder {
    filter: String,
    console: bool,
    jsonl: Option<(PathBuf, String)>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            filter: level_for(0).to_string(),
            console: true,
            jsonl: None,
        }
    }

    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.filter = level_for(verbosity).to_string();
        self
    }

    /// Explicit filter directives, e.g. "trustfeed_core=debug"
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn no_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Also write JSONL for `node` into `dir`
    pub fn jsonl(mut self, dir: impl Into<PathBuf>, node: impl Into<String>) -> Self {
        self.jsonl = Some((dir.into(), node.into()));
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter))
    }

    /// Install as the global default. Returns the JSONL file path, if any.
    pub fn init(self) -> std::io::Result<Option<PathBuf>> {
        let jsonl = match &self.jsonl {
            Some((dir, node)) => Some(JsonlLayer::new(dir, node.clone())?),
            None => None,
        };
        let path = jsonl.as_ref().map(|l| l.path().to_path_buf());
        let console = self
            .console
            .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(self.env_filter())
            .with(jsonl)
            .with(console)
            .try_init()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for(0), "warn");
        assert_eq!(level_for(1), "info");
        assert_eq!(level_for(2), "debug");
        assert_eq!(level_for(9), "trace");
    }
}
