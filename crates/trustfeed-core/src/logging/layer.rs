//! `tracing` layer appending events to a per-node JSONL file

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::line::LogLine;

/// Writes every event it sees to `<dir>/<date>_<node>.jsonl`
pub struct JsonlLayer {
    node: String,
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl JsonlLayer {
    pub fn new(dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        let node = node.into();
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = dir.join(format!("{}_{}.jsonl", date, node));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            node,
            path,
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn write(&self, line: &LogLine) -> std::io::Result<()> {
        let json = serde_json::to_string(line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut out = self.out.lock();
        writeln!(out, "{}", json)?;
        out.flush()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut line = LogLine::now(
            meta.level().as_str().to_lowercase(),
            &self.node,
            meta.target(),
            fields.message.unwrap_or_default(),
        );
        if !fields.values.is_empty() {
            line.fields = Some(Value::Object(fields.values));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let names: Vec<&str> = scope.from_root().map(|s| s.name()).collect();
            if !names.is_empty() {
                line.span = Some(names.join(" > "));
            }
        }

        // A logging failure must not take the node down
        let _ = self.write(&line);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        self.values.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.put(field, Value::String(text));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, Value::String(value.to_string()));
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}
