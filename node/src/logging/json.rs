//! JSON-lines log file layer.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, SyncSender, TrySendError},
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing_subscriber::Layer;

/// Records buffered between the layer and the writer thread before new ones are dropped.
pub const JSON_LOG_CAPACITY: usize = 10_000;

const FLUSH_EVERY: usize = 1024;

#[derive(Debug, Serialize)]
struct LogRecord {
    t_ms: u64,
    level: &'static str,
    target: String,
    message: Option<String>,
    /// Lifted out of `fields` so per-peer and per-block traces can be filtered directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    peer_id: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<JsonValue>,
    fields: JsonMap<String, JsonValue>,
}

#[derive(Default)]
struct FieldCollector {
    fields: JsonMap<String, JsonValue>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: JsonValue) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, JsonValue::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, JsonValue::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, JsonValue::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map_or_else(|| JsonValue::String(value.to_string()), JsonValue::Number);
        self.insert(field, value);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, JsonValue::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, JsonValue::String(format!("{value:?}")));
    }
}

/// Writes log records to a file from a background thread.
///
/// Records are dropped (and counted) rather than blocking the logging thread
/// when the channel is full.
#[derive(Debug)]
pub struct JsonLogWriter {
    started_at: Instant,
    sender: Mutex<Option<SyncSender<LogRecord>>>,
    handle: Mutex<Option<JoinHandle<eyre::Result<()>>>>,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl JsonLogWriter {
    pub fn new(path: &Path, capacity: usize) -> eyre::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let (tx, rx) = mpsc::sync_channel::<LogRecord>(capacity.max(1));
        let handle = std::thread::spawn(move || -> eyre::Result<()> {
            let mut writer = BufWriter::new(file);
            let mut since_flush = 0usize;
            for record in rx {
                serde_json::to_writer(&mut writer, &record)?;
                writer.write_all(b"\n")?;
                since_flush += 1;
                if since_flush >= FLUSH_EVERY {
                    writer.flush()?;
                    since_flush = 0;
                }
            }
            writer.flush()?;
            Ok(())
        });

        Ok(Self {
            started_at: Instant::now(),
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    fn record(&self, record: LogRecord) {
        let sender = self.sender.lock().as_ref().cloned();
        let Some(sender) = sender else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match sender.try_send(record) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Close the channel and wait for the writer thread to flush.
    pub fn finish(&self) -> eyre::Result<()> {
        drop(self.sender.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(eyre::eyre!("json log writer thread panicked")),
            }
        }
        Ok(())
    }

    pub fn written_events(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Tracing layer that forwards events to a [`JsonLogWriter`].
#[derive(Clone)]
pub struct JsonLogLayer {
    writer: Arc<JsonLogWriter>,
}

impl JsonLogLayer {
    pub fn new(writer: Arc<JsonLogWriter>) -> Self {
        Self { writer }
    }
}

impl<S> Layer<S> for JsonLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let meta = event.metadata();
        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        let mut fields = collector.fields;
        let message = fields.remove("message").map(|value| match value {
            JsonValue::String(text) => text,
            other => other.to_string(),
        });
        let peer_id = fields.remove("peer_id");
        let hash = fields.remove("hash");
        self.writer.record(LogRecord {
            t_ms: self.writer.started_at.elapsed().as_millis() as u64,
            level: meta.level().as_str(),
            target: meta.target().to_string(),
            message,
            peer_id,
            hash,
            fields,
        });
    }
}
