use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub status: String,
    pub level: StatusLevel,
    pub description: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub content: String,
}

/// Envelope handed to the host's event callback.
///
/// Serializes as `{"type": "status" | "message", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PipeEvent {
    Status(StatusData),
    Message(MessageData),
}

impl PipeEvent {
    pub fn status(level: StatusLevel, description: impl Into<String>, done: bool) -> Self {
        Self::Status(StatusData {
            status: if done { "complete" } else { "in_progress" }.to_string(),
            level,
            description: description.into(),
            done,
        })
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self::Message(MessageData {
            content: content.into(),
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Message(_) => "message",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Status(data) if data.done)
    }
}

/// Host-side sink for pipe events. Poll workers emit from their own thread.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &PipeEvent) -> anyhow::Result<()>;
}

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `chat_id`, `ts`
/// - the event's `data` object is nested under `data`
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    chat_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, chat_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                chat_id: chat_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn write_event(&self, event: &PipeEvent) -> anyhow::Result<Value> {
        let line = event_line(event, &self.inner.chat_id)?;

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let encoded = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(line)
    }
}

impl EventEmitter for EventWriter {
    fn emit(&self, event: &PipeEvent) -> anyhow::Result<()> {
        self.write_event(event).map(|_| ())
    }
}

/// Builds the flat JSONL row for an event: `type`, `chat_id`, `ts`, then `data`.
pub fn event_line(event: &PipeEvent, chat_id: &str) -> anyhow::Result<Value> {
    let mut row = Map::new();
    row.insert(
        "type".to_string(),
        Value::String(event.event_type().to_string()),
    );
    row.insert("chat_id".to_string(), Value::String(chat_id.to_string()));
    row.insert("ts".to_string(), Value::String(now_utc_iso()));
    let encoded = serde_json::to_value(event)?;
    row.insert(
        "data".to_string(),
        encoded.get("data").cloned().unwrap_or(Value::Null),
    );
    Ok(Value::Object(row))
}

/// Buffers every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<PipeEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipeEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipeEvent::Message(data) => Some(data.content),
                PipeEvent::Status(_) => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<StatusData> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipeEvent::Status(data) => Some(data),
                PipeEvent::Message(_) => None,
            })
            .collect()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: &PipeEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording emitter lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
