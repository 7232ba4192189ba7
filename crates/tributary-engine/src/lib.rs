//! Chat pipes that delegate a conversation turn to an external service and
//! stream progress back to the host while the work runs.

pub mod image;
pub mod poller;
pub mod status;
pub mod transport;
pub mod workflow;

use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use serde_json::Value;
use tributary_contracts::events::EventEmitter;
use tributary_contracts::messages::{PipeOutput, PipeRequest};
use tributary_contracts::valves::{ImageValves, WorkflowValves};

pub use image::ImagePipe;
pub use poller::{PollRegistry, PollTicket, ThinkingLog};
pub use status::StatusReporter;
pub use workflow::WorkflowPipe;

/// A host-invocable pipe. Events go through `emitter` while the request runs;
/// the return value is the final payload for the host.
pub trait Pipe: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn pipe(&self, request: PipeRequest, emitter: Arc<dyn EventEmitter>) -> PipeOutput;
}

#[derive(Default)]
pub struct PipeRegistry {
    pipes: IndexMap<String, Box<dyn Pipe>>,
}

impl PipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Pipe + 'static>(&mut self, pipe: P) {
        self.pipes.insert(pipe.id().to_string(), Box::new(pipe));
    }

    pub fn get(&self, id: &str) -> Option<&dyn Pipe> {
        self.pipes.get(id).map(|pipe| pipe.as_ref())
    }

    pub fn ids(&self) -> Vec<String> {
        self.pipes.keys().cloned().collect()
    }

    /// `(id, display name)` in registration order.
    pub fn names(&self) -> Vec<(String, String)> {
        self.pipes
            .values()
            .map(|pipe| (pipe.id().to_string(), pipe.name().to_string()))
            .collect()
    }
}

pub fn default_pipe_registry(
    workflow_valves: WorkflowValves,
    image_valves: ImageValves,
) -> Result<PipeRegistry> {
    let mut pipes = PipeRegistry::new();
    pipes.register(WorkflowPipe::new(workflow_valves)?);
    pipes.register(ImagePipe::new(image_valves)?);
    Ok(pipes)
}

/// Pulls the configured field out of a webhook reply. Workflows answer with
/// either an object or a one-element list of objects.
pub fn extract_response_field(payload: &Value, field: &str) -> Option<String> {
    let value = match payload {
        Value::Array(rows) => rows.first()?.get(field)?,
        Value::Object(obj) => obj.get(field)?,
        _ => return None,
    };
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Workflows frequently double-escape newlines in their text output.
pub fn normalize_escaped_newlines(value: &str) -> String {
    value.replace("\\n", "\n")
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}
