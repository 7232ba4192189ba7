use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tributary_contracts::events::{EventEmitter, StatusLevel};
use tributary_contracts::messages::{ChatMessage, PipeOutput, PipeRequest};
use tributary_contracts::valves::WorkflowValves;

use crate::poller::{PollRegistry, StatusPollWorker, ThinkingLog};
use crate::status::StatusReporter;
use crate::transport::{HttpWebhookTransport, WebhookTransport};
use crate::{
    error_chain_text, extract_response_field, normalize_escaped_newlines, truncate_text, Pipe,
};

pub const NULL_RESPONSE_NOTICE: &str = "N8N returned a NULL response";
pub const NO_MESSAGES_NOTICE: &str = "No messages found in the request body";
pub const STATUS_CHECK_INPUT: &str = "status check";

/// Hands a chat turn to an n8n webhook and streams the workflow's progress
/// back while it runs.
pub struct WorkflowPipe {
    valves: WorkflowValves,
    transport: Arc<dyn WebhookTransport>,
    polls: PollRegistry,
}

impl WorkflowPipe {
    pub fn new(valves: WorkflowValves) -> Result<Self> {
        Ok(Self::with_transport(
            valves,
            Arc::new(HttpWebhookTransport::new()?),
        ))
    }

    pub fn with_transport(valves: WorkflowValves, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            valves,
            transport,
            polls: PollRegistry::new(),
        }
    }

    pub fn is_polling(&self, session_id: &str) -> bool {
        self.polls.is_polling(session_id)
    }

    pub fn active_polls(&self) -> usize {
        self.polls.active_count()
    }

    fn webhook_payload(&self, session_id: &str, user_id: &str, input: &str) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
        payload.insert("user_id".to_string(), Value::String(user_id.to_string()));
        payload.insert(
            self.valves.input_field.clone(),
            Value::String(input.to_string()),
        );
        Value::Object(payload)
    }

    fn call_workflow(&self, session_id: &str, user_id: &str, question: &str) -> Result<String> {
        let payload = self.webhook_payload(session_id, user_id, question);
        let reply = self.transport.post_json(
            &self.valves.n8n_url,
            &self.valves.n8n_bearer_token,
            &payload,
            self.valves.request_timeout(),
        )?;
        if reply.status != 200 {
            bail!(
                "Error: {} - {}",
                reply.status,
                truncate_text(&reply.body, 512)
            );
        }
        let parsed: Value =
            serde_json::from_str(&reply.body).context("N8N returned invalid JSON payload")?;
        let answer = extract_response_field(&parsed, &self.valves.response_field)
            .map(|text| normalize_escaped_newlines(&text));
        if answer.is_none() {
            warn!(
                session_id,
                field = %self.valves.response_field,
                "workflow response field missing or null"
            );
        }
        Ok(answer.unwrap_or_else(|| NULL_RESPONSE_NOTICE.to_string()))
    }

    fn status_worker(
        &self,
        session_id: &str,
        user_id: &str,
        reporter: Arc<StatusReporter>,
        thinking: ThinkingLog,
    ) -> StatusPollWorker {
        StatusPollWorker {
            transport: Arc::clone(&self.transport),
            url: self.valves.n8n_status_url.clone(),
            bearer_token: self.valves.n8n_bearer_token.clone(),
            payload: self.webhook_payload(session_id, user_id, STATUS_CHECK_INPUT),
            response_field: self.valves.response_field.clone(),
            interval: self.valves.poll_interval(),
            timeout: self.valves.status_timeout(),
            reporter,
            thinking,
            session_id: session_id.to_string(),
        }
    }
}

impl Pipe for WorkflowPipe {
    fn id(&self) -> &str {
        "n8n_pipe"
    }

    fn name(&self) -> &str {
        "N8N Pipe"
    }

    fn pipe(&self, request: PipeRequest, emitter: Arc<dyn EventEmitter>) -> PipeOutput {
        let reporter = Arc::new(StatusReporter::new(
            emitter,
            self.valves.enable_status_indicator,
            self.valves.emit_interval(),
        ));
        reporter.emit_status(StatusLevel::Info, "Calling N8N Workflow...", false);

        let session_id = request
            .chat_id()
            .map(str::to_string)
            .unwrap_or_else(|| {
                let generated = uuid::Uuid::new_v4().to_string();
                debug!(session_id = %generated, "no chat_id supplied; generated session id");
                generated
            });
        let user_id = request.user_id().to_string();
        let mut messages = request.body.messages;

        let Some(question) = messages
            .last()
            .map(|message| message.content.text().into_owned())
        else {
            reporter.emit_status(StatusLevel::Error, NO_MESSAGES_NOTICE, true);
            messages.push(ChatMessage::assistant(NO_MESSAGES_NOTICE));
            return PipeOutput::Transcript(messages);
        };

        let thinking = ThinkingLog::default();
        let worker = self.status_worker(
            &session_id,
            &user_id,
            Arc::clone(&reporter),
            thinking.clone(),
        );
        let ticket = match self.polls.start(&session_id, worker) {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "running without status polling");
                None
            }
        };

        info!(session_id = %session_id, url = %self.valves.n8n_url, "calling workflow");
        let answer = self.call_workflow(&session_id, &user_id, &question);
        if let Some(ticket) = ticket {
            self.polls.cancel(&session_id, ticket);
        }

        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                let text = error_chain_text(&err, 1024);
                warn!(session_id = %session_id, error = %text, "workflow call failed");
                reporter.emit_status(
                    StatusLevel::Error,
                    &format!("Error during sequence execution: {text}"),
                    true,
                );
                return PipeOutput::error(text);
            }
        };

        for fragment in thinking.take() {
            messages.push(ChatMessage::assistant(fragment));
        }
        messages.push(ChatMessage::assistant(answer.clone()));
        reporter.emit_message(&answer);
        reporter.emit_status(StatusLevel::Info, "Complete", true);
        debug!(session_id = %session_id, messages = messages.len(), "workflow turn finished");
        PipeOutput::Transcript(messages)
    }
}
