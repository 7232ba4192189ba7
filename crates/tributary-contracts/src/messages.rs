use std::borrow::Cow;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Message author. Roles outside the chat trio keep their original name so
/// the transcript goes back to the host unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Other(String),
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::Other(value),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::System => "system".to_string(),
            Role::User => "user".to_string(),
            Role::Assistant => "assistant".to_string(),
            Role::Tool => "tool".to_string(),
            Role::Other(value) => value,
        }
    }
}

/// Plain text, or the multimodal list form (`[{"type": "text", "text": ...}, ...]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Text of the message. For part lists, the `text` parts joined by newlines.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text.as_str()),
            Self::Parts(parts) => Cow::Owned(
                parts
                    .iter()
                    .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
        }
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl PartialEq<&str> for MessageContent {
    fn eq(&self, other: &&str) -> bool {
        self.text() == *other
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<MessageContent, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<MessageContent>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: MessageContent,
    /// Host fields such as `tool_calls` or `tool_call_id`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
            extra: Map::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
            extra: Map::new(),
        }
    }
}

/// Request body as the host sends it. Fields other than `messages` are kept
/// untouched so they survive a round trip back to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipeBody {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipeBody {
    pub fn last_content(&self) -> Option<Cow<'_, str>> {
        self.messages.last().map(|message| message.content.text())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipeRequest {
    pub body: PipeBody,
    pub metadata: RequestMetadata,
    pub user: Option<UserRecord>,
}

impl PipeRequest {
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            body: PipeBody {
                messages,
                extra: Map::new(),
            },
            ..Self::default()
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.metadata.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user = Some(UserRecord {
            id: user_id.into(),
            ..UserRecord::default()
        });
        self
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.metadata
            .chat_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn user_id(&self) -> &str {
        self.user
            .as_ref()
            .map(|user| user.id.as_str())
            .unwrap_or("")
    }
}

/// What a pipe hands back to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipeOutput {
    /// The request transcript with the pipe's messages appended.
    Transcript(Vec<ChatMessage>),
    /// Text chunks yielded to the host, in order.
    Chunks(Vec<String>),
    Error { error: String },
}

impl PipeOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn body_keeps_unknown_host_fields() -> anyhow::Result<()> {
        let raw = json!({
            "model": "n8n_pipe",
            "stream": true,
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
                {"role": "user", "content": "what is new?"}
            ]
        });
        let body: PipeBody = serde_json::from_value(raw.clone())?;
        assert_eq!(body.messages.len(), 3);
        assert_eq!(body.last_content().as_deref(), Some("what is new?"));
        assert_eq!(body.extra["model"], json!("n8n_pipe"));
        assert_eq!(serde_json::to_value(&body)?, raw);
        Ok(())
    }

    #[test]
    fn missing_messages_default_to_empty() -> anyhow::Result<()> {
        let body: PipeBody = serde_json::from_value(json!({"model": "x"}))?;
        assert!(body.messages.is_empty());
        assert_eq!(body.last_content().as_deref(), None);
        Ok(())
    }

    #[test]
    fn request_ignores_blank_chat_id_and_defaults_user_id() {
        let request = PipeRequest::from_messages(vec![ChatMessage::user("q")]).with_chat_id("  ");
        assert_eq!(request.chat_id(), None);
        assert_eq!(request.user_id(), "");

        let request = request.with_chat_id("chat-9").with_user_id("user-1");
        assert_eq!(request.chat_id(), Some("chat-9"));
        assert_eq!(request.user_id(), "user-1");
    }

    #[test]
    fn output_serializes_in_host_shapes() -> anyhow::Result<()> {
        let transcript = PipeOutput::Transcript(vec![ChatMessage::assistant("done")]);
        assert_eq!(
            serde_json::to_value(&transcript)?,
            json!([{"role": "assistant", "content": "done"}])
        );
        let error = PipeOutput::error("Error: 500 - boom");
        assert!(error.is_error());
        assert_eq!(
            serde_json::to_value(&error)?,
            json!({"error": "Error: 500 - boom"})
        );
        Ok(())
    }

    #[test]
    fn tool_roles_and_multimodal_content_survive() -> anyhow::Result<()> {
        let raw = json!({
            "messages": [
                {"role": "assistant", "content": null,
                 "tool_calls": [{"id": "call_1", "type": "function"}]},
                {"role": "tool", "tool_call_id": "call_1", "content": "42"},
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "16:9 a red fox"},
                    {"type": "image_url", "image_url": {"url": "https://img.local/a.png"}},
                    {"type": "text", "text": "in snow"}
                ]}
            ]
        });
        let body: PipeBody = serde_json::from_value(raw)?;
        assert_eq!(body.messages.len(), 4);
        assert_eq!(body.messages[0].content, "");
        assert!(body.messages[0].extra.contains_key("tool_calls"));
        assert_eq!(body.messages[1].role, Role::Tool);
        assert_eq!(body.messages[2].role, Role::Other("developer".to_string()));
        assert_eq!(
            body.last_content().as_deref(),
            Some("16:9 a red fox\nin snow")
        );

        let encoded = serde_json::to_value(&body)?;
        assert_eq!(encoded["messages"][1]["tool_call_id"], json!("call_1"));
        assert_eq!(encoded["messages"][2]["role"], json!("developer"));
        assert_eq!(
            encoded["messages"][3]["content"][1]["type"],
            json!("image_url")
        );
        Ok(())
    }
}
