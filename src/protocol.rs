use serde::{Deserialize, Serialize};

pub type UserId = i64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
}

impl Role {
    /// Unknown or blank roles fall back to `user`.
    pub fn coerce(raw: &str) -> Self {
        match raw.trim() {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::coerce(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkMode {
    #[default]
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Thinking {
    #[serde(rename = "type")]
    pub mode: ThinkMode,
}

/// Body of `POST /chat/stream/flux`.
///
/// `user_id` stays untyped so that a malformed identifier becomes an in-band
/// error frame instead of an extractor rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub thinking: Option<Thinking>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Query string of `GET /chat/stream/flux`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub role: Option<String>,
    pub content: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// A request as handed to the relay. Identity is still optional here; the
/// relay refuses to dispatch without one.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub messages: Vec<Message>,
    pub think: ThinkMode,
}

/// One callback invocation's worth of upstream output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub delta: String,
    pub reasoning: Option<String>,
    pub finished: bool,
}

impl StreamChunk {
    #[cfg(test)]
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            ..Self::default()
        }
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }

    #[cfg(test)]
    pub fn with_reasoning(mut self, text: impl Into<String>) -> Self {
        self.reasoning = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Message,
    Thinking,
    Error,
    Done,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Message => "message",
            Channel::Thinking => "thinking",
            Channel::Error => "error",
            Channel::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "message" => Some(Channel::Message),
            "thinking" => Some(Channel::Thinking),
            "error" => Some(Channel::Error),
            "done" => Some(Channel::Done),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Channel::Error | Channel::Done)
    }
}

pub const DONE_PAYLOAD: &str = "[DONE]";

/// A unit on the downstream wire. The payload is kept unescaped; escaping
/// happens once, in the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEvent {
    pub channel: Channel,
    pub payload: String,
}

impl WireEvent {
    pub fn message(payload: impl Into<String>) -> Self {
        Self {
            channel: Channel::Message,
            payload: payload.into(),
        }
    }

    pub fn thinking(payload: impl Into<String>) -> Self {
        Self {
            channel: Channel::Thinking,
            payload: payload.into(),
        }
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self {
            channel: Channel::Error,
            payload: payload.into(),
        }
    }

    pub fn done() -> Self {
        Self {
            channel: Channel::Done,
            payload: DONE_PAYLOAD.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_connections: usize,
    pub released_connections: u64,
}
