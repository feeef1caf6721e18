//! Chat data models shared by the relay server and the client.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Greeting every conversation starts with.
pub const WELCOME_MESSAGE: &str =
    "Namaste! Main aapka AI guide hoon — atom se universe tak sabka gyaan. Kuch bhi poochiye ✨";

/// Reply returned instead of calling upstream when no credential is configured.
pub const MOCK_REPLY: &str =
    "🤖 Mock Reply: Configure your OPENAI_API_KEY to enable real AI responses.";

/// Placeholder used when a JSON reply carries no text.
pub const NO_REPLY: &str = "No reply";

/// Assistant message appended when an exchange fails at the network level.
pub const NETWORK_ERROR_REPLY: &str = "Network error. Please try again.";

/// Number of trailing messages submitted upstream.
pub const DEFAULT_CONTEXT_WINDOW: usize = 10;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Models offered by the settings panel. Other identifiers are accepted too.
pub const KNOWN_MODELS: &[&str] = &["gpt-4o-mini", "gpt-4o", "o3-mini"];

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// The fixed message a fresh conversation is seeded with.
    pub fn welcome() -> Self {
        Self::assistant(WELCOME_MESSAGE)
    }
}

/// Ordered list of messages in insertion order.
///
/// Only ever appended to, except for the trailing assistant entry which is
/// rewritten in place while a streamed reply is arriving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::welcome()
    }
}

impl Conversation {
    /// A conversation holding only the welcome message.
    pub fn welcome() -> Self {
        Self {
            messages: vec![Message::welcome()],
        }
    }

    /// Wrap a stored message list as-is.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the content of the last message, returning false when empty.
    pub fn set_last_content(&mut self, content: impl Into<String>) -> bool {
        match self.messages.last_mut() {
            Some(last) => {
                last.content = content.into();
                true
            }
            None => false,
        }
    }

    /// The most recent `max` messages, in their original order.
    pub fn recent(&self, max: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(max);
        &self.messages[start..]
    }

    /// Latest assistant message, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }

    /// Pretty-printed JSON export of the whole conversation.
    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.messages)
    }
}

/// User-selected generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub model: String,
    pub temperature: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl Settings {
    /// Clamp the temperature into `[0, 1]`; NaN falls back to the default.
    pub fn normalized(mut self) -> Self {
        self.temperature = clamp_temperature(self.temperature);
        if self.model.trim().is_empty() {
            self.model = DEFAULT_MODEL.to_string();
        }
        self
    }
}

pub fn clamp_temperature(value: f32) -> f32 {
    if value.is_nan() {
        DEFAULT_TEMPERATURE
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Body of `POST /relay/chat`.
///
/// `model` and `temperature` of the wrong JSON type read as absent, so the
/// relay falls back to its defaults instead of rejecting the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub model: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature: Option<f32>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// JSON body returned by the relay when it does not stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub reply: Option<String>,
}

/// Body of `POST /history/append`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryAppend {
    pub messages: Vec<Message>,
}
