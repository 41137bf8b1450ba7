use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const TITLE_MAX_CHARS: usize = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("Invalid message role: '{}'", s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub framework: String,
    #[serde(default)]
    pub business_profile_id: Option<String>,
    #[serde(default, alias = "is_archived")]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatWithMessages {
    #[serde(flatten)]
    pub chat: Chat,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Partial update for a chat. `business_profile_id: Some(None)` clears the link.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
    pub business_profile_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl ChatUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() &&
            self.framework.is_none() &&
            self.business_profile_id.is_none() &&
            self.archived.is_none()
    }
}

mod double_option {
    use serde::{ Deserialize, Deserializer, Serialize, Serializer };

    pub fn serialize<S>(value: &Option<Option<String>>, serializer: S) -> Result<S::Ok, S::Error>
        where S: Serializer
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
        where D: Deserializer<'de>
    {
        Ok(Some(Option::deserialize(deserializer)?))
    }
}

/// A prior turn sent to the generator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Pending {
        temp_id: String,
    },
    Persisted {
        id: String,
    },
}

/// A message as the client sees it, before or after the store confirmed it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    #[serde(flatten)]
    pub state: MessageState,
    pub chat_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl DisplayMessage {
    pub fn pending(chat_id: Option<String>, role: MessageRole, content: &str) -> Self {
        Self {
            state: MessageState::Pending {
                temp_id: format!("temp-{}-{}", role, Uuid::new_v4()),
            },
            chat_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn persisted(message: Message) -> Self {
        Self {
            state: MessageState::Persisted { id: message.id },
            chat_id: Some(message.chat_id),
            role: message.role,
            content: message.content,
            created_at: message.created_at,
        }
    }

    pub fn temp_id(&self) -> Option<&str> {
        match &self.state {
            MessageState::Pending { temp_id } => Some(temp_id),
            MessageState::Persisted { .. } => None,
        }
    }

    pub fn id(&self) -> &str {
        match &self.state {
            MessageState::Pending { temp_id } => temp_id,
            MessageState::Persisted { id } => id,
        }
    }

    /// Swaps a pending message for its stored counterpart when `temp_id` matches.
    pub fn reconcile(&mut self, temp_id: &str, saved: &Message) -> bool {
        if self.temp_id() != Some(temp_id) {
            return false;
        }
        *self = DisplayMessage::persisted(saved.clone());
        true
    }

    pub fn to_prompt_message(&self) -> PromptMessage {
        PromptMessage::new(self.role.as_str(), self.content.clone())
    }
}

/// Chat title derived from the first user message.
pub fn chat_title_from(content: &str) -> String {
    if content.chars().count() > TITLE_MAX_CHARS {
        let head: String = content.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}
