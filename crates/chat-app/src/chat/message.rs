use std::fmt;

use chrono::{DateTime, Utc};
use polychat_llm::{Model, RemoteMessage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use polychat_llm::Role;

/// Stable identifier for one message.
///
/// Remote ids are opaque strings, so locally created messages use the same
/// representation with a descriptive prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Creates a locally unique id such as `user_gpt-4o_<uuid>`.
    pub fn generate(prefix: &str, model_id: Option<&str>) -> Self {
        let unique = Uuid::now_v7();
        match model_id {
            Some(model_id) => Self(format!("{prefix}_{model_id}_{unique}")),
            None => Self(format!("{prefix}_{unique}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Identity of one in-flight request for one model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestTicket {
    pub model_id: String,
    pub sequence: u64,
}

impl RequestTicket {
    pub fn new(model_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            model_id: model_id.into(),
            sequence,
        }
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Final,
    /// Temporary assistant message standing in for an unanswered request.
    Thinking(RequestTicket),
    Failed,
}

/// Model that authored an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceModel {
    pub id: String,
    pub name: String,
}

impl From<&Model> for SourceModel {
    fn from(model: &Model) -> Self {
        Self {
            id: model.id.clone(),
            name: model.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub source: Option<SourceModel>,
    pub image_url: Option<String>,
    pub images: Vec<String>,
    pub status: MessageStatus,
}

impl Message {
    pub fn user(id: MessageId, content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            id,
            content: content.into(),
            role: Role::User,
            timestamp: Utc::now(),
            source: None,
            image_url: None,
            images,
            status: MessageStatus::Final,
        }
    }

    fn assistant(id: MessageId, content: impl Into<String>, model: &Model) -> Self {
        Self {
            id,
            content: content.into(),
            role: Role::Assistant,
            timestamp: Utc::now(),
            source: Some(SourceModel::from(model)),
            image_url: None,
            images: Vec::new(),
            status: MessageStatus::Final,
        }
    }

    pub fn thinking(ticket: RequestTicket, model: &Model) -> Self {
        let id = MessageId::generate("thinking", Some(&model.id));
        let mut message = Self::assistant(id, format!("{} is thinking...", model.name), model);
        message.status = MessageStatus::Thinking(ticket);
        message
    }

    pub fn failure(model: &Model, reason: impl fmt::Display) -> Self {
        let id = MessageId::generate("error", Some(&model.id));
        let mut message =
            Self::assistant(id, format!("Failed to get a response: {reason}"), model);
        message.status = MessageStatus::Failed;
        message
    }

    pub fn welcome(model: &Model, greeting: &str) -> Self {
        Self::assistant(
            MessageId::new(format!("default_msg_{}", model.id)),
            format!(
                "{greeting} I'm {}. How can I assist you today?",
                model.name
            ),
            model,
        )
    }

    /// Converts a reply from the backend, filling in anything it left out.
    pub fn reply(remote: RemoteMessage, model: &Model) -> Self {
        let id = remote
            .id
            .filter(|id| !id.trim().is_empty())
            .map(MessageId::new)
            .unwrap_or_else(|| MessageId::generate("response", Some(&model.id)));
        let content = if remote.content.trim().is_empty() {
            "No response content received".to_string()
        } else {
            remote.content
        };

        let mut message = Self::assistant(id, content, model);
        message.timestamp = parse_timestamp(remote.timestamp.as_deref());
        message
    }

    /// Converts one history entry; user turns carry no source model.
    pub fn from_history(remote: RemoteMessage, model: &Model) -> Self {
        let id = remote
            .id
            .filter(|id| !id.trim().is_empty())
            .map(MessageId::new)
            .unwrap_or_else(|| MessageId::generate("history", Some(&model.id)));
        let timestamp = parse_timestamp(remote.timestamp.as_deref());

        match remote.role {
            Role::User => {
                let mut message = Self::user(id, remote.content, remote.images);
                message.timestamp = timestamp;
                message
            }
            Role::Assistant => {
                let mut message = Self::assistant(id, remote.content, model);
                message.timestamp = timestamp;
                message
            }
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.status, MessageStatus::Thinking(_))
    }

    pub fn is_placeholder_for(&self, ticket: &RequestTicket) -> bool {
        matches!(&self.status, MessageStatus::Thinking(active) if active == ticket)
    }
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
