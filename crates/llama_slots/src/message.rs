//! Conversation messages, as consumed by a [`PromptFormatter`](crate::PromptFormatter).

use std::fmt;
use std::time::SystemTime;

/// Who authored a [`ConversationMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The human on the other side of the conversation.
    User,
    /// Instructions for the model.
    System,
    /// The model itself.
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::User => "user",
            Role::System => "system",
            Role::Assistant => "assistant",
        })
    }
}

/// What a message is about; formatters may use this to route or drop messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    /// Ordinary conversation.
    Chat,
    /// A summary of earlier conversation.
    Summary,
    /// Facts about the user.
    UserInfo,
    /// Anything else.
    Other(String),
}

/// A single immutable message of a conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationMessage {
    role: Role,
    category: MessageCategory,
    content: String,
    timestamp: SystemTime,
}

impl ConversationMessage {
    /// Creates a message stamped with the current time.
    pub fn new(role: Role, category: MessageCategory, content: impl Into<String>) -> Self {
        Self {
            role,
            category,
            content: content.into(),
            timestamp: SystemTime::now(),
        }
    }

    /// Creates a chat message authored by the user.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, MessageCategory::Chat, content)
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, MessageCategory::Chat, content)
    }

    /// Creates a chat message authored by the model.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageCategory::Chat, content)
    }

    /// Returns a copy with a different timestamp.
    pub fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Who wrote the message.
    pub fn role(&self) -> Role {
        self.role
    }

    /// What the message is about.
    pub fn category(&self) -> &MessageCategory {
        &self.category
    }

    /// The message text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// When the message was created.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}
