use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Retention class of a logged message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Part of the user-visible conversation, retained and shown to the model.
    Conversation,
    /// Scratch notes for the current turn only (clarification hints, progress).
    Ephemeral,
    /// Raw tool traffic kept for auditing within a turn.
    ToolInternal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            kind: MessageKind::Conversation,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_retained(&self) -> bool {
        self.kind == MessageKind::Conversation
    }
}

/// Append-only message history.
///
/// Entries are never edited or removed in place. Readers go through
/// [`MessageLog::projection`], which hides ephemeral and tool-internal entries
/// and everything already folded into the rolling summary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. A message whose id is already logged is ignored and
    /// `false` is returned.
    pub fn append(&mut self, message: Message) -> bool {
        if self.entries.iter().any(|existing| existing.id == message.id) {
            return false;
        }
        self.entries.push(message);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn slice(&self, start: usize, end: usize) -> &[Message] {
        let end = end.min(self.entries.len());
        let start = start.min(end);
        &self.entries[start..end]
    }

    /// Model-facing history starting at `cursor`.
    pub fn projection(&self, cursor: usize) -> impl Iterator<Item = &Message> {
        self.entries.iter().skip(cursor).filter(|message| message.is_retained())
    }

    pub fn latest_user(&self) -> Option<&Message> {
        self.entries.iter().rev().find(|message| message.role == Role::User && message.is_retained())
    }

    /// Copy of the log with non-retained entries dropped, plus the cursor
    /// remapped onto the filtered positions.
    pub fn retained(&self, cursor: usize) -> (Self, usize) {
        let mut remapped_cursor = 0;
        let mut entries = Vec::with_capacity(self.entries.len());
        for (index, message) in self.entries.iter().enumerate() {
            if !message.is_retained() {
                continue;
            }
            if index < cursor {
                remapped_cursor += 1;
            }
            entries.push(message.clone());
        }
        (Self { entries }, remapped_cursor)
    }
}
