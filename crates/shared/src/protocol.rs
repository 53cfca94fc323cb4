use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{MessageId, MessageKind, Principal, TaskId, UserId};

/// Canonical conversation message. Every backend or realtime payload is
/// funnelled through [`crate::normalize`] before it becomes one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Principal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }

    pub fn is_authored_by(&self, user_id: &UserId) -> bool {
        self.author.as_ref().is_some_and(|author| author.is(user_id))
    }

    /// Shallow merge of a newer copy of the same message. Optional fields the
    /// newer copy does not carry keep their previous value.
    pub fn merge_from(&mut self, newer: Message) {
        self.id = newer.id;
        self.task_id = newer.task_id;
        if newer.author.is_some() {
            self.author = newer.author;
        }
        if newer.author_name.is_some() {
            self.author_name = newer.author_name;
        }
        if !newer.body.is_empty() || self.body.is_empty() {
            self.body = newer.body;
        }
        self.kind = newer.kind;
        if newer.attachment_url.is_some() {
            self.attachment_url = newer.attachment_url;
        }
        if newer.parent_id.is_some() {
            self.parent_id = newer.parent_id;
        }
        self.pinned = newer.pinned;
        self.created_at = newer.created_at;
        if newer.updated_at.is_some() {
            self.updated_at = newer.updated_at;
        }
    }

    /// Applies the fields present on a partial row.
    pub fn apply_row(&mut self, row: &MessageRow) {
        if let Some(task_id) = &row.task_id {
            self.task_id = task_id.clone();
        }
        if let Some(author) = &row.author {
            self.author = Some(author.clone());
        }
        if let Some(author_name) = &row.author_name {
            self.author_name = Some(author_name.clone());
        }
        if let Some(body) = &row.body {
            self.body = body.clone();
        }
        if let Some(kind) = row.kind {
            self.kind = kind;
        }
        if let Some(url) = &row.attachment_url {
            self.attachment_url = Some(url.clone());
        }
        if let Some(parent_id) = &row.parent_id {
            self.parent_id = Some(parent_id.clone());
        }
        if let Some(pinned) = row.pinned {
            self.pinned = pinned;
        }
        if let Some(created_at) = row.created_at {
            self.created_at = created_at;
        }
        if let Some(updated_at) = row.updated_at {
            self.updated_at = Some(updated_at);
        }
    }

    /// Builds a full message from a row. Rows without an id or a task id
    /// cannot be placed in a conversation and yield `None`; a missing
    /// timestamp falls back to `now`.
    pub fn from_row(row: &MessageRow, now: DateTime<Utc>) -> Option<Self> {
        let id = row.id.clone()?;
        let task_id = row.task_id.clone()?;
        let kind = row.kind.unwrap_or(if row.attachment_url.is_some() {
            MessageKind::File
        } else {
            MessageKind::Text
        });
        Some(Self {
            id,
            task_id,
            author: row.author.clone(),
            author_name: row.author_name.clone(),
            body: row.body.clone().unwrap_or_default(),
            kind,
            attachment_url: row.attachment_url.clone(),
            parent_id: row.parent_id.clone(),
            pinned: row.pinned.unwrap_or(false),
            created_at: row.created_at.unwrap_or(now),
            updated_at: row.updated_at,
        })
    }
}

/// Partial comment row as delivered by realtime events. Only `id` is
/// required for updates and deletes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageRow {
    pub id: Option<MessageId>,
    pub task_id: Option<TaskId>,
    pub author: Option<Principal>,
    pub author_name: Option<String>,
    pub body: Option<String>,
    pub kind: Option<MessageKind>,
    pub attachment_url: Option<String>,
    pub parent_id: Option<MessageId>,
    pub pinned: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    pub fn is_authored_by(&self, user_id: &UserId) -> bool {
        self.author.as_ref().is_some_and(|author| author.is(user_id))
    }
}

impl From<&Message> for MessageRow {
    fn from(message: &Message) -> Self {
        Self {
            id: Some(message.id.clone()),
            task_id: Some(message.task_id.clone()),
            author: message.author.clone(),
            author_name: message.author_name.clone(),
            body: Some(message.body.clone()),
            kind: Some(message.kind),
            attachment_url: message.attachment_url.clone(),
            parent_id: message.parent_id.clone(),
            pinned: Some(message.pinned),
            created_at: Some(message.created_at),
            updated_at: message.updated_at,
        }
    }
}

/// Body of a create-comment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComment {
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

impl CommentPatch {
    pub fn body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            pinned: None,
        }
    }

    pub fn pinned(pinned: bool) -> Self {
        Self {
            body: None,
            pinned: Some(pinned),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingBroadcast {
    pub user_id: UserId,
    pub display_name: String,
    pub task_id: TaskId,
    pub is_typing: bool,
}

impl TypingBroadcast {
    /// Wire frame sent on the ephemeral broadcast channel.
    pub fn to_frame(&self) -> Value {
        json!({
            "op": "typing",
            "userId": self.user_id,
            "displayName": self.display_name,
            "taskId": self.task_id,
            "isTyping": self.is_typing,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Error,
    Timeout,
    Closed,
}

impl SubscriptionStatus {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Insert(MessageRow),
    Update(MessageRow),
    Delete {
        id: MessageId,
        task_id: Option<TaskId>,
    },
    Typing(TypingBroadcast),
    Status(SubscriptionStatus),
}
