//! In-flight sends and their per-send state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::{
    domain::{CurrentUser, MessageId, MessageKind, Principal, TaskId},
    protocol::{Message, NewComment},
};
use thiserror::Error;
use uuid::Uuid;

use crate::matching::{best_candidate, SendKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    Pending { sending: bool },
    Confirmed,
    Failed { reason: String },
}

impl SendState {
    fn name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEvent {
    MarkSending,
    Confirm,
    Fail(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("no optimistic send tracked under {0}")]
    Unknown(MessageId),
    #[error("illegal transition from {from} on {event}")]
    Illegal {
        from: &'static str,
        event: &'static str,
    },
}

/// Pure transition function of the per-send state machine.
pub fn transition(state: &SendState, event: SendEvent) -> Result<SendState, TransitionError> {
    match (state, event) {
        (SendState::Pending { .. }, SendEvent::MarkSending) => {
            Ok(SendState::Pending { sending: true })
        }
        (SendState::Pending { .. }, SendEvent::Confirm) => Ok(SendState::Confirmed),
        (SendState::Pending { .. }, SendEvent::Fail(reason)) => Ok(SendState::Failed { reason }),
        (terminal, event) => Err(TransitionError::Illegal {
            from: terminal.name(),
            event: match event {
                SendEvent::MarkSending => "mark_sending",
                SendEvent::Confirm => "confirm",
                SendEvent::Fail(_) => "fail",
            },
        }),
    }
}

/// What the user asked to send, before it has an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingDraft {
    pub task_id: TaskId,
    pub kind: MessageKind,
    pub body: String,
    pub attachment_url: Option<String>,
    pub parent_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticSend {
    pub temp_id: MessageId,
    pub task_id: TaskId,
    pub kind: MessageKind,
    pub body: String,
    pub attachment_url: Option<String>,
    pub parent_id: Option<MessageId>,
    pub author: Principal,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub state: SendState,
}

impl OptimisticSend {
    pub fn key(&self) -> SendKey<'_> {
        SendKey {
            task_id: &self.task_id,
            kind: self.kind,
            body: &self.body,
            created_at: self.created_at,
            author: Some(&self.author),
        }
    }

    /// Placeholder shown in the conversation until the send is confirmed.
    pub fn to_message(&self) -> Message {
        Message {
            id: self.temp_id.clone(),
            task_id: self.task_id.clone(),
            author: Some(self.author.clone()),
            author_name: Some(self.author_name.clone()),
            body: self.body.clone(),
            kind: self.kind,
            attachment_url: self.attachment_url.clone(),
            parent_id: self.parent_id.clone(),
            pinned: false,
            created_at: self.created_at,
            updated_at: None,
        }
    }

    pub fn request(&self) -> NewComment {
        NewComment {
            body: self.body.clone(),
            kind: self.kind,
            attachment_url: self.attachment_url.clone(),
            parent_id: self.parent_id.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, SendState::Pending { .. })
    }
}

#[derive(Debug, Clone)]
pub struct OptimisticTracker {
    records: Vec<OptimisticSend>,
    match_window: Duration,
}

impl OptimisticTracker {
    pub fn new(match_window: Duration) -> Self {
        Self {
            records: Vec::new(),
            match_window,
        }
    }

    /// Registers a new send and returns its temporary id.
    pub fn begin(
        &mut self,
        draft: OutgoingDraft,
        author: &CurrentUser,
        now: DateTime<Utc>,
    ) -> MessageId {
        let temp_id = MessageId::temporary(Uuid::new_v4().simple());
        self.records.push(OptimisticSend {
            temp_id: temp_id.clone(),
            task_id: draft.task_id,
            kind: draft.kind,
            body: draft.body,
            attachment_url: draft.attachment_url,
            parent_id: draft.parent_id,
            author: Principal::User(author.id.clone()),
            author_name: author.display_name.clone(),
            created_at: now,
            state: SendState::Pending { sending: false },
        });
        temp_id
    }

    pub fn get(&self, temp_id: &MessageId) -> Option<&OptimisticSend> {
        self.records.iter().find(|record| record.temp_id == *temp_id)
    }

    pub fn is_pending(&self, temp_id: &MessageId) -> bool {
        self.get(temp_id).is_some_and(OptimisticSend::is_pending)
    }

    pub fn pending_count(&self) -> usize {
        self.records.len()
    }

    pub fn mark_sending(&mut self, temp_id: &MessageId) -> Result<(), TransitionError> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.temp_id == *temp_id)
            .ok_or_else(|| TransitionError::Unknown(temp_id.clone()))?;
        record.state = transition(&record.state, SendEvent::MarkSending)?;
        Ok(())
    }

    /// Confirms the send and drops it from the pending set.
    pub fn resolve(&mut self, temp_id: &MessageId) -> Result<OptimisticSend, TransitionError> {
        self.finish(temp_id, SendEvent::Confirm)
    }

    /// Marks the send failed and drops it from the pending set. Rolling back
    /// the store entry is the caller's job.
    pub fn fail(
        &mut self,
        temp_id: &MessageId,
        reason: impl Into<String>,
    ) -> Result<OptimisticSend, TransitionError> {
        self.finish(temp_id, SendEvent::Fail(reason.into()))
    }

    /// Pending send represented by a confirmed message, exact content first.
    pub fn find_pending_match(&self, confirmed: &Message) -> Option<MessageId> {
        best_candidate(
            &SendKey::of(confirmed),
            self.records
                .iter()
                .filter(|record| record.is_pending())
                .map(|record| (record.temp_id.clone(), record.key())),
            self.match_window,
        )
    }

    /// Forgets every send of a task. Returns the dropped temp ids.
    pub fn clear_task(&mut self, task_id: &TaskId) -> Vec<MessageId> {
        let mut dropped = Vec::new();
        self.records.retain(|record| {
            if record.task_id == *task_id {
                dropped.push(record.temp_id.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    fn finish(
        &mut self,
        temp_id: &MessageId,
        event: SendEvent,
    ) -> Result<OptimisticSend, TransitionError> {
        let idx = self
            .records
            .iter()
            .position(|record| record.temp_id == *temp_id)
            .ok_or_else(|| TransitionError::Unknown(temp_id.clone()))?;
        let next = transition(&self.records[idx].state, event)?;
        let mut record = self.records.remove(idx);
        record.state = next;
        Ok(record)
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
