//! Reconciliation of push events against the store and pending sends.

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, TaskId, UserId},
    protocol::{Message, MessageRow, SubscriptionStatus},
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    optimistic::{OptimisticTracker, TransitionError},
    store::{MessageStore, Upsert},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Unknown conversation, incomplete row or nothing to change.
    Ignored,
    /// Insert for a known task that is not the one on screen.
    Activity { task_id: TaskId, remote: bool },
    /// A confirmed message replaced one of our optimistic entries.
    Reconciled {
        temp_id: MessageId,
        message_id: MessageId,
    },
    Inserted { id: MessageId, remote: bool },
    Updated { id: MessageId },
    Removed { id: MessageId },
}

impl IngestOutcome {
    pub fn changed_conversation(&self) -> bool {
        matches!(
            self,
            Self::Reconciled { .. }
                | Self::Inserted { .. }
                | Self::Updated { .. }
                | Self::Removed { .. }
        )
    }
}

/// Mutable view of the conversation an event is applied to.
pub struct Conversation<'a> {
    /// `None` when no task is active.
    pub store: Option<&'a mut MessageStore>,
    pub tracker: &'a mut OptimisticTracker,
    pub me: &'a UserId,
}

#[derive(Debug, Default)]
pub struct RealtimeIngestion {
    known_tasks: HashSet<TaskId>,
    last_event_at: Option<Instant>,
    status: Option<SubscriptionStatus>,
}

impl RealtimeIngestion {
    pub fn new(known_tasks: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            known_tasks: known_tasks.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn set_known_tasks(&mut self, tasks: impl IntoIterator<Item = TaskId>) {
        self.known_tasks = tasks.into_iter().collect();
    }

    pub fn add_known_task(&mut self, task_id: TaskId) {
        self.known_tasks.insert(task_id);
    }

    pub fn is_known(&self, task_id: &TaskId) -> bool {
        self.known_tasks.contains(task_id)
    }

    pub fn last_event_at(&self) -> Option<Instant> {
        self.last_event_at
    }

    pub fn status(&self) -> Option<SubscriptionStatus> {
        self.status
    }

    /// Whether an event arrived within `stale_after` of `now`.
    pub fn is_live(&self, now: Instant, stale_after: Duration) -> bool {
        self.last_event_at
            .is_some_and(|at| now.saturating_duration_since(at) <= stale_after)
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_event_at = Some(now);
    }

    /// Records a subscription status change. Returns `true` when it differs
    /// from the previous one.
    pub fn on_status(&mut self, status: SubscriptionStatus, now: Instant) -> bool {
        if status.is_live() {
            self.touch(now);
        } else {
            warn!(?status, "realtime: subscription not live, relying on polling");
        }
        self.status.replace(status) != Some(status)
    }

    pub fn on_insert(
        &mut self,
        row: &MessageRow,
        conversation: Conversation<'_>,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> IngestOutcome {
        let Some(task_id) = row.task_id.as_ref() else {
            debug!(id = ?row.id, "realtime: insert without task id dropped");
            return IngestOutcome::Ignored;
        };
        if !self.is_known(task_id) {
            debug!(task_id = %task_id, "realtime: insert for unknown task ignored");
            return IngestOutcome::Ignored;
        }
        self.touch(now);

        let is_self = row.is_authored_by(conversation.me);
        let Some(store) = conversation
            .store
            .filter(|store| store.task_id() == task_id)
        else {
            return IngestOutcome::Activity {
                task_id: task_id.clone(),
                remote: !is_self,
            };
        };
        let Some(message) = Message::from_row(row, wall) else {
            return IngestOutcome::Ignored;
        };
        let id = message.id.clone();

        if store.contains(&id) {
            store.upsert(message);
            if is_self {
                if let Some(temp_id) = absorb_own_temp(store, conversation.tracker, &id) {
                    return IngestOutcome::Reconciled {
                        temp_id,
                        message_id: id,
                    };
                }
            }
            return IngestOutcome::Updated { id };
        }

        if is_self {
            if let Some(temp_id) = conversation.tracker.find_pending_match(&message) {
                if let Err(err) = conversation.tracker.resolve(&temp_id) {
                    warn!(temp_id = %temp_id, error = %err, "realtime: resolve failed");
                }
                store.replace_temp(&temp_id, message);
                debug!(temp_id = %temp_id, message_id = %id, "realtime: own send confirmed");
                return IngestOutcome::Reconciled {
                    temp_id,
                    message_id: id,
                };
            }
            if let Some(temp_id) = store.find_temp_match(&message) {
                store.replace_temp(&temp_id, message);
                return IngestOutcome::Reconciled {
                    temp_id,
                    message_id: id,
                };
            }
        }

        store.upsert(message);
        IngestOutcome::Inserted {
            id,
            remote: !is_self,
        }
    }

    /// Patches in place. An update for an id not yet seen is applied as an
    /// insert when the row is complete enough.
    pub fn on_update(
        &mut self,
        row: &MessageRow,
        conversation: Conversation<'_>,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> IngestOutcome {
        let Some(id) = row.id.clone() else {
            return IngestOutcome::Ignored;
        };
        if let Some(task_id) = row.task_id.as_ref() {
            if !self.is_known(task_id) {
                return IngestOutcome::Ignored;
            }
        }
        let Some(store) = conversation.store else {
            if row.task_id.is_some() {
                self.touch(now);
            }
            return IngestOutcome::Ignored;
        };
        if row.task_id.is_none() && !store.contains(&id) {
            return IngestOutcome::Ignored;
        }
        self.touch(now);

        let outcome = store.upsert_row(row, wall);
        if outcome == Upsert::Ignored {
            return IngestOutcome::Ignored;
        }
        let is_self = store
            .get(&id)
            .is_some_and(|message| message.is_authored_by(conversation.me));
        if is_self {
            if let Some(temp_id) = absorb_own_temp(store, conversation.tracker, &id) {
                return IngestOutcome::Reconciled {
                    temp_id,
                    message_id: id,
                };
            }
        }
        match outcome {
            Upsert::Inserted => IngestOutcome::Inserted {
                remote: !is_self,
                id,
            },
            _ => IngestOutcome::Updated { id },
        }
    }

    pub fn on_delete(
        &mut self,
        id: &MessageId,
        task_id: Option<&TaskId>,
        store: Option<&mut MessageStore>,
        now: Instant,
    ) -> IngestOutcome {
        if let Some(task_id) = task_id {
            if !self.is_known(task_id) {
                return IngestOutcome::Ignored;
            }
            self.touch(now);
        }
        let Some(store) = store else {
            return IngestOutcome::Ignored;
        };
        if task_id.is_some_and(|task_id| task_id != store.task_id()) {
            return IngestOutcome::Ignored;
        }
        match store.remove(id) {
            Some(_) => {
                self.touch(now);
                IngestOutcome::Removed { id: id.clone() }
            }
            None => IngestOutcome::Ignored,
        }
    }
}

/// Folds an optimistic entry into an own message that is already stored but
/// has not been paired with a send yet.
fn absorb_own_temp(
    store: &mut MessageStore,
    tracker: &mut OptimisticTracker,
    confirmed_id: &MessageId,
) -> Option<MessageId> {
    let temp_id = store.find_unpaired_temp_match(confirmed_id)?;
    match tracker.resolve(&temp_id) {
        Ok(_) | Err(TransitionError::Unknown(_)) => {}
        Err(err) => warn!(temp_id = %temp_id, error = %err, "realtime: resolve failed"),
    }
    store.absorb_temp(&temp_id, confirmed_id);
    debug!(temp_id = %temp_id, message_id = %confirmed_id, "realtime: own send confirmed");
    Some(temp_id)
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
