//! Typing presence: throttled local broadcasts and TTL-evicted remote
//! typists.

use std::{collections::HashMap, time::Duration};

use shared::{
    domain::{TaskId, UserId},
    protocol::TypingBroadcast,
};
use tokio::time::Instant;

use crate::config::SyncSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typist {
    pub user_id: UserId,
    pub display_name: String,
    pub task_id: TaskId,
    pub last_seen: Instant,
}

/// Broadcast the local user should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        matches!(self, Self::Start)
    }
}

#[derive(Debug)]
pub struct TypingPresence {
    ttl: Duration,
    throttle: Duration,
    idle_stop: Duration,
    remote: HashMap<UserId, Typist>,
    last_broadcast: Option<Instant>,
    last_keystroke: Option<Instant>,
    announced: bool,
}

impl TypingPresence {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            ttl: settings.typing_ttl,
            throttle: settings.typing_throttle,
            idle_stop: settings.typing_idle_stop,
            remote: HashMap::new(),
            last_broadcast: None,
            last_keystroke: None,
            announced: false,
        }
    }

    /// Applies a broadcast from another user. Returns `true` when the set of
    /// typists changed.
    pub fn on_remote(&mut self, broadcast: &TypingBroadcast, now: Instant, me: &UserId) -> bool {
        if broadcast.user_id == *me {
            return false;
        }
        if !broadcast.is_typing {
            return self.remote.remove(&broadcast.user_id).is_some();
        }
        let previous = self.remote.insert(
            broadcast.user_id.clone(),
            Typist {
                user_id: broadcast.user_id.clone(),
                display_name: broadcast.display_name.clone(),
                task_id: broadcast.task_id.clone(),
                last_seen: now,
            },
        );
        previous.map_or(true, |previous| previous.task_id != broadcast.task_id)
    }

    /// Evicts records not refreshed within the TTL and returns their users.
    pub fn sweep(&mut self, now: Instant) -> Vec<UserId> {
        let ttl = self.ttl;
        let mut evicted = Vec::new();
        self.remote.retain(|user_id, typist| {
            let fresh = now.saturating_duration_since(typist.last_seen) <= ttl;
            if !fresh {
                evicted.push(user_id.clone());
            }
            fresh
        });
        evicted
    }

    /// Remote typists in a task, by display name.
    pub fn typists(&self, task_id: &TaskId) -> Vec<Typist> {
        let mut typists: Vec<Typist> = self
            .remote
            .values()
            .filter(|typist| typist.task_id == *task_id)
            .cloned()
            .collect();
        typists.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        typists
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }

    /// Local input changed. Keystrokes announce at most once per throttle
    /// period; clearing the input stops at once.
    pub fn on_input(&mut self, now: Instant, input_empty: bool) -> Option<TypingSignal> {
        if input_empty {
            return self.stop_local();
        }
        self.last_keystroke = Some(now);
        let due = self
            .last_broadcast
            .map_or(true, |at| now.saturating_duration_since(at) >= self.throttle);
        if !due {
            return None;
        }
        self.last_broadcast = Some(now);
        self.announced = true;
        Some(TypingSignal::Start)
    }

    /// Stop broadcast owed once the user has been idle long enough.
    pub fn poll_idle(&mut self, now: Instant) -> Option<TypingSignal> {
        let idle = self
            .last_keystroke
            .is_some_and(|at| now.saturating_duration_since(at) >= self.idle_stop);
        if idle {
            self.stop_local()
        } else {
            None
        }
    }

    /// Time of the last keystroke while announced, for scheduling the idle
    /// check.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.announced
            .then_some(self.last_keystroke)
            .flatten()
            .map(|at| at + self.idle_stop)
    }

    pub fn stop_local(&mut self) -> Option<TypingSignal> {
        self.last_keystroke = None;
        self.last_broadcast = None;
        std::mem::take(&mut self.announced).then_some(TypingSignal::Stop)
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
