//! Heuristic identity between an optimistic send and a confirmed message.
//!
//! There is no client-generated idempotency key on the wire, so a confirmed
//! message is attributed to a local send by content, falling back to
//! timestamp proximity for attachments whose generated body may differ from
//! the placeholder. Rapid identical sends inside the window can be
//! misattributed; the caller only ever pairs each confirmed message with one
//! send, so nothing is lost or duplicated either way.

use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageKind, Principal, TaskId},
    protocol::Message,
};

/// Fields of a logical send that take part in matching.
#[derive(Debug, Clone, Copy)]
pub struct SendKey<'a> {
    pub task_id: &'a TaskId,
    pub kind: MessageKind,
    pub body: &'a str,
    pub created_at: DateTime<Utc>,
    pub author: Option<&'a Principal>,
}

impl<'a> SendKey<'a> {
    pub fn of(message: &'a Message) -> Self {
        Self {
            task_id: &message.task_id,
            kind: message.kind,
            body: &message.body,
            created_at: message.created_at,
            author: message.author.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRule {
    ExactContent,
    TimeProximity,
}

pub fn match_rule(
    pending: &SendKey<'_>,
    confirmed: &SendKey<'_>,
    window: Duration,
) -> Option<MatchRule> {
    if pending.task_id != confirmed.task_id || pending.kind != confirmed.kind {
        return None;
    }
    if let (Some(a), Some(b)) = (pending.author, confirmed.author) {
        if a.id() != b.id() {
            return None;
        }
    }
    if pending.body == confirmed.body {
        return Some(MatchRule::ExactContent);
    }
    if time_distance(pending.created_at, confirmed.created_at) < window {
        return Some(MatchRule::TimeProximity);
    }
    None
}

pub fn time_distance(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    (a - b).abs().to_std().unwrap_or(Duration::MAX)
}

/// Picks, for one confirmed message, the best candidate among pending sends:
/// any exact-content match beats every proximity match; among equals the
/// earliest candidate wins for content and the closest for proximity.
pub fn best_candidate<'a, I, K>(confirmed: &SendKey<'_>, candidates: I, window: Duration) -> Option<K>
where
    I: IntoIterator<Item = (K, SendKey<'a>)>,
{
    let mut best: Option<(MatchRule, Duration, DateTime<Utc>, K)> = None;
    for (key, pending) in candidates {
        let Some(rule) = match_rule(&pending, confirmed, window) else {
            continue;
        };
        let distance = time_distance(pending.created_at, confirmed.created_at);
        let better = match &best {
            None => true,
            Some((best_rule, best_distance, best_created, _)) => match rule.cmp(best_rule) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => match rule {
                    MatchRule::ExactContent => pending.created_at < *best_created,
                    MatchRule::TimeProximity => distance < *best_distance,
                },
            },
        };
        if better {
            best = Some((rule, distance, pending.created_at, key));
        }
    }
    best.map(|(_, _, _, key)| key)
}
