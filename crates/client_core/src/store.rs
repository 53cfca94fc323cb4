//! Ordered, id-keyed conversation for one task.

use std::{
    collections::{hash_map::Entry as MapEntry, HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, TaskId},
    protocol::{Message, MessageRow},
};

use crate::matching::{best_candidate, match_rule, time_distance, MatchRule, SendKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// The message belongs to another task or cannot be built from the row.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Confirmed ids that were not in the store before the merge.
    pub discovered: Vec<MessageId>,
    /// `(temp id, confirmed id)` pairs folded together by the merge.
    pub reconciled: Vec<(MessageId, MessageId)>,
    /// Confirmed entries the authoritative list no longer contains.
    pub dropped: usize,
}

/// Removed ids remembered so that a list fetched before the removal cannot
/// bring them back.
const REMOVED_LIMIT: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    /// Store revision of the last local change to this entry.
    rev: u64,
    /// Set once the entry has taken over an optimistic send.
    paired: bool,
    message: Message,
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    task_id: TaskId,
    entries: Vec<Entry>,
    next_seq: u64,
    revision: u64,
    removed: HashMap<MessageId, u64>,
    match_window: Duration,
}

impl MessageStore {
    pub fn new(task_id: TaskId, match_window: Duration) -> Self {
        Self {
            task_id,
            entries: Vec::new(),
            next_seq: 0,
            revision: 0,
            removed: HashMap::new(),
            match_window,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Increases with every local change; pass it to [`Self::merge_fetched`]
    /// for a list requested at this point.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|idx| &self.entries[idx].message)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Sorted copy of the conversation.
    pub fn snapshot(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn replies(&self, parent_id: &MessageId) -> Vec<&Message> {
        self.iter()
            .filter(|message| message.parent_id.as_ref() == Some(parent_id))
            .collect()
    }

    pub fn pinned(&self) -> Vec<&Message> {
        self.iter().filter(|message| message.pinned).collect()
    }

    pub fn upsert(&mut self, message: Message) -> Upsert {
        if message.task_id != self.task_id {
            return Upsert::Ignored;
        }
        let outcome = match self.position(&message.id) {
            Some(idx) => {
                self.entries[idx].message.merge_from(message);
                self.touch(idx);
                Upsert::Updated
            }
            None => {
                self.push(message, false);
                Upsert::Inserted
            }
        };
        self.sort();
        outcome
    }

    /// Applies a partial row in place, or inserts it when the id is unknown
    /// and the row is complete enough to stand on its own.
    pub fn upsert_row(&mut self, row: &MessageRow, now: DateTime<Utc>) -> Upsert {
        let Some(id) = row.id.as_ref() else {
            return Upsert::Ignored;
        };
        if row.task_id.as_ref().is_some_and(|task_id| *task_id != self.task_id) {
            return Upsert::Ignored;
        }
        if let Some(idx) = self.position(id) {
            self.entries[idx].message.apply_row(row);
            self.touch(idx);
            self.sort();
            return Upsert::Updated;
        }
        match Message::from_row(row, now) {
            Some(message) => self.upsert(message),
            None => Upsert::Ignored,
        }
    }

    /// Mutates one message in place and keeps the order.
    pub fn update<F>(&mut self, id: &MessageId, apply: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let Some(idx) = self.position(id) else {
            return false;
        };
        apply(&mut self.entries[idx].message);
        self.touch(idx);
        self.sort();
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let idx = self.position(id)?;
        let message = self.entries.remove(idx).message;
        if !message.is_temporary() {
            self.revision += 1;
            self.removed.insert(message.id.clone(), self.revision);
            if self.removed.len() > REMOVED_LIMIT {
                let oldest = self
                    .removed
                    .iter()
                    .min_by_key(|(_, rev)| **rev)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    self.removed.remove(&oldest);
                }
            }
        }
        Some(message)
    }

    /// Swaps an optimistic entry for its confirmed counterpart. The confirmed
    /// message takes over the temp entry's insertion slot; if it is already
    /// present the temp entry is just dropped.
    pub fn replace_temp(&mut self, temp_id: &MessageId, confirmed: Message) -> Upsert {
        if confirmed.task_id != self.task_id {
            self.remove(temp_id);
            return Upsert::Ignored;
        }
        let temp_idx = self.position(temp_id);
        let outcome = match (self.position(&confirmed.id), temp_idx) {
            (Some(existing), _) => {
                self.entries[existing].message.merge_from(confirmed);
                self.entries[existing].paired = true;
                self.touch(existing);
                if let Some(temp_idx) = temp_idx {
                    self.entries.remove(temp_idx);
                }
                Upsert::Updated
            }
            (None, Some(temp_idx)) => {
                self.entries[temp_idx].message = confirmed;
                self.entries[temp_idx].paired = true;
                self.touch(temp_idx);
                Upsert::Updated
            }
            (None, None) => {
                self.push(confirmed, true);
                Upsert::Inserted
            }
        };
        self.sort();
        outcome
    }

    /// Optimistic entry (if any) that the given confirmed message represents.
    pub fn find_temp_match(&self, confirmed: &Message) -> Option<MessageId> {
        let target = SendKey::of(confirmed);
        best_candidate(
            &target,
            self.entries
                .iter()
                .filter(|entry| entry.message.is_temporary())
                .map(|entry| (entry.message.id.clone(), SendKey::of(&entry.message))),
            self.match_window,
        )
    }

    /// Optimistic entry that an already stored confirmed message stands for,
    /// when that message has not taken over a send yet. Only optimistic
    /// entries created before the confirmed one arrived qualify.
    pub fn find_unpaired_temp_match(&self, confirmed_id: &MessageId) -> Option<MessageId> {
        let confirmed = &self.entries[self.position(confirmed_id)?];
        if confirmed.paired || confirmed.message.is_temporary() {
            return None;
        }
        best_candidate(
            &SendKey::of(&confirmed.message),
            self.entries
                .iter()
                .filter(|entry| entry.message.is_temporary() && entry.seq < confirmed.seq)
                .map(|entry| (entry.message.id.clone(), SendKey::of(&entry.message))),
            self.match_window,
        )
    }

    /// Unpaired confirmed message that arrived after the given optimistic
    /// entry and matches it.
    pub fn find_confirmed_match(&self, temp_id: &MessageId) -> Option<MessageId> {
        let temp = &self.entries[self.position(temp_id)?];
        if !temp.message.is_temporary() {
            return None;
        }
        best_candidate(
            &SendKey::of(&temp.message),
            self.entries
                .iter()
                .filter(|entry| {
                    !entry.paired && !entry.message.is_temporary() && entry.seq > temp.seq
                })
                .map(|entry| (entry.message.id.clone(), SendKey::of(&entry.message))),
            self.match_window,
        )
    }

    /// Drops an optimistic entry whose confirmed message is already stored.
    pub fn absorb_temp(&mut self, temp_id: &MessageId, confirmed_id: &MessageId) -> bool {
        let Some(temp_idx) = self.position(temp_id) else {
            return false;
        };
        if !self.entries[temp_idx].message.is_temporary() {
            return false;
        }
        let Some(confirmed_idx) = self.position(confirmed_id) else {
            return false;
        };
        self.entries[confirmed_idx].paired = true;
        self.touch(confirmed_idx);
        self.entries.remove(temp_idx);
        true
    }

    /// Bulk reconciliation against an authoritative list fetched at the
    /// current revision.
    pub fn merge(&mut self, incoming: Vec<Message>) -> MergeReport {
        self.merge_fetched(incoming, self.revision)
    }

    /// Bulk reconciliation against a list requested when the store was at
    /// revision `fetched_at`.
    ///
    /// Confirmed entries are replaced by the incoming copies (and dropped when
    /// absent from it). Entries changed after `fetched_at` are newer than the
    /// list and are kept as they are; ids removed after `fetched_at` are not
    /// brought back. Optimistic entries survive unless a confirmed message
    /// that is new to the store matches them; each such message absorbs at
    /// most one optimistic entry. Incoming messages of other tasks are
    /// discarded.
    pub fn merge_fetched(&mut self, incoming: Vec<Message>, fetched_at: u64) -> MergeReport {
        let mut order: Vec<MessageId> = Vec::new();
        let mut by_id: HashMap<MessageId, Message> = HashMap::new();
        for message in incoming {
            if message.task_id != self.task_id || message.is_temporary() {
                continue;
            }
            if self
                .removed
                .get(&message.id)
                .is_some_and(|rev| *rev > fetched_at)
            {
                continue;
            }
            match by_id.entry(message.id.clone()) {
                MapEntry::Occupied(mut slot) => slot.get_mut().merge_from(message),
                MapEntry::Vacant(slot) => {
                    order.push(message.id.clone());
                    slot.insert(message);
                }
            }
        }

        let mut previous: HashMap<MessageId, Entry> = HashMap::new();
        let mut temps: Vec<Entry> = Vec::new();
        for entry in self.entries.drain(..) {
            if entry.message.is_temporary() {
                temps.push(entry);
            } else {
                previous.insert(entry.message.id.clone(), entry);
            }
        }

        let discovered: Vec<MessageId> = order
            .iter()
            .filter(|id| !previous.contains_key(*id))
            .cloned()
            .collect();

        let window = self.match_window;
        let mut claimed: HashSet<MessageId> = HashSet::new();
        let mut absorbed: HashMap<u64, MessageId> = HashMap::new();
        for rule in [MatchRule::ExactContent, MatchRule::TimeProximity] {
            for temp in &temps {
                if absorbed.contains_key(&temp.seq) {
                    continue;
                }
                let key = SendKey::of(&temp.message);
                let pick = discovered
                    .iter()
                    .filter(|id| !claimed.contains(*id))
                    .filter_map(|id| {
                        let candidate = &by_id[id];
                        (match_rule(&key, &SendKey::of(candidate), window) == Some(rule))
                        .then(|| {
                            (
                                id,
                                time_distance(key.created_at, candidate.created_at),
                            )
                        })
                    })
                    .min_by_key(|(_, distance)| *distance)
                    .map(|(id, _)| id.clone());
                if let Some(id) = pick {
                    claimed.insert(id.clone());
                    absorbed.insert(temp.seq, id);
                }
            }
        }

        let mut report = MergeReport {
            discovered,
            ..MergeReport::default()
        };
        let mut slot_for: HashMap<MessageId, u64> = HashMap::new();
        for temp in temps {
            match absorbed.remove(&temp.seq) {
                Some(confirmed_id) => {
                    report
                        .reconciled
                        .push((temp.message.id.clone(), confirmed_id.clone()));
                    slot_for.insert(confirmed_id, temp.seq);
                }
                None => self.entries.push(temp),
            }
        }

        for id in order {
            let Some(message) = by_id.remove(&id) else {
                continue;
            };
            match previous.remove(&id) {
                Some(mut entry) => {
                    if entry.rev <= fetched_at {
                        entry.message.merge_from(message);
                    }
                    self.entries.push(entry);
                }
                None => match slot_for.remove(&id) {
                    Some(seq) => {
                        self.revision += 1;
                        self.entries.push(Entry {
                            seq,
                            rev: self.revision,
                            paired: true,
                            message,
                        });
                    }
                    None => self.push(message, false),
                },
            }
        }
        for entry in previous.into_values() {
            if entry.rev > fetched_at {
                self.entries.push(entry);
            } else {
                report.dropped += 1;
            }
        }

        self.sort();
        report
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.message.id == *id)
    }

    fn push(&mut self, message: Message, paired: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.revision += 1;
        self.entries.push(Entry {
            seq,
            rev: self.revision,
            paired,
            message,
        });
    }

    fn touch(&mut self, idx: usize) {
        self.revision += 1;
        self.entries[idx].rev = self.revision;
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.seq.cmp(&b.seq))
        });
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
