//! Ordered, duplicate-free message log.
//!
//! Two messages are the same when they share a server id, when they share a
//! local id, or when at least one of them lacks a server id and both carry the
//! same sender and text within the dedup window. A new optimistic entry is only
//! ever matched by its local id.

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use shared::domain::{LocalId, Origin};

use crate::{error::ValidationError, message::Message};

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

pub type MessageLog = Vec<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Inserted,
    /// A stronger copy replaced the stored one (e.g. a confirmed send).
    Upgraded,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub upgraded: usize,
    pub duplicates: usize,
    pub rejected: Vec<ValidationError>,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted + self.upgraded > 0
    }

    fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Inserted => self.inserted += 1,
            Admission::Upgraded => self.upgraded += 1,
            Admission::Duplicate => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: Message,
    admitted_at: DateTime<Utc>,
    /// Non-decreasing along the log. Equals `sent_at` when known; otherwise
    /// no earlier than the entry before it.
    order_key: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    entries: Vec<Entry>,
    next_seq: u64,
    window: chrono::Duration,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::with_window(DEFAULT_DEDUP_WINDOW)
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn log(&self) -> MessageLog {
        self.entries.iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.entries
            .iter()
            .map(|entry| &entry.message)
            .filter(|message| message.is_pending())
    }

    pub fn append(&mut self, message: Message) -> Result<Admission, ValidationError> {
        self.append_at(message, Utc::now())
    }

    pub(crate) fn append_at(
        &mut self,
        message: Message,
        now: DateTime<Utc>,
    ) -> Result<Admission, ValidationError> {
        message.validate()?;
        Ok(self.admit(message, now, &mut HashSet::new()))
    }

    /// Bulk merge. Each stored entry absorbs at most one record of the batch,
    /// so re-merging the same snapshot is a no-op.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Message>) -> MergeReport {
        self.merge_at(incoming, Utc::now())
    }

    pub(crate) fn merge_at(
        &mut self,
        incoming: impl IntoIterator<Item = Message>,
        now: DateTime<Utc>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut claimed = HashSet::new();
        for message in incoming {
            if let Err(err) = message.validate() {
                report.rejected.push(err);
                continue;
            }
            report.record(self.admit(message, now, &mut claimed));
        }
        report
    }

    /// Installs a baseline snapshot: everything but pending sends is dropped
    /// before the snapshot is merged.
    pub fn replace(&mut self, snapshot: impl IntoIterator<Item = Message>) -> MergeReport {
        self.replace_at(snapshot, Utc::now())
    }

    pub(crate) fn replace_at(
        &mut self,
        snapshot: impl IntoIterator<Item = Message>,
        now: DateTime<Utc>,
    ) -> MergeReport {
        self.entries.retain(|entry| entry.message.is_pending());
        self.merge_at(snapshot, now)
    }

    /// Reverts a pending send. Confirmed entries are left alone.
    pub fn remove_local(&mut self, local_id: LocalId) -> Option<Message> {
        let index = self.entries.iter().position(|entry| {
            entry.message.local_id == Some(local_id) && entry.message.is_pending()
        })?;
        Some(self.entries.remove(index).message)
    }

    pub fn contains_local(&self, local_id: LocalId) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.message.local_id == Some(local_id))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn admit(
        &mut self,
        message: Message,
        now: DateTime<Utc>,
        claimed: &mut HashSet<u64>,
    ) -> Admission {
        let Some(index) = self.find_same(&message, now, claimed) else {
            let entry = Entry {
                seq: self.next_seq,
                message,
                admitted_at: now,
                order_key: now,
            };
            self.next_seq += 1;
            claimed.insert(entry.seq);
            self.insert_ordered(entry);
            return Admission::Inserted;
        };

        claimed.insert(self.entries[index].seq);
        if !supersedes(&message, &self.entries[index].message) {
            return Admission::Duplicate;
        }

        let stored = self.entries.remove(index);
        let previous_sent_at = stored.message.sent_at;
        let upgraded = Entry {
            seq: stored.seq,
            message: absorb(stored.message, message),
            admitted_at: stored.admitted_at,
            order_key: stored.order_key,
        };
        if upgraded.message.sent_at != previous_sent_at {
            self.insert_ordered(upgraded);
        } else {
            self.entries.insert(index, upgraded);
        }
        Admission::Upgraded
    }

    fn find_same(
        &self,
        incoming: &Message,
        now: DateTime<Utc>,
        claimed: &HashSet<u64>,
    ) -> Option<usize> {
        if let Some(id) = &incoming.id {
            let found = self
                .entries
                .iter()
                .position(|entry| entry.message.id.as_ref() == Some(id));
            if found.is_some() {
                return found;
            }
        }

        if let Some(local_id) = incoming.local_id {
            let found = self
                .entries
                .iter()
                .position(|entry| entry.message.local_id == Some(local_id));
            if found.is_some() {
                return found;
            }
        }

        if incoming.origin == Origin::Optimistic {
            return None;
        }

        self.entries.iter().position(|entry| {
            let stored = &entry.message;
            !claimed.contains(&entry.seq)
                && (stored.id.is_none() || incoming.id.is_none())
                && stored.sender == incoming.sender
                && stored.text == incoming.text
                && self.within_window(entry, incoming, now)
        })
    }

    /// Each side is measured by its own timestamp, falling back to when it
    /// reached this store.
    fn within_window(&self, entry: &Entry, incoming: &Message, now: DateTime<Utc>) -> bool {
        let stored_at = entry.message.sent_at.unwrap_or(entry.admitted_at);
        let incoming_at = incoming.sent_at.unwrap_or(now);
        let gap = if stored_at >= incoming_at {
            stored_at - incoming_at
        } else {
            incoming_at - stored_at
        };
        gap <= self.window
    }

    /// Timestamped messages slot in after the last entry that is not newer;
    /// everything else keeps arrival order.
    fn insert_ordered(&mut self, mut entry: Entry) {
        let Some(sent_at) = entry.message.sent_at else {
            if let Some(last) = self.entries.last() {
                entry.order_key = entry.order_key.max(last.order_key);
            }
            self.entries.push(entry);
            return;
        };
        entry.order_key = sent_at;
        let mut index = self.entries.len();
        while index > 0 && self.entries[index - 1].order_key > sent_at {
            index -= 1;
        }
        self.entries.insert(index, entry);
    }
}

fn supersedes(incoming: &Message, stored: &Message) -> bool {
    (stored.is_pending() && !incoming.is_pending())
        || (stored.id.is_none() && incoming.id.is_some())
        || (stored.sent_at.is_none() && incoming.sent_at.is_some())
}

fn absorb(stored: Message, incoming: Message) -> Message {
    if incoming.is_pending() {
        return stored;
    }
    let stored_pending = stored.is_pending();
    Message {
        id: incoming.id.or(stored.id),
        sender: incoming.sender,
        text: incoming.text,
        sent_at: incoming.sent_at.or(stored.sent_at),
        origin: if stored_pending {
            incoming.origin
        } else {
            stored.origin
        },
        local_id: stored.local_id.or(incoming.local_id),
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
