//! Ordered, deduplicated message sequence for one conversation.
//!
//! Remote entries are kept in `(sent_at, id)` order. Entries produced by this
//! session are pinned: they are appended at the tail when the send starts and
//! never move afterwards, even once the server assigns its own timestamp.

use std::collections::HashSet;

use shared::{
    domain::{ConversationId, Cursor, MessageId},
    protocol::{HistoryPage, Message},
};
use tracing::debug;

use crate::{
    error::{InvariantViolation, SyncError},
    types::{
        DraftId, LocalSend, PendingSend, ReadState, SearchHit, SendPayload, SendStatus,
        TimelineEntry, TimelineSnapshot,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Highlight {
    id: MessageId,
    token: u64,
}

#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    conversation_id: ConversationId,
    entries: Vec<TimelineEntry>,
    known_ids: HashSet<MessageId>,
    next_cursor: Option<Cursor>,
    has_more: bool,
    highlight: Option<Highlight>,
    highlight_seq: u64,
}

impl ConversationTimeline {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            known_ids: HashSet::new(),
            next_cursor: None,
            has_more: false,
            highlight: None,
            highlight_seq: 0,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.next_cursor.as_ref()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.known_ids.contains(id)
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.known_ids.contains(id) {
            return None;
        }
        self.entries.iter().position(|entry| entry.id() == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&TimelineEntry> {
        self.position(id).map(|index| &self.entries[index])
    }

    pub fn highlighted(&self) -> Option<&MessageId> {
        self.highlight.as_ref().map(|highlight| &highlight.id)
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            conversation_id: self.conversation_id.clone(),
            entries: self.entries.clone(),
            has_more: self.has_more,
            next_cursor: self.next_cursor.clone(),
            highlighted: self.highlighted().cloned(),
        }
    }

    /// Replaces the timeline with the newest page. Local sends that are not
    /// confirmed yet are carried over to the tail so a reload never drops
    /// them.
    pub fn replace_with_page(&mut self, page: HistoryPage) -> usize {
        let carried = self
            .entries
            .drain(..)
            .filter(|entry| {
                entry
                    .local
                    .as_ref()
                    .is_some_and(|local| local.status != SendStatus::Confirmed)
            })
            .collect::<Vec<_>>();

        self.known_ids.clear();
        self.highlight = None;
        self.set_cursor(page.has_more, page.next_cursor);

        let mut messages = page.messages;
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        for message in messages {
            if self.known_ids.insert(message.id.clone()) {
                self.entries.push(TimelineEntry::remote(message));
            }
        }
        for entry in carried {
            if self.known_ids.insert(entry.id().clone()) {
                self.entries.push(entry);
            }
        }
        self.entries.len()
    }

    /// Applies a successfully fetched older page. Never called for a failed
    /// fetch, so the cursor only advances together with the entries.
    pub fn prepend_older(&mut self, page: HistoryPage) -> usize {
        let added = self.merge(page.messages).len();
        self.set_cursor(page.has_more, page.next_cursor);
        added
    }

    /// Deduplicating ordered insert. Ids already known win over incoming
    /// copies, so replaying the same batch is a no-op. Returns inserted ids in
    /// order-key order.
    pub fn merge(&mut self, mut messages: Vec<Message>) -> Vec<MessageId> {
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        let mut inserted = Vec::new();
        for message in messages {
            if self.known_ids.contains(&message.id) {
                continue;
            }
            let id = message.id.clone();
            let index = self.insertion_index(&message);
            self.known_ids.insert(id.clone());
            self.entries.insert(index, TimelineEntry::remote(message));
            inserted.push(id);
        }
        inserted
    }

    /// Position for a remote message: right after the last remote entry that
    /// sorts at or before it, stepping over pinned entries shown no later
    /// than the message itself.
    fn insertion_index(&self, message: &Message) -> usize {
        let key = message.order_key();
        let mut index = self
            .entries
            .iter()
            .rposition(|entry| !entry.is_pinned() && entry.message.order_key() <= key)
            .map_or(0, |found| found + 1);
        while let Some(entry) = self.entries.get(index) {
            if entry.is_pinned() && entry.message.sent_at <= message.sent_at {
                index += 1;
            } else {
                break;
            }
        }
        index
    }

    pub fn insert_optimistic(&mut self, pending: PendingSend) -> usize {
        let PendingSend {
            message,
            draft_id,
            payload,
        } = pending;
        let temp_id = message.id.clone();
        self.known_ids.insert(temp_id.clone());
        self.entries.push(TimelineEntry {
            read: ReadState::from_server(message.is_read),
            message,
            local: Some(LocalSend {
                temp_id,
                draft_id,
                status: SendStatus::Pending,
                payload: Some(payload),
            }),
        });
        self.entries.len() - 1
    }

    fn local_index(&self, temp_id: &MessageId) -> Result<usize, SyncError> {
        self.entries
            .iter()
            .position(|entry| {
                entry.local.as_ref().is_some_and(|local| {
                    &local.temp_id == temp_id && local.status != SendStatus::Confirmed
                })
            })
            .ok_or_else(|| SyncError::UnknownLocalSend(temp_id.clone()))
    }

    /// Replaces a pending entry in place with the server's copy. Extra
    /// messages (one per file uploads) land right after it. A copy of a
    /// confirmed id that already arrived through poll or push is dropped in
    /// favor of the pinned position.
    pub fn reconcile_success(
        &mut self,
        temp_id: &MessageId,
        confirmed: Vec<Message>,
    ) -> Result<(usize, Vec<MessageId>), SyncError> {
        let mut index = self.local_index(temp_id)?;
        let mut seen = HashSet::new();
        let ids = confirmed
            .iter()
            .map(|message| message.id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect::<Vec<_>>();

        for id in &ids {
            if id == temp_id || !self.known_ids.contains(id) {
                continue;
            }
            if let Some(echo) = self.entries.iter().position(|entry| entry.id() == id) {
                debug!(
                    conversation_id = %self.conversation_id,
                    message_id = %id,
                    "timeline: dropping early echo of a local send"
                );
                self.entries.remove(echo);
                self.known_ids.remove(id);
                if echo < index {
                    index -= 1;
                }
            }
        }

        let mut confirmed = confirmed.into_iter();
        let Some(first) = confirmed.next() else {
            self.reconcile_failure(temp_id, "server returned no message")?;
            return Ok((index, ids));
        };

        let local = {
            let entry = &mut self.entries[index];
            let mut local = entry
                .local
                .take()
                .ok_or_else(|| SyncError::UnknownLocalSend(temp_id.clone()))?;
            local.status = SendStatus::Confirmed;
            local.payload = None;
            entry.read = entry.read.merge(ReadState::from_server(first.is_read));
            entry.message = first;
            entry.message.is_read = entry.read.is_read();
            entry.local = Some(local.clone());
            local
        };
        self.known_ids.remove(temp_id);
        self.known_ids.insert(ids[0].clone());

        let mut offset = 0;
        for message in confirmed {
            if !self.known_ids.insert(message.id.clone()) {
                debug!(
                    conversation_id = %self.conversation_id,
                    message_id = %message.id,
                    "timeline: skipping repeated id in send confirmation"
                );
                continue;
            }
            offset += 1;
            let mut entry = TimelineEntry::remote(message);
            entry.local = Some(local.clone());
            self.entries.insert(index + offset, entry);
        }

        Ok((index, ids))
    }

    pub fn reconcile_failure(
        &mut self,
        temp_id: &MessageId,
        reason: impl Into<String>,
    ) -> Result<usize, SyncError> {
        let index = self.local_index(temp_id)?;
        if let Some(local) = self.entries[index].local.as_mut() {
            local.status = SendStatus::Failed {
                reason: reason.into(),
            };
        }
        Ok(index)
    }

    /// Flips a failed local send back to pending for another attempt.
    pub fn begin_retry(
        &mut self,
        temp_id: &MessageId,
    ) -> Result<(usize, DraftId, SendPayload), SyncError> {
        let index = self.local_index(temp_id)?;
        let local = self.entries[index]
            .local
            .as_mut()
            .ok_or_else(|| SyncError::UnknownLocalSend(temp_id.clone()))?;
        if !local.status.is_failed() {
            return Err(SyncError::NotFailed(temp_id.clone()));
        }
        let payload = local
            .payload
            .clone()
            .ok_or_else(|| SyncError::UnknownLocalSend(temp_id.clone()))?;
        local.status = SendStatus::Pending;
        Ok((index, local.draft_id, payload))
    }

    /// Removes a failed local send at the user's request.
    pub fn remove_failed(&mut self, temp_id: &MessageId) -> Result<usize, SyncError> {
        let index = self.local_index(temp_id)?;
        if !self.entries[index].status().is_failed() {
            return Err(SyncError::NotFailed(temp_id.clone()));
        }
        self.entries.remove(index);
        self.known_ids.remove(temp_id);
        if self.highlighted() == Some(temp_id) {
            self.highlight = None;
        }
        Ok(index)
    }

    /// Moves read state forward for the given ids. Unknown ids and entries
    /// already at or past `state` are skipped. Returns the ids that changed.
    pub fn apply_read(&mut self, ids: &HashSet<MessageId>, state: ReadState) -> Vec<MessageId> {
        let mut changed = Vec::new();
        for entry in &mut self.entries {
            if ids.contains(entry.id()) && entry.set_read(state) {
                changed.push(entry.id().clone());
            }
        }
        changed
    }

    pub fn set_highlight(&mut self, id: &MessageId) -> Result<(usize, u64), SyncError> {
        let index = self
            .position(id)
            .ok_or_else(|| SyncError::NotMaterialized(id.clone()))?;
        self.highlight_seq += 1;
        self.highlight = Some(Highlight {
            id: id.clone(),
            token: self.highlight_seq,
        });
        Ok((index, self.highlight_seq))
    }

    /// Clears the highlight only if it is still the one identified by
    /// `token`; a newer `set_highlight` keeps its own timer.
    pub fn clear_highlight(&mut self, token: u64) -> Option<MessageId> {
        if self.highlight.as_ref().map(|highlight| highlight.token) != Some(token) {
            return None;
        }
        self.highlight.take().map(|highlight| highlight.id)
    }

    /// Case-insensitive substring search over text content, in timeline order.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry
                    .message
                    .body
                    .text_content()
                    .is_some_and(|text| text.to_lowercase().contains(&needle))
            })
            .map(|(index, entry)| SearchHit {
                index,
                message_id: entry.id().clone(),
            })
            .collect()
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            if !seen.insert(entry.id()) {
                return Err(InvariantViolation::DuplicateId(entry.id().clone()));
            }
        }
        if seen.len() != self.known_ids.len()
            || seen.iter().any(|id| !self.known_ids.contains(*id))
        {
            return Err(InvariantViolation::KnownIdsMismatch);
        }

        let mut previous: Option<&Message> = None;
        for entry in self.entries.iter().filter(|entry| !entry.is_pinned()) {
            if let Some(prev) = previous {
                if prev.order_key() > entry.message.order_key() {
                    return Err(InvariantViolation::OutOfOrder {
                        earlier: entry.id().clone(),
                        later: prev.id.clone(),
                    });
                }
            }
            previous = Some(&entry.message);
        }
        Ok(())
    }

    fn set_cursor(&mut self, has_more: bool, next_cursor: Option<Cursor>) {
        self.has_more = has_more && next_cursor.is_some();
        self.next_cursor = if self.has_more { next_cursor } else { None };
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
