//! Read receipts as a two-phase state per message: marked locally first,
//! confirmed by the server later. Both phases only move forward.

use std::collections::{BTreeSet, HashMap, HashSet};

use shared::domain::{ConversationId, MessageId, UserId};

use crate::{timeline::ConversationTimeline, types::ReadState};

/// Messages authored by someone other than `self_id` that are still unread.
/// Pending local sends are never included.
pub fn compute_unread(timeline: &ConversationTimeline, self_id: &UserId) -> BTreeSet<MessageId> {
    timeline
        .entries()
        .iter()
        .filter(|entry| {
            !entry.is_pinned() && &entry.message.sender_id != self_id && !entry.read.is_read()
        })
        .map(|entry| entry.id().clone())
        .collect()
}

/// Optimistic local mark. Returns the ids that actually changed.
pub fn mark_local<'a>(
    timeline: &mut ConversationTimeline,
    ids: impl IntoIterator<Item = &'a MessageId>,
) -> Vec<MessageId> {
    let ids = ids.into_iter().cloned().collect::<HashSet<_>>();
    timeline.apply_read(&ids, ReadState::Local)
}

/// Server confirmation. Idempotent; ids not materialized in the timeline are
/// ignored, and nothing is ever moved back to unread.
pub fn confirm_remote<'a>(
    timeline: &mut ConversationTimeline,
    ids: impl IntoIterator<Item = &'a MessageId>,
) -> Vec<MessageId> {
    let ids = ids.into_iter().cloned().collect::<HashSet<_>>();
    timeline.apply_read(&ids, ReadState::Confirmed)
}

/// Batches ids awaiting remote confirmation, per conversation.
#[derive(Debug)]
pub struct ReadReceiptTracker {
    self_id: UserId,
    queued: HashMap<ConversationId, BTreeSet<MessageId>>,
}

impl ReadReceiptTracker {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            queued: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Runs one trigger: marks every unread message from others locally and
    /// queues it for confirmation. Returns the newly marked ids and whether a
    /// flush has to be scheduled (first ids queued since the last flush).
    pub fn mark_unread(
        &mut self,
        timeline: &mut ConversationTimeline,
    ) -> (Vec<MessageId>, bool) {
        let unread = compute_unread(timeline, &self.self_id);
        if unread.is_empty() {
            return (Vec::new(), false);
        }
        let marked = mark_local(timeline, &unread);
        let schedule = self.enqueue(timeline.conversation_id(), unread);
        (marked, schedule)
    }

    pub fn enqueue(
        &mut self,
        conversation_id: &ConversationId,
        ids: impl IntoIterator<Item = MessageId>,
    ) -> bool {
        let queue = self.queued.entry(conversation_id.clone()).or_default();
        let was_empty = queue.is_empty();
        queue.extend(ids);
        was_empty && !queue.is_empty()
    }

    pub fn take_batch(&mut self, conversation_id: &ConversationId) -> Vec<MessageId> {
        self.queued
            .remove(conversation_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn has_queued(&self, conversation_id: &ConversationId) -> bool {
        self.queued
            .get(conversation_id)
            .is_some_and(|ids| !ids.is_empty())
    }
}

#[cfg(test)]
#[path = "tests/read_receipts_tests.rs"]
mod tests;
