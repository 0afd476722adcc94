// File: client/timeline.rs
//
// One project's message list as a single viewer sees it.

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::{ChatError, Result};
use crate::models::{DeleteScope, Message, Visibility};

pub const OWN_DELETED_PLACEHOLDER: &str = "You deleted this message";
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Lifecycle of a local delete intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Applied locally, waiting for the server.
    PendingLocal,
    /// The server accepted it; the mask is now part of the confirmed copy.
    Confirmed,
    /// The server refused it; the mask was dropped.
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingMask {
    request_id: u64,
    scope: DeleteScope,
}

#[derive(Debug, Clone)]
struct Entry {
    confirmed: Message,
    pending: Option<PendingMask>,
}

impl Entry {
    /// What the viewer should see: the server's copy with any pending mask on top.
    fn effective(&self, viewer_id: &str) -> Message {
        let mut message = self.confirmed.clone();
        if let Some(mask) = self.pending {
            message.apply_delete(mask.scope, viewer_id);
        }
        message
    }
}

/// A message as it should be drawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedMessage {
    Visible(Message),
    Deleted {
        id: String,
        sender_id: String,
        created_at: DateTime<Utc>,
        placeholder: &'static str,
    },
}

impl RenderedMessage {
    pub fn id(&self) -> &str {
        match self {
            RenderedMessage::Visible(message) => &message.id,
            RenderedMessage::Deleted { id, .. } => id,
        }
    }
}

/// Ordered, de-duplicated messages of one room.
///
/// Entries are kept in `(created_at, id)` order. Live messages land at the
/// tail because the server broadcasts in creation order; history pages fill
/// gaps. A placed entry never moves, deletes only change its state.
#[derive(Debug, Clone)]
pub struct ProjectTimeline {
    project_id: String,
    viewer_id: String,
    entries: Vec<Entry>,
}

impl ProjectTimeline {
    pub fn new(project_id: &str, viewer_id: &str) -> Self {
        ProjectTimeline {
            project_id: project_id.to_string(),
            viewer_id: viewer_id.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.confirmed.id == message_id)
    }

    /// The viewer's current copy, pending masks included.
    pub fn get(&self, message_id: &str) -> Option<Message> {
        self.position(message_id)
            .map(|i| self.entries[i].effective(&self.viewer_id))
    }

    /// All messages in room order, pending masks included.
    pub fn messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .map(|e| e.effective(&self.viewer_id))
            .collect()
    }

    pub fn pending_state(&self, message_id: &str) -> Option<PendingState> {
        self.position(message_id)
            .and_then(|i| self.entries[i].pending)
            .map(|_| PendingState::PendingLocal)
    }

    /// Places a message the timeline has not seen, or folds the masks of a
    /// known one. Returns true when something changed.
    fn upsert(&mut self, message: Message) -> bool {
        if message.project_id != self.project_id {
            debug!(
                "Ignoring message {} of {} in timeline {}",
                message.id, message.project_id, self.project_id
            );
            return false;
        }
        if let Some(i) = self.position(&message.id) {
            return self.entries[i].confirmed.absorb(&message);
        }
        let at = self
            .entries
            .partition_point(|e| e.confirmed.order(&message).is_lt());
        self.entries.insert(
            at,
            Entry {
                confirmed: message,
                pending: None,
            },
        );
        true
    }

    /// Live `message_created`.
    pub fn apply_created(&mut self, message: Message) -> bool {
        self.upsert(message)
    }

    /// Live `message_deleted`. Unknown ids are ignored; the next history
    /// fetch brings them in already masked.
    pub fn apply_deleted(&mut self, message_id: &str, scope: DeleteScope, acting_user_id: &str) -> bool {
        match self.position(message_id) {
            Some(i) => self.entries[i].confirmed.apply_delete(scope, acting_user_id),
            None => false,
        }
    }

    /// Merges a history page. Returns how many messages were new.
    pub fn merge_history<I>(&mut self, page: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let mut added = 0;
        for message in page {
            let known = self.position(&message.id).is_some();
            if self.upsert(message) && !known {
                added += 1;
            }
        }
        added
    }

    /// Applies a delete intent locally before the server has answered.
    pub fn begin_delete(&mut self, message_id: &str, scope: DeleteScope, request_id: u64) -> Result<()> {
        let i = self
            .position(message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        let entry = &mut self.entries[i];
        if entry.pending.is_some() {
            return Err(ChatError::Validation(format!(
                "a delete of message {} is already pending",
                message_id
            )));
        }
        if scope == DeleteScope::ForEveryone && entry.confirmed.sender_id != self.viewer_id {
            return Err(ChatError::Forbidden(
                "only the sender can delete a message for everyone".to_string(),
            ));
        }
        entry.pending = Some(PendingMask { request_id, scope });
        Ok(())
    }

    fn take_pending(&mut self, request_id: u64) -> Option<(usize, PendingMask)> {
        self.entries.iter_mut().enumerate().find_map(|(i, e)| match e.pending {
            Some(mask) if mask.request_id == request_id => {
                e.pending = None;
                Some((i, mask))
            }
            _ => None,
        })
    }

    /// Folds the pending mask into the confirmed copy, plus whatever the
    /// server returned with the ack. `None` when no delete with that request
    /// id is pending here.
    pub fn confirm_delete(&mut self, request_id: u64, server_copy: Option<&Message>) -> Option<PendingState> {
        let Some((i, mask)) = self.take_pending(request_id) else {
            debug!("No pending delete {} in timeline {}", request_id, self.project_id);
            return None;
        };
        let viewer_id = self.viewer_id.clone();
        let confirmed = &mut self.entries[i].confirmed;
        confirmed.apply_delete(mask.scope, &viewer_id);
        if let Some(copy) = server_copy.filter(|copy| copy.id == confirmed.id) {
            confirmed.absorb(copy);
        }
        Some(PendingState::Confirmed)
    }

    /// Drops the pending mask; the entry shows the last confirmed state again.
    pub fn roll_back_delete(&mut self, request_id: u64) -> Option<PendingState> {
        if self.take_pending(request_id).is_none() {
            debug!("No pending delete {} in timeline {}", request_id, self.project_id);
            return None;
        }
        Some(PendingState::RolledBack)
    }

    /// Drops every pending mask. Returns the request ids that were pending.
    pub fn roll_back_all(&mut self) -> Vec<u64> {
        self.entries
            .iter_mut()
            .filter_map(|e| e.pending.take().map(|mask| mask.request_id))
            .collect()
    }

    /// The list as the viewer should see it: own hidden messages skipped,
    /// globally deleted ones as placeholders.
    pub fn render(&self) -> Vec<RenderedMessage> {
        self.entries
            .iter()
            .map(|e| e.effective(&self.viewer_id))
            .filter_map(|message| match message.visibility(&self.viewer_id) {
                Visibility::MaskedForViewer => None,
                Visibility::MaskedForAll => {
                    let placeholder = if message.sender_id == self.viewer_id {
                        OWN_DELETED_PLACEHOLDER
                    } else {
                        DELETED_PLACEHOLDER
                    };
                    Some(RenderedMessage::Deleted {
                        id: message.id,
                        sender_id: message.sender_id,
                        created_at: message.created_at,
                        placeholder,
                    })
                }
                Visibility::Visible => Some(RenderedMessage::Visible(message)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderProfile;
    use chrono::TimeZone;

    fn msg(n: i64, sender: &str) -> Message {
        let profile = SenderProfile {
            user_id: sender.to_string(),
            name: sender.to_uppercase(),
            image_url: None,
            is_creator: false,
        };
        Message::new(
            format!("m{:02}", n),
            "p1",
            &profile,
            format!("message {}", n),
            Utc.timestamp_millis_opt(1_700_000_000_000 + n).unwrap(),
        )
    }

    fn ids(timeline: &ProjectTimeline) -> Vec<String> {
        timeline.messages().into_iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_reconnect_merge_keeps_each_message_once() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        for n in 1..=5 {
            timeline.apply_created(msg(n, "x"));
        }
        // Message 6 arrives live while the history fetch is still in flight.
        timeline.apply_created(msg(6, "x"));
        let added = timeline.merge_history((1..=8).map(|n| msg(n, "x")));

        assert_eq!(added, 2);
        let expected: Vec<String> = (1..=8).map(|n| format!("m{:02}", n)).collect();
        assert_eq!(ids(&timeline), expected);
    }

    #[test]
    fn test_history_fills_gap_in_order() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        timeline.apply_created(msg(9, "x"));
        timeline.merge_history(vec![msg(3, "x"), msg(4, "x")]);
        timeline.merge_history(vec![msg(1, "x"), msg(2, "x")]);
        assert_eq!(ids(&timeline), ["m01", "m02", "m03", "m04", "m09"]);
    }

    #[test]
    fn test_duplicate_created_is_ignored() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        assert!(timeline.apply_created(msg(1, "x")));
        assert!(!timeline.apply_created(msg(1, "x")));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_stale_history_cannot_undelete() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        timeline.apply_created(msg(1, "x"));
        timeline.apply_deleted("m01", DeleteScope::ForEveryone, "x");
        // A page fetched before the delete still carries the content.
        timeline.merge_history(vec![msg(1, "x")]);

        let current = timeline.get("m01").unwrap();
        assert!(current.is_deleted_for_everyone);
        assert_eq!(current.content, None);
    }

    #[test]
    fn test_placeholder_depends_on_viewer() {
        let mut for_sender = ProjectTimeline::new("p1", "x");
        let mut for_other = ProjectTimeline::new("p1", "y");
        for timeline in [&mut for_sender, &mut for_other] {
            timeline.apply_created(msg(1, "x"));
            timeline.apply_deleted("m01", DeleteScope::ForEveryone, "x");
        }

        assert!(matches!(
            for_sender.render().as_slice(),
            [RenderedMessage::Deleted { placeholder: OWN_DELETED_PLACEHOLDER, .. }]
        ));
        assert!(matches!(
            for_other.render().as_slice(),
            [RenderedMessage::Deleted { placeholder: DELETED_PLACEHOLDER, .. }]
        ));
    }

    #[test]
    fn test_hidden_messages_are_skipped() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        timeline.apply_created(msg(1, "x"));
        timeline.apply_created(msg(2, "x"));
        timeline.apply_deleted("m01", DeleteScope::ForMe, "y");
        // Someone else hiding a message does not affect this viewer.
        timeline.apply_deleted("m02", DeleteScope::ForMe, "z");

        let rendered = timeline.render();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].id(), "m02");
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_optimistic_delete_confirm() {
        let mut timeline = ProjectTimeline::new("p1", "x");
        timeline.apply_created(msg(1, "x"));
        timeline.begin_delete("m01", DeleteScope::ForEveryone, 1).unwrap();

        assert_eq!(timeline.pending_state("m01"), Some(PendingState::PendingLocal));
        assert!(timeline.get("m01").unwrap().is_deleted_for_everyone);

        assert_eq!(timeline.confirm_delete(1, None), Some(PendingState::Confirmed));
        assert_eq!(timeline.pending_state("m01"), None);
        assert!(timeline.get("m01").unwrap().is_deleted_for_everyone);
    }

    #[test]
    fn test_optimistic_delete_rollback() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        timeline.apply_created(msg(1, "x"));
        timeline.begin_delete("m01", DeleteScope::ForMe, 4).unwrap();
        assert!(timeline.render().is_empty());

        assert_eq!(timeline.roll_back_delete(4), Some(PendingState::RolledBack));
        let rendered = timeline.render();
        assert!(matches!(rendered.as_slice(), [RenderedMessage::Visible(m)] if m.content.as_deref() == Some("message 1")));
    }

    #[test]
    fn test_unknown_request_is_neither_confirmed_nor_rolled_back() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        timeline.apply_created(msg(1, "x"));
        timeline.begin_delete("m01", DeleteScope::ForMe, 7).unwrap();

        assert_eq!(timeline.confirm_delete(8, None), None);
        assert_eq!(timeline.roll_back_delete(8), None);
        assert_eq!(timeline.pending_state("m01"), Some(PendingState::PendingLocal));

        assert_eq!(timeline.confirm_delete(7, None), Some(PendingState::Confirmed));
        assert_eq!(timeline.confirm_delete(7, None), None);
    }

    #[test]
    fn test_begin_delete_rejections() {
        let mut timeline = ProjectTimeline::new("p1", "y");
        timeline.apply_created(msg(1, "x"));
        assert!(matches!(
            timeline.begin_delete("m01", DeleteScope::ForEveryone, 1),
            Err(ChatError::Forbidden(_))
        ));
        assert!(matches!(
            timeline.begin_delete("missing", DeleteScope::ForMe, 2),
            Err(ChatError::NotFound(_))
        ));
        timeline.begin_delete("m01", DeleteScope::ForMe, 3).unwrap();
        assert!(matches!(
            timeline.begin_delete("m01", DeleteScope::ForMe, 4),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn test_roll_back_all() {
        let mut timeline = ProjectTimeline::new("p1", "x");
        timeline.apply_created(msg(1, "x"));
        timeline.apply_created(msg(2, "x"));
        timeline.begin_delete("m01", DeleteScope::ForMe, 1).unwrap();
        timeline.begin_delete("m02", DeleteScope::ForEveryone, 2).unwrap();

        let mut rolled = timeline.roll_back_all();
        rolled.sort();
        assert_eq!(rolled, [1, 2]);
        assert_eq!(timeline.render().len(), 2);
    }
}
