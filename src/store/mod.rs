//! Durable record of chat messages and their per-recipient visibility.
//!
//! The store never talks to the network. Every successful write returns the
//! updated [`Message`], which the gateway turns into a fan-out event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{ChatError, Result};
use crate::models::{DeleteScope, HistoryCursor, Message, SenderProfile};

pub mod memory;
pub mod mongo;

pub use memory::InMemoryMessageStore;
pub use mongo::MongoMessageStore;

/// One backward page of a room's history, oldest message first.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    /// Anchor for the next (older) page; `None` once the start of the room is reached.
    pub next_cursor: Option<HistoryCursor>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message to the room. Fails with `Validation` when the content
    /// is empty after trimming or longer than the configured bound.
    async fn append(&self, project_id: &str, sender: &SenderProfile, content: &str)
        -> Result<Message>;

    /// Returns up to `limit` messages strictly older than `before` (or the
    /// newest ones when `before` is `None`), each as [`Message::for_viewer`]
    /// shapes it for `viewer_id`.
    async fn list_history(
        &self,
        project_id: &str,
        viewer_id: &str,
        before: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage>;

    async fn get(&self, message_id: &str) -> Result<Message>;

    /// `FOR_ME` adds the actor to `deleted_for` (idempotent). `FOR_EVERYONE` is
    /// reserved to the sender and fails with `AlreadyDeleted` on a second call.
    async fn mark_deleted(
        &self,
        message_id: &str,
        acting_user_id: &str,
        scope: DeleteScope,
    ) -> Result<Message>;
}

/// Walks a room's history backward, one page per item, fetching lazily.
/// Dropping the stream and starting again from a saved cursor resumes the walk.
pub fn walk_history(
    store: Arc<dyn MessageStore>,
    project_id: String,
    viewer_id: String,
    start: Option<HistoryCursor>,
    page_size: usize,
) -> BoxStream<'static, Result<HistoryPage>> {
    stream::unfold(Some(start), move |state| {
        let store = store.clone();
        let project_id = project_id.clone();
        let viewer_id = viewer_id.clone();
        async move {
            let before = state?;
            let page = store
                .list_history(&project_id, &viewer_id, before.as_ref(), page_size)
                .await;
            match page {
                Ok(page) => {
                    let next = page.next_cursor.clone().map(Some);
                    Some((Ok(page), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        }
    })
    .boxed()
}

/// Trims and checks message content.
pub fn prepare_content(content: &str, max_chars: usize) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message content is empty".to_string()));
    }
    if trimmed.chars().count() > max_chars {
        return Err(ChatError::Validation(format!(
            "message content exceeds {} characters",
            max_chars
        )));
    }
    Ok(trimmed.to_string())
}

/// Rooms tracked before idle ones are pruned.
const CLOCK_PRUNE_AT: usize = 1024;
/// A room's last stamp is kept at least this long, so a wall clock that steps
/// back by less than this cannot reorder the room.
const CLOCK_GRACE_MS: i64 = 60_000;

/// Hands out per-room timestamps at millisecond resolution that strictly
/// increase within a room, so `(created_at, id)` order equals append order.
#[derive(Debug, Default)]
pub struct RoomClock {
    last: Mutex<HashMap<String, i64>>,
}

impl RoomClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, project_id: &str) -> DateTime<Utc> {
        let stamp = self.next_at(project_id, Utc::now().timestamp_millis());
        Utc.timestamp_millis_opt(stamp).single().unwrap_or_else(Utc::now)
    }

    fn next_at(&self, project_id: &str, now: i64) -> i64 {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stamp = match last.get(project_id) {
            Some(prev) if *prev >= now => prev + 1,
            _ => now,
        };
        last.insert(project_id.to_string(), stamp);
        // A room whose last stamp is older than the grace window would get
        // `now` anyway, so forgetting it keeps the order.
        if last.len() > CLOCK_PRUNE_AT {
            last.retain(|_, stamped| *stamped + CLOCK_GRACE_MS >= now);
        }
        stamp
    }

    #[cfg(test)]
    fn tracked_rooms(&self) -> usize {
        self.last.lock().map(|last| last.len()).unwrap_or_default()
    }
}

pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_content() {
        assert_eq!(prepare_content("  hello \n", 10).unwrap(), "hello");
        assert!(matches!(prepare_content("   \t", 10), Err(ChatError::Validation(_))));
        assert!(matches!(prepare_content("", 10), Err(ChatError::Validation(_))));
        assert!(matches!(prepare_content("abcdefghijk", 10), Err(ChatError::Validation(_))));
        // Limit counts characters, not bytes.
        assert!(prepare_content("ééééé", 5).is_ok());
    }

    #[test]
    fn test_room_clock_forgets_idle_rooms() {
        let clock = RoomClock::new();
        let start = 1_700_000_000_000;
        for n in 0..CLOCK_PRUNE_AT {
            clock.next_at(&format!("idle-{}", n), start);
        }
        assert_eq!(clock.tracked_rooms(), CLOCK_PRUNE_AT);

        // A room stamped inside the grace window survives the sweep.
        let later = start + CLOCK_GRACE_MS + 1;
        let busy = clock.next_at("busy", later);
        assert_eq!(clock.next_at("late", later), later);
        assert_eq!(clock.tracked_rooms(), 2);
        assert_eq!(clock.next_at("busy", later), busy + 1);
    }

    #[test]
    fn test_room_clock_strictly_increases_per_room() {
        let clock = RoomClock::new();
        let mut prev = clock.next("p1");
        for _ in 0..500 {
            let next = clock.next("p1");
            assert!(next > prev);
            prev = next;
        }
    }
}
