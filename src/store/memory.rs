// File: store/memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use super::{new_message_id, prepare_content, HistoryPage, MessageStore, RoomClock};
use crate::error::{ChatError, Result};
use crate::models::{DeleteScope, HistoryCursor, Message, SenderProfile};

#[derive(Default)]
struct Inner {
    messages: HashMap<String, Message>,
    // project_id -> message ids in append order
    rooms: HashMap<String, Vec<String>>,
}

/// Process-local message store. Used when no MongoDB is configured and in tests.
pub struct InMemoryMessageStore {
    inner: RwLock<Inner>,
    clock: RoomClock,
    max_content_chars: usize,
}

impl InMemoryMessageStore {
    pub fn new(max_content_chars: usize) -> Self {
        InMemoryMessageStore {
            inner: RwLock::new(Inner::default()),
            clock: RoomClock::new(),
            max_content_chars,
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        project_id: &str,
        sender: &SenderProfile,
        content: &str,
    ) -> Result<Message> {
        let content = prepare_content(content, self.max_content_chars)?;
        let mut inner = self.inner.write().await;
        // Stamp under the write lock so room order and timestamp order agree.
        let message = Message::new(
            new_message_id(),
            project_id,
            sender,
            content,
            self.clock.next(project_id),
        );
        inner
            .rooms
            .entry(project_id.to_string())
            .or_default()
            .push(message.id.clone());
        inner.messages.insert(message.id.clone(), message.clone());
        debug!("Stored message {} in project {}", message.id, project_id);
        Ok(message)
    }

    async fn list_history(
        &self,
        project_id: &str,
        viewer_id: &str,
        before: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.rooms.get(project_id) else {
            return Ok(HistoryPage::default());
        };

        let mut newest_first: Vec<Message> = ids
            .iter()
            .rev()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| before.map_or(true, |c| c.admits(&m.created_at, &m.id)))
            .take(limit + 1)
            .map(|m| m.clone().for_viewer(viewer_id))
            .collect();

        let has_more = newest_first.len() > limit;
        newest_first.truncate(limit);
        newest_first.reverse();
        let next_cursor = if has_more {
            newest_first.first().map(Message::cursor)
        } else {
            None
        };
        Ok(HistoryPage {
            messages: newest_first,
            next_cursor,
        })
    }

    async fn get(&self, message_id: &str) -> Result<Message> {
        let inner = self.inner.read().await;
        inner
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))
    }

    async fn mark_deleted(
        &self,
        message_id: &str,
        acting_user_id: &str,
        scope: DeleteScope,
    ) -> Result<Message> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

        if scope == DeleteScope::ForEveryone {
            if message.sender_id != acting_user_id {
                return Err(ChatError::Forbidden(
                    "only the sender can delete a message for everyone".to_string(),
                ));
            }
            if message.is_deleted_for_everyone {
                return Err(ChatError::AlreadyDeleted);
            }
        }
        message.apply_delete(scope, acting_user_id);
        Ok(message.clone())
    }
}
