// File: store/mongo.rs

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::TryStreamExt;
use log::{debug, info};
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, IndexModel};
use serde::{Deserialize, Serialize};

use super::{new_message_id, prepare_content, HistoryPage, MessageStore, RoomClock};
use crate::chat_db::MongoDB;
use crate::error::{ChatError, Result};
use crate::models::{DeleteScope, HistoryCursor, Message, SenderProfile};

const MESSAGES: &str = "messages";

/// Storage shape of a message. `created_at` is a native BSON date so the
/// `(project_id, created_at, _id)` index orders it correctly.
#[derive(Debug, Serialize, Deserialize)]
struct MessageDocument {
    #[serde(rename = "_id")]
    id: String,
    project_id: String,
    sender_id: String,
    sender_name: String,
    sender_image_url: Option<String>,
    #[serde(default)]
    is_creator: bool,
    content: Option<String>,
    created_at: BsonDateTime,
    #[serde(default)]
    is_edited: bool,
    #[serde(default)]
    is_deleted_for_everyone: bool,
    #[serde(default)]
    deleted_for: Vec<String>,
}

impl From<&Message> for MessageDocument {
    fn from(m: &Message) -> Self {
        MessageDocument {
            id: m.id.clone(),
            project_id: m.project_id.clone(),
            sender_id: m.sender_id.clone(),
            sender_name: m.sender_name.clone(),
            sender_image_url: m.sender_image_url.clone(),
            is_creator: m.is_creator,
            content: m.content.clone(),
            created_at: to_bson_date(&m.created_at),
            is_edited: m.is_edited,
            is_deleted_for_everyone: m.is_deleted_for_everyone,
            deleted_for: m.deleted_for.iter().cloned().collect(),
        }
    }
}

impl From<MessageDocument> for Message {
    fn from(d: MessageDocument) -> Self {
        let created_at = Utc
            .timestamp_millis_opt(d.created_at.timestamp_millis())
            .single()
            .unwrap_or_default();
        Message {
            id: d.id,
            project_id: d.project_id,
            sender_id: d.sender_id,
            sender_name: d.sender_name,
            sender_image_url: d.sender_image_url,
            is_creator: d.is_creator,
            // Masked content never leaves storage, even if a stale writer left some behind.
            content: if d.is_deleted_for_everyone { None } else { d.content },
            created_at,
            is_edited: d.is_edited,
            is_deleted_for_everyone: d.is_deleted_for_everyone,
            deleted_for: d.deleted_for.into_iter().collect(),
        }
    }
}

fn to_bson_date(at: &DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(at.timestamp_millis())
}

pub struct MongoMessageStore {
    messages: Collection<MessageDocument>,
    clock: RoomClock,
    max_content_chars: usize,
}

impl MongoMessageStore {
    pub fn new(mongodb: &MongoDB, max_content_chars: usize) -> Self {
        MongoMessageStore {
            messages: mongodb.db.collection::<MessageDocument>(MESSAGES),
            clock: RoomClock::new(),
            max_content_chars,
        }
    }

    /// Creates the history index. Safe to call on every start.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "project_id": 1, "created_at": -1, "_id": -1 })
            .build();
        self.messages.create_index(index).await?;
        info!("History index on '{}' is in place", MESSAGES);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MongoMessageStore {
    async fn append(
        &self,
        project_id: &str,
        sender: &SenderProfile,
        content: &str,
    ) -> Result<Message> {
        let content = prepare_content(content, self.max_content_chars)?;
        let message = Message::new(
            new_message_id(),
            project_id,
            sender,
            content,
            self.clock.next(project_id),
        );
        self.messages.insert_one(MessageDocument::from(&message)).await?;
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
        let mut filter = doc! { "project_id": project_id };
        if let Some(cursor) = before {
            let at = to_bson_date(&cursor.created_at);
            filter.insert(
                "$or",
                vec![
                    doc! { "created_at": { "$lt": at } },
                    doc! { "created_at": at, "_id": { "$lt": cursor.id.as_str() } },
                ],
            );
        }

        let mut cursor = self
            .messages
            .find(filter)
            .sort(doc! { "created_at": -1, "_id": -1 })
            .limit((limit + 1) as i64)
            .await?;

        let mut newest_first = Vec::with_capacity(limit + 1);
        while let Some(document) = cursor.try_next().await? {
            newest_first.push(Message::from(document).for_viewer(viewer_id));
        }

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
        self.messages
            .find_one(doc! { "_id": message_id })
            .await?
            .map(Message::from)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))
    }

    async fn mark_deleted(
        &self,
        message_id: &str,
        acting_user_id: &str,
        scope: DeleteScope,
    ) -> Result<Message> {
        match scope {
            DeleteScope::ForMe => {
                // $addToSet keeps concurrent hides from different users intact.
                self.messages
                    .find_one_and_update(
                        doc! { "_id": message_id },
                        doc! { "$addToSet": { "deleted_for": acting_user_id } },
                    )
                    .return_document(ReturnDocument::After)
                    .await?
                    .map(Message::from)
                    .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))
            }
            DeleteScope::ForEveryone => {
                let updated = self
                    .messages
                    .find_one_and_update(
                        doc! {
                            "_id": message_id,
                            "sender_id": acting_user_id,
                            "is_deleted_for_everyone": false,
                        },
                        doc! { "$set": { "is_deleted_for_everyone": true, "content": Bson::Null } },
                    )
                    .return_document(ReturnDocument::After)
                    .await?;
                if let Some(document) = updated {
                    return Ok(Message::from(document));
                }

                // Nothing matched; find out which precondition failed.
                let current = self.get(message_id).await?;
                if current.sender_id != acting_user_id {
                    Err(ChatError::Forbidden(
                        "only the sender can delete a message for everyone".to_string(),
                    ))
                } else {
                    Err(ChatError::AlreadyDeleted)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_conversion_keeps_millis() {
        let sender = SenderProfile {
            user_id: "x".into(),
            name: "Xavier".into(),
            image_url: None,
            is_creator: true,
        };
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let mut msg = Message::new("m1".into(), "p1", &sender, "hi".into(), at);
        msg.hide_for("y");

        let back = Message::from(MessageDocument::from(&msg));
        assert_eq!(back, msg);
    }

    #[test]
    fn test_masked_document_never_exposes_content() {
        let sender = SenderProfile {
            user_id: "x".into(),
            name: "Xavier".into(),
            image_url: None,
            is_creator: false,
        };
        let msg = Message::new("m1".into(), "p1", &sender, "hi".into(), Utc::now());
        let mut document = MessageDocument::from(&msg);
        document.is_deleted_for_everyone = true;
        assert!(Message::from(document).content.is_none());
    }
}
