// src/protocol.rs
//
// Event-channel frames. Every frame is `{"event": <name>, "data": <payload>}`.

use actix::Message as ActixMessage;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ErrorCode};
use crate::models::{DeleteScope, Message};
use crate::rooms::ConnectionId;

pub const PROTOCOL_VERSION: u16 = 1;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom { project_id: String },

    #[serde(rename_all = "camelCase")]
    LeaveRoom { project_id: String },

    /// Fire-and-forget. The sender is the authenticated session, `user_id`
    /// is only cross-checked against it.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        project_id: String,
        content: String,
    },

    /// Answered with a `delete_message_ack` carrying the same `request_id`.
    #[serde(rename_all = "camelCase")]
    DeleteMessage {
        request_id: u64,
        message_id: String,
        scope: DeleteScope,
    },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ActixMessage)]
#[rtype(result = "()")]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: ConnectionId,
        protocol_version: u16,
    },

    MessageCreated(Message),

    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: String,
        #[serde(rename = "type")]
        scope: DeleteScope,
        acting_user_id: String,
    },

    DeleteMessageAck(DeleteAck),

    NotificationCount { count: usize },

    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAck {
    pub request_id: u64,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// The updated record on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Message>,
}

impl DeleteAck {
    pub fn ok(request_id: u64, updated: Message) -> Self {
        DeleteAck {
            request_id,
            success: true,
            message: "Message deleted".to_string(),
            code: None,
            data: Some(updated),
        }
    }

    pub fn failed(request_id: u64, err: &ChatError) -> Self {
        DeleteAck {
            request_id,
            success: false,
            message: err.public_message(),
            code: Some(err.code()),
            data: None,
        }
    }
}

impl ServerEvent {
    pub fn error(err: &ChatError) -> Self {
        ServerEvent::Error {
            code: err.code(),
            message: err.public_message(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::MessageCreated(_) => "message_created",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::DeleteMessageAck(_) => "delete_message_ack",
            ServerEvent::NotificationCount { .. } => "notification_count",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frames_parse() {
        let join: ClientEvent =
            serde_json::from_value(json!({ "event": "join_room", "data": { "projectId": "p1" } }))
                .unwrap();
        assert_eq!(join, ClientEvent::JoinRoom { project_id: "p1".into() });

        let send: ClientEvent = serde_json::from_value(json!({
            "event": "send_message",
            "data": { "userId": "x", "projectId": "p1", "content": "hello" }
        }))
        .unwrap();
        assert_eq!(
            send,
            ClientEvent::SendMessage {
                user_id: Some("x".into()),
                project_id: "p1".into(),
                content: "hello".into(),
            }
        );

        let delete: ClientEvent = serde_json::from_value(json!({
            "event": "delete_message",
            "data": { "requestId": 7, "messageId": "m1", "scope": "FOR_ME" }
        }))
        .unwrap();
        assert!(matches!(
            delete,
            ClientEvent::DeleteMessage { request_id: 7, scope: DeleteScope::ForMe, .. }
        ));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let parsed = serde_json::from_value::<ClientEvent>(
            json!({ "event": "edit_message", "data": { "messageId": "m1" } }),
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_message_deleted_payload_shape() {
        let event = ServerEvent::MessageDeleted {
            message_id: "m1".into(),
            scope: DeleteScope::ForEveryone,
            acting_user_id: "x".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "message_deleted",
                "data": { "messageId": "m1", "type": "FOR_EVERYONE", "actingUserId": "x" }
            })
        );
        assert_eq!(event.name(), "message_deleted");
    }

    #[test]
    fn test_failed_ack_carries_code() {
        let ack = DeleteAck::failed(3, &ChatError::Forbidden("not the sender".into()));
        let value = serde_json::to_value(ServerEvent::DeleteMessageAck(ack)).unwrap();
        assert_eq!(value["event"], "delete_message_ack");
        assert_eq!(value["data"]["success"], false);
        assert_eq!(value["data"]["code"], "forbidden");
        assert_eq!(value["data"]["requestId"], 3);
        assert!(value["data"].get("data").is_none());
    }

    #[test]
    fn test_notification_count_frame() {
        let value = serde_json::to_value(ServerEvent::NotificationCount { count: 4 }).unwrap();
        assert_eq!(value, json!({ "event": "notification_count", "data": { "count": 4 } }));
    }
}
