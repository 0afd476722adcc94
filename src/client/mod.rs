//! Client-side reconciliation.
//!
//! [`ChatClient`] turns the server's event stream, history pages and the
//! viewer's own delete intents into one ordered list per project. It is
//! transport-agnostic: callers feed it decoded [`ServerEvent`]s and send the
//! [`ClientEvent`]s it hands back. All state belongs to one connection; a new
//! connection starts from a fresh client or from [`ChatClient::on_disconnect`].

use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};

use crate::error::{ChatError, ErrorCode, Result};
use crate::models::{DeleteScope, Message};
use crate::protocol::{ClientEvent, DeleteAck, ServerEvent};
use crate::rooms::ConnectionId;

pub mod timeline;

pub use timeline::{PendingState, ProjectTimeline, RenderedMessage};

#[derive(Debug, Clone)]
struct PendingDelete {
    project_id: String,
    message_id: String,
    scope: DeleteScope,
}

/// A delete the server did not accept. The local mask has already been dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub request_id: u64,
    pub project_id: String,
    pub message_id: String,
    pub scope: DeleteScope,
    pub code: ErrorCode,
    pub message: String,
}

impl DeleteFailure {
    /// Worth offering a retry, as opposed to a refusal.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// What handling one server event did to the client's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    Connected(ConnectionId),
    TimelineChanged { project_id: String },
    DeleteConfirmed { request_id: u64, project_id: String },
    DeleteFailed(DeleteFailure),
    UnreadCount(usize),
    ServerError { code: ErrorCode, message: String },
    Unchanged,
}

#[derive(Debug)]
pub struct ChatClient {
    viewer_id: String,
    connection_id: Option<ConnectionId>,
    joined: BTreeSet<String>,
    timelines: HashMap<String, ProjectTimeline>,
    pending: HashMap<u64, PendingDelete>,
    next_request_id: u64,
    unread_count: usize,
}

impl ChatClient {
    pub fn new(viewer_id: &str) -> Self {
        ChatClient {
            viewer_id: viewer_id.to_string(),
            connection_id: None,
            joined: BTreeSet::new(),
            timelines: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
            unread_count: 0,
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn unread_count(&self) -> usize {
        self.unread_count
    }

    pub fn timeline(&self, project_id: &str) -> Option<&ProjectTimeline> {
        self.timelines.get(project_id)
    }

    pub fn joined_rooms(&self) -> impl Iterator<Item = &str> {
        self.joined.iter().map(String::as_str)
    }

    pub fn join(&mut self, project_id: &str) -> ClientEvent {
        self.joined.insert(project_id.to_string());
        let viewer_id = &self.viewer_id;
        self.timelines
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectTimeline::new(project_id, viewer_id));
        ClientEvent::JoinRoom {
            project_id: project_id.to_string(),
        }
    }

    /// Stops live delivery. The timeline is kept so a later join resumes it.
    pub fn leave(&mut self, project_id: &str) -> ClientEvent {
        self.joined.remove(project_id);
        ClientEvent::LeaveRoom {
            project_id: project_id.to_string(),
        }
    }

    /// Nothing is shown until the server echoes the message back.
    pub fn send(&self, project_id: &str, content: &str) -> ClientEvent {
        ClientEvent::SendMessage {
            user_id: Some(self.viewer_id.clone()),
            project_id: project_id.to_string(),
            content: content.to_string(),
        }
    }

    /// Applies the delete locally and returns the frame to send. The mask is
    /// confirmed or rolled back by the matching `delete_message_ack`.
    pub fn delete(&mut self, project_id: &str, message_id: &str, scope: DeleteScope) -> Result<ClientEvent> {
        let timeline = self
            .timelines
            .get_mut(project_id)
            .ok_or_else(|| ChatError::NotFound(format!("project {} is not open", project_id)))?;
        let request_id = self.next_request_id;
        timeline.begin_delete(message_id, scope, request_id)?;
        self.next_request_id += 1;
        self.pending.insert(
            request_id,
            PendingDelete {
                project_id: project_id.to_string(),
                message_id: message_id.to_string(),
                scope,
            },
        );
        Ok(ClientEvent::DeleteMessage {
            request_id,
            message_id: message_id.to_string(),
            scope,
        })
    }

    pub fn merge_history<I>(&mut self, project_id: &str, page: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let viewer_id = &self.viewer_id;
        self.timelines
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectTimeline::new(project_id, viewer_id))
            .merge_history(page)
    }

    pub fn handle(&mut self, event: ServerEvent) -> ClientUpdate {
        match event {
            ServerEvent::Connected { connection_id, .. } => {
                self.connection_id = Some(connection_id);
                ClientUpdate::Connected(connection_id)
            }
            ServerEvent::MessageCreated(message) => {
                let project_id = message.project_id.clone();
                match self
                    .timelines
                    .get_mut(&project_id)
                    .map(|timeline| timeline.apply_created(message))
                {
                    Some(true) => ClientUpdate::TimelineChanged { project_id },
                    Some(false) => ClientUpdate::Unchanged,
                    None => {
                        debug!("Message for unopened project {}", project_id);
                        ClientUpdate::Unchanged
                    }
                }
            }
            ServerEvent::MessageDeleted {
                message_id,
                scope,
                acting_user_id,
            } => {
                let changed = self.timelines.iter_mut().find_map(|(project_id, timeline)| {
                    timeline
                        .apply_deleted(&message_id, scope, &acting_user_id)
                        .then(|| project_id.clone())
                });
                match changed {
                    Some(project_id) => ClientUpdate::TimelineChanged { project_id },
                    None => ClientUpdate::Unchanged,
                }
            }
            ServerEvent::DeleteMessageAck(ack) => self.on_delete_ack(ack),
            ServerEvent::NotificationCount { count } => {
                self.unread_count = count;
                ClientUpdate::UnreadCount(count)
            }
            ServerEvent::Error { code, message } => {
                warn!("Server error {:?}: {}", code, message);
                ClientUpdate::ServerError { code, message }
            }
        }
    }

    fn on_delete_ack(&mut self, ack: DeleteAck) -> ClientUpdate {
        let Some(pending) = self.pending.remove(&ack.request_id) else {
            debug!("Ack for unknown delete request {}", ack.request_id);
            return ClientUpdate::Unchanged;
        };
        let Some(timeline) = self.timelines.get_mut(&pending.project_id) else {
            return ClientUpdate::Unchanged;
        };

        // A repeated global delete means the message is already in the state we asked for.
        let confirmed = ack.success || ack.code == Some(ErrorCode::AlreadyDeleted);
        if confirmed {
            timeline.confirm_delete(ack.request_id, ack.data.as_ref());
            return ClientUpdate::DeleteConfirmed {
                request_id: ack.request_id,
                project_id: pending.project_id,
            };
        }

        timeline.roll_back_delete(ack.request_id);
        ClientUpdate::DeleteFailed(DeleteFailure {
            request_id: ack.request_id,
            project_id: pending.project_id,
            message_id: pending.message_id,
            scope: pending.scope,
            code: ack.code.unwrap_or(ErrorCode::Internal),
            message: ack.message,
        })
    }

    /// The connection dropped. Unanswered deletes are rolled back, since the
    /// server may never have seen them.
    pub fn on_disconnect(&mut self) -> Vec<DeleteFailure> {
        self.connection_id = None;
        let lost = ChatError::Transport("connection closed before the server answered".to_string());
        let mut failures: Vec<DeleteFailure> = self
            .pending
            .drain()
            .map(|(request_id, pending)| {
                if let Some(timeline) = self.timelines.get_mut(&pending.project_id) {
                    timeline.roll_back_delete(request_id);
                }
                DeleteFailure {
                    request_id,
                    project_id: pending.project_id,
                    message_id: pending.message_id,
                    scope: pending.scope,
                    code: lost.code(),
                    message: lost.public_message(),
                }
            })
            .collect();
        failures.sort_by_key(|f| f.request_id);
        failures
    }

    /// Frames to send on a fresh connection to resume every joined room.
    /// Follow each with a history fetch and [`ChatClient::merge_history`].
    pub fn rejoin(&self) -> Vec<ClientEvent> {
        self.joined
            .iter()
            .map(|project_id| ClientEvent::JoinRoom {
                project_id: project_id.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderProfile;
    use chrono::{TimeZone, Utc};

    fn msg(n: i64, sender: &str) -> Message {
        let profile = SenderProfile {
            user_id: sender.to_string(),
            name: sender.to_uppercase(),
            image_url: None,
            is_creator: false,
        };
        Message::new(
            format!("m{}", n),
            "p1",
            &profile,
            format!("message {}", n),
            Utc.timestamp_millis_opt(1_700_000_000_000 + n).unwrap(),
        )
    }

    fn request_id(event: &ClientEvent) -> u64 {
        match event {
            ClientEvent::DeleteMessage { request_id, .. } => *request_id,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_join_and_rejoin() {
        let mut client = ChatClient::new("x");
        assert_eq!(client.join("p1"), ClientEvent::JoinRoom { project_id: "p1".into() });
        client.join("p2");
        client.leave("p2");
        assert_eq!(client.rejoin(), vec![ClientEvent::JoinRoom { project_id: "p1".into() }]);
        assert!(client.timeline("p2").is_some());
    }

    #[test]
    fn test_live_events_update_timeline() {
        let mut client = ChatClient::new("y");
        client.join("p1");
        let update = client.handle(ServerEvent::MessageCreated(msg(1, "x")));
        assert_eq!(update, ClientUpdate::TimelineChanged { project_id: "p1".into() });
        assert_eq!(client.handle(ServerEvent::MessageCreated(msg(1, "x"))), ClientUpdate::Unchanged);

        client.handle(ServerEvent::MessageDeleted {
            message_id: "m1".into(),
            scope: DeleteScope::ForEveryone,
            acting_user_id: "x".into(),
        });
        let current = client.timeline("p1").unwrap().get("m1").unwrap();
        assert!(current.is_deleted_for_everyone);
        assert_eq!(current.content, None);
    }

    #[test]
    fn test_ack_success_confirms() {
        let mut client = ChatClient::new("x");
        client.join("p1");
        client.handle(ServerEvent::MessageCreated(msg(1, "x")));
        let frame = client.delete("p1", "m1", DeleteScope::ForEveryone).unwrap();
        let id = request_id(&frame);

        let mut server_copy = msg(1, "x");
        server_copy.mask_for_everyone();
        let update = client.handle(ServerEvent::DeleteMessageAck(DeleteAck::ok(id, server_copy)));
        assert_eq!(update, ClientUpdate::DeleteConfirmed { request_id: id, project_id: "p1".into() });
        assert_eq!(client.timeline("p1").unwrap().pending_state("m1"), None);
        assert!(client.timeline("p1").unwrap().get("m1").unwrap().is_deleted_for_everyone);
    }

    #[test]
    fn test_already_deleted_counts_as_confirmation() {
        let mut client = ChatClient::new("x");
        client.join("p1");
        client.handle(ServerEvent::MessageCreated(msg(1, "x")));
        let id = request_id(&client.delete("p1", "m1", DeleteScope::ForEveryone).unwrap());

        let ack = DeleteAck::failed(id, &ChatError::AlreadyDeleted);
        assert!(matches!(client.handle(ServerEvent::DeleteMessageAck(ack)), ClientUpdate::DeleteConfirmed { .. }));
        assert!(client.timeline("p1").unwrap().get("m1").unwrap().is_deleted_for_everyone);
    }

    #[test]
    fn test_rejected_delete_rolls_back() {
        let mut client = ChatClient::new("y");
        client.join("p1");
        client.handle(ServerEvent::MessageCreated(msg(1, "x")));
        let id = request_id(&client.delete("p1", "m1", DeleteScope::ForMe).unwrap());
        assert!(client.timeline("p1").unwrap().render().is_empty());

        let ack = DeleteAck::failed(id, &ChatError::Unavailable("write conflict".into()));
        match client.handle(ServerEvent::DeleteMessageAck(ack)) {
            ClientUpdate::DeleteFailed(failure) => {
                assert_eq!(failure.code, ErrorCode::Unavailable);
                assert!(failure.is_retryable());
                assert_eq!(failure.message_id, "m1");
            }
            other => panic!("unexpected update {:?}", other),
        }
        assert_eq!(client.timeline("p1").unwrap().render().len(), 1);
    }

    #[test]
    fn test_forbidden_is_not_retryable() {
        let failure = DeleteFailure {
            request_id: 1,
            project_id: "p1".into(),
            message_id: "m1".into(),
            scope: DeleteScope::ForEveryone,
            code: ErrorCode::Forbidden,
            message: "forbidden".into(),
        };
        assert!(!failure.is_retryable());
    }

    #[test]
    fn test_disconnect_rolls_back_pending() {
        let mut client = ChatClient::new("y");
        client.join("p1");
        client.handle(ServerEvent::MessageCreated(msg(1, "x")));
        client.handle(ServerEvent::MessageCreated(msg(2, "x")));
        client.delete("p1", "m1", DeleteScope::ForMe).unwrap();
        client.delete("p1", "m2", DeleteScope::ForMe).unwrap();

        let failures = client.on_disconnect();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.code == ErrorCode::Transport && f.is_retryable()));
        assert_eq!(client.timeline("p1").unwrap().render().len(), 2);
        assert_eq!(client.connection_id(), None);
    }

    #[test]
    fn test_unread_count_tracks_pushes() {
        let mut client = ChatClient::new("y");
        assert_eq!(client.handle(ServerEvent::NotificationCount { count: 3 }), ClientUpdate::UnreadCount(3));
        assert_eq!(client.unread_count(), 3);
    }
}
