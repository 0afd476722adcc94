// src/chat_server.rs
//
// Realtime gateway and fan-out engine.
//
// Writes for one room run one at a time: the room's lock is taken before the
// store write and released only after the resulting event has been handed to
// every member, so each room sees a single total order. Rooms do not wait on
// each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use actix::prelude::*;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::directory::ProjectDirectory;
use crate::error::{ChatError, Result};
use crate::models::{DeleteScope, Message as ChatMessage};
use crate::protocol::{ServerEvent, PROTOCOL_VERSION};
use crate::rooms::{ConnectionId, RoomRegistry};
use crate::store::MessageStore;
use crate::unread::{CountUpdate, UnreadCounters};

// ─── ACTOR MESSAGES ───────────────────────────────────────────────────────────

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub connection: ConnectionId,
    pub user_id: String,
    pub addr: Recipient<ServerEvent>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub connection: ConnectionId,
}

#[derive(Message)]
#[rtype(result = "crate::error::Result<()>")]
pub struct JoinRoom {
    pub connection: ConnectionId,
    pub project_id: String,
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct LeaveRoom {
    pub connection: ConnectionId,
    pub project_id: String,
}

#[derive(Message)]
#[rtype(result = "crate::error::Result<ChatMessage>")]
pub struct SendMessage {
    pub connection: ConnectionId,
    pub project_id: String,
    pub content: String,
}

#[derive(Message)]
#[rtype(result = "crate::error::Result<ChatMessage>")]
pub struct DeleteMessage {
    pub connection: ConnectionId,
    pub message_id: String,
    pub scope: DeleteScope,
}

/// Raised by notification producers outside the chat.
#[derive(Message)]
#[rtype(result = "usize")]
pub struct NotificationRaised {
    pub user_id: String,
    pub notification_id: String,
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct RecomputeUnread {
    pub user_id: String,
    pub unread_ids: Vec<String>,
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct MarkNotificationRead {
    pub user_id: String,
    pub notification_id: String,
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct MarkAllNotificationsRead {
    pub user_id: String,
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct GetUnreadCount {
    pub user_id: String,
}

#[derive(Message)]
#[rtype(result = "HashSet<ConnectionId>")]
pub struct RoomMembers {
    pub project_id: String,
}

// ─── ACTOR ────────────────────────────────────────────────────────────────────

/// Authorization lookup of a join that has not resolved yet. Requests the
/// same connection sends after the join await it before checking membership.
type JoinCheck = Shared<BoxFuture<'static, Result<bool>>>;

struct Session {
    user_id: String,
    addr: Recipient<ServerEvent>,
}

pub struct ChatServer {
    sessions: HashMap<ConnectionId, Session>,
    // A user may have several sessions open at once.
    connections_by_user: HashMap<String, HashSet<ConnectionId>>,
    rooms: RoomRegistry,
    pending_joins: HashMap<ConnectionId, HashMap<String, JoinCheck>>,
    room_locks: HashMap<String, Arc<Mutex<()>>>,
    unread: UnreadCounters,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn ProjectDirectory>,
}

impl ChatServer {
    pub fn new(store: Arc<dyn MessageStore>, directory: Arc<dyn ProjectDirectory>) -> Self {
        ChatServer {
            sessions: HashMap::new(),
            connections_by_user: HashMap::new(),
            rooms: RoomRegistry::new(),
            pending_joins: HashMap::new(),
            room_locks: HashMap::new(),
            unread: UnreadCounters::new(),
            store,
            directory,
        }
    }

    fn user_of(&self, connection: ConnectionId) -> Result<String> {
        self.sessions
            .get(&connection)
            .map(|s| s.user_id.clone())
            .ok_or_else(|| ChatError::Transport(format!("connection {} is closed", connection)))
    }

    fn ensure_in_room(&self, connection: ConnectionId, project_id: &str) -> Result<()> {
        if self.rooms.is_member(connection, project_id) {
            Ok(())
        } else {
            Err(ChatError::Forbidden(format!("not a member of room {}", project_id)))
        }
    }

    /// Joins of this connection still waiting on authorization, optionally
    /// narrowed to one room.
    fn joins_in_flight(&self, connection: ConnectionId, project_id: Option<&str>) -> Vec<(String, JoinCheck)> {
        self.pending_joins
            .get(&connection)
            .map(|joins| {
                joins
                    .iter()
                    .filter(|(room, _)| project_id.map_or(true, |p| p == room.as_str()))
                    .map(|(room, check)| (room.clone(), check.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies the outcome of a join's authorization. Both the join itself and
    /// any request queued behind it call this; whichever runs first registers
    /// the membership and the other finds it in place.
    fn settle_join(
        &mut self,
        connection: ConnectionId,
        project_id: &str,
        user_id: &str,
        allowed: Result<bool>,
    ) -> Result<()> {
        let pending = match self.pending_joins.get_mut(&connection) {
            Some(joins) => {
                let removed = joins.remove(project_id).is_some();
                if joins.is_empty() {
                    self.pending_joins.remove(&connection);
                }
                removed
            }
            None => false,
        };
        match allowed {
            Ok(true) if self.sessions.contains_key(&connection) => {
                // A leave that arrived meanwhile removed the pending entry.
                if pending && self.rooms.join(connection, project_id) {
                    debug!("{} joined room {}", connection, project_id);
                }
                Ok(())
            }
            Ok(true) => Err(ChatError::Transport(format!(
                "connection {} closed while joining",
                connection
            ))),
            Ok(false) => Err(ChatError::Forbidden(format!(
                "user {} is not a member of project {}",
                user_id, project_id
            ))),
            Err(e) => Err(e),
        }
    }

    fn room_lock(&mut self, project_id: &str) -> Arc<Mutex<()>> {
        self.room_locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forgets the lock of a room nobody listens to and nobody is writing to.
    fn prune_room_lock(&mut self, project_id: &str) {
        let idle = self.rooms.members_of(project_id).is_empty()
            && self
                .room_locks
                .get(project_id)
                .map_or(false, |lock| Arc::strong_count(lock) == 1);
        if idle {
            self.room_locks.remove(project_id);
        }
    }

    /// Hands an event to each target's mailbox without waiting on any of them.
    /// Closed sessions are skipped; reconnecting clients recover through history.
    fn deliver<I>(&self, targets: I, event: &ServerEvent)
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        for connection in targets {
            match self.sessions.get(&connection) {
                Some(session) if session.addr.connected() => {
                    session.addr.do_send(event.clone());
                }
                _ => debug!("Skipping {} for closed connection {}", event.name(), connection),
            }
        }
    }

    fn push_count(&self, user_id: &str, update: CountUpdate) -> usize {
        if update.changed {
            let targets = self
                .connections_by_user
                .get(user_id)
                .cloned()
                .unwrap_or_default();
            debug!("Unread count for {} is now {}", user_id, update.count);
            self.deliver(targets, &ServerEvent::NotificationCount { count: update.count });
        }
        update.count
    }

    /// Who hears about a delete: everyone in the room for a global delete, only
    /// the actor's own other sessions for a personal one. Never the origin.
    fn delete_targets(
        &self,
        origin: ConnectionId,
        message: &ChatMessage,
        scope: DeleteScope,
        acting_user_id: &str,
    ) -> Vec<ConnectionId> {
        let members = self.rooms.members_of(&message.project_id);
        match scope {
            DeleteScope::ForEveryone => members.into_iter().filter(|c| *c != origin).collect(),
            DeleteScope::ForMe => {
                let own = self.connections_by_user.get(acting_user_id);
                members
                    .into_iter()
                    .filter(|c| *c != origin && own.map_or(false, |set| set.contains(c)))
                    .collect()
            }
        }
    }
}

impl Actor for ChatServer {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Chat server started");
    }
}

impl Handler<Connect> for ChatServer {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) {
        info!("User {} connected (WS) as {}", msg.user_id, msg.connection);
        self.connections_by_user
            .entry(msg.user_id.clone())
            .or_default()
            .insert(msg.connection);
        msg.addr.do_send(ServerEvent::Connected {
            connection_id: msg.connection,
            protocol_version: PROTOCOL_VERSION,
        });
        self.sessions.insert(
            msg.connection,
            Session {
                user_id: msg.user_id,
                addr: msg.addr,
            },
        );
    }
}

impl Handler<Disconnect> for ChatServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) {
        let left = self.rooms.leave_all(msg.connection);
        self.pending_joins.remove(&msg.connection);
        if let Some(session) = self.sessions.remove(&msg.connection) {
            info!(
                "User {} disconnected (WS) from {} room(s)",
                session.user_id,
                left.len()
            );
            if let Some(connections) = self.connections_by_user.get_mut(&session.user_id) {
                connections.remove(&msg.connection);
                if connections.is_empty() {
                    self.connections_by_user.remove(&session.user_id);
                }
            }
        }
        for project_id in &left {
            self.prune_room_lock(project_id);
        }
    }
}

impl Handler<JoinRoom> for ChatServer {
    type Result = ResponseActFuture<Self, Result<()>>;

    fn handle(&mut self, msg: JoinRoom, _: &mut Context<Self>) -> Self::Result {
        let user_id = match self.user_of(msg.connection) {
            Ok(user_id) => user_id,
            Err(e) => return Box::pin(fut::ready(Err(e))),
        };
        let directory = self.directory.clone();
        let check_user = user_id.clone();
        let check_project = msg.project_id.clone();

        let check: JoinCheck = async move { directory.is_member(&check_user, &check_project).await }
            .boxed()
            .shared();
        self.pending_joins
            .entry(msg.connection)
            .or_default()
            .insert(msg.project_id.clone(), check.clone());

        Box::pin(check.into_actor(self).map(move |allowed, act, _ctx| {
            let result = act.settle_join(msg.connection, &msg.project_id, &user_id, allowed);
            if let Err(e) = &result {
                warn!("Join of room {} by {} rejected: {}", msg.project_id, user_id, e);
                act.deliver([msg.connection], &ServerEvent::error(e));
            }
            result
        }))
    }
}

impl Handler<LeaveRoom> for ChatServer {
    type Result = bool;

    fn handle(&mut self, msg: LeaveRoom, _: &mut Context<Self>) -> bool {
        if let Some(joins) = self.pending_joins.get_mut(&msg.connection) {
            joins.remove(&msg.project_id);
            if joins.is_empty() {
                self.pending_joins.remove(&msg.connection);
            }
        }
        let left = self.rooms.leave(msg.connection, &msg.project_id);
        self.prune_room_lock(&msg.project_id);
        left
    }
}

impl Handler<SendMessage> for ChatServer {
    type Result = ResponseActFuture<Self, Result<ChatMessage>>;

    fn handle(&mut self, msg: SendMessage, _: &mut Context<Self>) -> Self::Result {
        let user_id = match self.user_of(msg.connection) {
            Ok(user_id) => user_id,
            Err(e) => return Box::pin(fut::ready(Err(e))),
        };
        let connection = msg.connection;
        let project_id = msg.project_id;
        let content = msg.content;

        let joining = self.joins_in_flight(connection, Some(&project_id));
        let joined = async move {
            let mut settled = Vec::with_capacity(joining.len());
            for (room, check) in joining {
                settled.push((room, check.await));
            }
            settled
        };

        Box::pin(
            joined
                .into_actor(self)
                .then(move |settled, act, _ctx| {
                    for (room, allowed) in settled {
                        let _ = act.settle_join(connection, &room, &user_id, allowed);
                    }
                    let target = act
                        .ensure_in_room(connection, &project_id)
                        .map(|_| act.room_lock(&project_id));
                    let store = act.store.clone();
                    let directory = act.directory.clone();
                    async move {
                        let lock = match target {
                            Ok(lock) => lock,
                            Err(e) => return (None, Err(e)),
                        };
                        let sender = match directory.sender_profile(&user_id, &project_id).await {
                            Ok(sender) => sender,
                            Err(e) => return (None, Err(e)),
                        };
                        let guard: OwnedMutexGuard<()> = lock.lock_owned().await;
                        let stored = store.append(&project_id, &sender, &content).await;
                        (Some(guard), stored)
                    }
                    .into_actor(act)
                })
                .map(|(guard, stored), act, _ctx| {
                    if let Ok(message) = &stored {
                        let members = act.rooms.members_of(&message.project_id);
                        debug!(
                            "Fanning out message {} to {} connection(s) in {}",
                            message.id,
                            members.len(),
                            message.project_id
                        );
                        act.deliver(members, &ServerEvent::MessageCreated(message.clone()));
                    }
                    drop(guard);
                    stored
                }),
        )
    }
}

impl Handler<DeleteMessage> for ChatServer {
    type Result = ResponseActFuture<Self, Result<ChatMessage>>;

    fn handle(&mut self, msg: DeleteMessage, _: &mut Context<Self>) -> Self::Result {
        let user_id = match self.user_of(msg.connection) {
            Ok(user_id) => user_id,
            Err(e) => return Box::pin(fut::ready(Err(e))),
        };
        let store = self.store.clone();
        let lookup_id = msg.message_id.clone();
        // The room is unknown until the message is loaded, so every join
        // this connection still has in flight is settled first.
        let joining = self.joins_in_flight(msg.connection, None);
        let lookup = async move {
            let mut settled = Vec::with_capacity(joining.len());
            for (room, check) in joining {
                settled.push((room, check.await));
            }
            (settled, store.get(&lookup_id).await)
        };

        let connection = msg.connection;
        let scope = msg.scope;
        let actor_id = user_id.clone();

        Box::pin(
            lookup
                .into_actor(self)
                .then(move |(settled, found), act, _ctx| {
                    for (room, allowed) in settled {
                        let _ = act.settle_join(connection, &room, &user_id, allowed);
                    }
                    let target = found.and_then(|message| {
                        act.ensure_in_room(connection, &message.project_id)?;
                        Ok(act.room_lock(&message.project_id))
                    });
                    let store = act.store.clone();
                    let message_id = msg.message_id;
                    async move {
                        match target {
                            Ok(lock) => {
                                let guard = lock.lock_owned().await;
                                let updated =
                                    store.mark_deleted(&message_id, &user_id, scope).await;
                                (Some(guard), updated)
                            }
                            Err(e) => (None, Err(e)),
                        }
                    }
                    .into_actor(act)
                })
                .map(move |(guard, updated), act, _ctx| {
                    match &updated {
                        Ok(message) => {
                            let targets = act.delete_targets(connection, message, scope, &actor_id);
                            act.deliver(
                                targets,
                                &ServerEvent::MessageDeleted {
                                    message_id: message.id.clone(),
                                    scope,
                                    acting_user_id: actor_id.clone(),
                                },
                            );
                        }
                        // Rejections go back to the caller only.
                        Err(e) => warn!("Delete by {} rejected: {}", actor_id, e),
                    }
                    drop(guard);
                    updated
                }),
        )
    }
}

impl Handler<NotificationRaised> for ChatServer {
    type Result = usize;

    fn handle(&mut self, msg: NotificationRaised, _: &mut Context<Self>) -> usize {
        let update = self.unread.increment(&msg.user_id, &msg.notification_id);
        self.push_count(&msg.user_id, update)
    }
}

impl Handler<RecomputeUnread> for ChatServer {
    type Result = usize;

    fn handle(&mut self, msg: RecomputeUnread, _: &mut Context<Self>) -> usize {
        let update = self.unread.recompute(&msg.user_id, msg.unread_ids);
        self.push_count(&msg.user_id, update)
    }
}

impl Handler<MarkNotificationRead> for ChatServer {
    type Result = usize;

    fn handle(&mut self, msg: MarkNotificationRead, _: &mut Context<Self>) -> usize {
        let update = self.unread.mark_read(&msg.user_id, &msg.notification_id);
        self.push_count(&msg.user_id, update)
    }
}

impl Handler<MarkAllNotificationsRead> for ChatServer {
    type Result = usize;

    fn handle(&mut self, msg: MarkAllNotificationsRead, _: &mut Context<Self>) -> usize {
        let update = self.unread.mark_all_read(&msg.user_id);
        self.push_count(&msg.user_id, update)
    }
}

impl Handler<GetUnreadCount> for ChatServer {
    type Result = usize;

    fn handle(&mut self, msg: GetUnreadCount, _: &mut Context<Self>) -> usize {
        self.unread.count(&msg.user_id)
    }
}

impl Handler<RoomMembers> for ChatServer {
    type Result = MessageResult<RoomMembers>;

    fn handle(&mut self, msg: RoomMembers, _: &mut Context<Self>) -> Self::Result {
        MessageResult(self.rooms.members_of(&msg.project_id))
    }
}
