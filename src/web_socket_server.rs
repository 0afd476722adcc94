use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, Error, HttpMessage, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::verify_token;
use crate::chat_server::{
    ChatServer, Connect, DeleteMessage, Disconnect, JoinRoom, LeaveRoom, SendMessage,
};
use crate::error::ChatError;
use crate::protocol::{ClientEvent, DeleteAck, ServerEvent};
use crate::rooms::ConnectionId;
//web_socket_server.rs

/// One WebSocket connection. Everything it receives from the client is
/// forwarded to the [`ChatServer`]; everything the server fans out to it is
/// written back as a JSON text frame.
pub struct WebSocketConnection {
    pub id: ConnectionId,
    pub user_id: String,
    pub hb: Instant,
    pub addr: Addr<ChatServer>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl WebSocketConnection {
    pub fn new(
        user_id: String,
        addr: Addr<ChatServer>,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        WebSocketConnection {
            id: ConnectionId::new(),
            user_id,
            hb: Instant::now(),
            addr,
            heartbeat_interval,
            client_timeout,
        }
    }

    pub fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                warn!("WebSocket client {} heartbeat failed, disconnecting.", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_event(&self, event: &ServerEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(event) {
            Ok(text) => ctx.text(text),
            Err(e) => warn!("Failed to encode {} for {}: {}", event.name(), self.id, e),
        }
    }

    fn handle_event(&mut self, event: ClientEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            ClientEvent::JoinRoom { project_id } => {
                // Fire-and-forget; a rejection comes back as an `error` frame.
                self.addr.do_send(JoinRoom {
                    connection: self.id,
                    project_id,
                });
            }
            ClientEvent::LeaveRoom { project_id } => {
                self.addr.do_send(LeaveRoom {
                    connection: self.id,
                    project_id,
                });
            }
            ClientEvent::SendMessage {
                user_id,
                project_id,
                content,
            } => {
                if let Some(claimed) = user_id.filter(|claimed| claimed != &self.user_id) {
                    warn!(
                        "Dropping message from {}: payload claims user {}",
                        self.user_id, claimed
                    );
                    return;
                }
                let user_id = self.user_id.clone();
                self.addr
                    .send(SendMessage {
                        connection: self.id,
                        project_id,
                        content,
                    })
                    .into_actor(self)
                    .then(move |res, _act, _ctx| {
                        // Send failures are not surfaced to the chat stream.
                        match res {
                            Ok(Ok(message)) => debug!("Message {} accepted", message.id),
                            Ok(Err(e)) => debug!("Message from {} dropped: {}", user_id, e),
                            Err(e) => warn!("Chat server unavailable: {}", e),
                        }
                        fut::ready(())
                    })
                    .spawn(ctx);
            }
            ClientEvent::DeleteMessage {
                request_id,
                message_id,
                scope,
            } => {
                self.addr
                    .send(DeleteMessage {
                        connection: self.id,
                        message_id,
                        scope,
                    })
                    .into_actor(self)
                    .then(move |res, act, ctx| {
                        let ack = match res {
                            Ok(Ok(updated)) => DeleteAck::ok(request_id, updated),
                            Ok(Err(e)) => DeleteAck::failed(request_id, &e),
                            Err(e) => DeleteAck::failed(
                                request_id,
                                &ChatError::Transport(e.to_string()),
                            ),
                        };
                        act.send_event(&ServerEvent::DeleteMessageAck(ack), ctx);
                        fut::ready(())
                    })
                    .spawn(ctx);
            }
        }
    }
}

impl Actor for WebSocketConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        // Start the heartbeat process
        self.hb(ctx);

        // Register the session with the chat server
        self.addr
            .send(Connect {
                connection: self.id,
                user_id: self.user_id.clone(),
                addr: ctx.address().recipient(),
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                if res.is_err() {
                    warn!("Failed to register {} with chat server.", act.id);
                    ctx.stop();
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        self.addr.do_send(Disconnect { connection: self.id });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocketConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => self.handle_event(event, ctx),
                Err(e) => warn!("Failed to parse frame from {}: {}", self.id, e),
            },
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!("WebSocket error on {}: {}", self.id, e);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<ServerEvent> for WebSocketConnection {
    type Result = ();

    fn handle(&mut self, event: ServerEvent, ctx: &mut ws::WebsocketContext<Self>) {
        debug!("Sending {} to {}", event.name(), self.id);
        self.send_event(&event, ctx);
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws
/// Upgrades to a chat session. Identity comes from the bearer header (via the
/// auth middleware) or, for browsers, from `?token=`.
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    params: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let from_header = req.extensions().get::<String>().cloned();
    let user_id = match (from_header, params.token.as_deref()) {
        (Some(user_id), _) => user_id,
        (None, Some(token)) => verify_token(token, &data.config.jwt_secret)
            .map_err(|_| ChatError::Unauthorized)?,
        (None, None) => return Err(ChatError::Unauthorized.into()),
    };
    info!("Opening chat session for user {}", user_id);

    ws::start(
        WebSocketConnection::new(
            user_id,
            data.chat_server.clone(),
            data.config.heartbeat_interval,
            data.config.client_timeout,
        ),
        &req,
        stream,
    )
}
