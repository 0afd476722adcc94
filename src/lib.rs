// src/lib.rs

pub mod app_state;
pub mod auth;
pub mod chat;
pub mod chat_db;
pub mod chat_server;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod models;
pub mod notifications;
pub mod protocol;
pub mod rooms;
pub mod store;
pub mod unread;
pub mod web_socket_server;

use actix_web::{web, HttpResponse};

pub use crate::app_state::AppState;
pub use crate::config::Config;
pub use crate::error::{ChatError, Result};

/// Route table shared by the binary and the HTTP tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(|| async { HttpResponse::Ok().body("ok") }))
        // HISTORY
        .service(
            web::scope("/projects")
                .route("/{project_id}/messages", web::get().to(chat::get_messages)),
        )
        // UNREAD NOTIFICATIONS
        .service(
            web::scope("/notifications")
                .route("/count", web::get().to(notifications::get_unread_count))
                .route("/read-all", web::post().to(notifications::mark_all_read))
                .route("/{notification_id}/read", web::post().to(notifications::mark_read)),
        )
        .route(
            "/internal/notifications",
            web::post().to(notifications::raise_notification),
        )
        // WEBSOCKET route for real-time
        .service(web::resource("/ws").route(web::get().to(web_socket_server::ws_index)));
}
