// File: notifications.rs
//
// Unread badge endpoints. Every change is also pushed to the user's open
// sessions as a `notification_count` frame by the chat server.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::chat_server::{
    GetUnreadCount, MarkAllNotificationsRead, MarkNotificationRead, NotificationRaised,
};
use crate::config::Config;
use crate::error::{ChatError, Result};

/// Header carrying the producers' shared secret on internal routes.
pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub success: bool,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseRequest {
    pub user_id: String,
    pub notification_id: String,
}

fn counted(count: usize) -> HttpResponse {
    HttpResponse::Ok().json(CountResponse {
        success: true,
        count,
    })
}

/// Admits only notification producers. A user's bearer token is not enough.
fn require_producer(req: &HttpRequest, config: &Config) -> Result<()> {
    let Some(expected) = config.internal_token.as_deref() else {
        return Err(ChatError::Forbidden("internal notifications are disabled".to_string()));
    };
    let presented = req
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ChatError::Forbidden("caller is not a notification producer".to_string())),
    }
}

fn mailbox(e: actix::MailboxError) -> ChatError {
    ChatError::Unavailable(format!("chat server mailbox: {}", e))
}

/// GET /notifications/count
pub async fn get_unread_count(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse> {
    let user_id = current_user(&req)?;
    let count = data
        .chat_server
        .send(GetUnreadCount { user_id })
        .await
        .map_err(mailbox)?;
    Ok(counted(count))
}

/// POST /notifications/{notification_id}/read
pub async fn mark_read(
    req: HttpRequest,
    data: web::Data<AppState>,
    notification_id: web::Path<String>,
) -> Result<HttpResponse> {
    let user_id = current_user(&req)?;
    let count = data
        .chat_server
        .send(MarkNotificationRead {
            user_id,
            notification_id: notification_id.into_inner(),
        })
        .await
        .map_err(mailbox)?;
    Ok(counted(count))
}

/// POST /notifications/read-all
pub async fn mark_all_read(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse> {
    let user_id = current_user(&req)?;
    let count = data
        .chat_server
        .send(MarkAllNotificationsRead { user_id })
        .await
        .map_err(mailbox)?;
    Ok(counted(count))
}

/// POST /internal/notifications
/// Called by notification producers, which authenticate with the
/// `X-Internal-Token` header. Raising the same id twice counts once.
pub async fn raise_notification(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: web::Json<RaiseRequest>,
) -> Result<HttpResponse> {
    require_producer(&req, &data.config)?;
    let RaiseRequest {
        user_id,
        notification_id,
    } = body.into_inner();
    if notification_id.trim().is_empty() {
        return Err(ChatError::Validation("notificationId must not be empty".to_string()));
    }
    let count = data
        .chat_server
        .send(NotificationRaised {
            user_id,
            notification_id,
        })
        .await
        .map_err(mailbox)?;
    Ok(counted(count))
}
