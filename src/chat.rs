// File: chat.rs

use actix_web::{web, HttpRequest, HttpResponse};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::error::{ChatError, Result};
use crate::models::{HistoryCursor, Message};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Cursor returned by the previous page; omit for the newest messages.
    pub before: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub data: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// GET /projects/{project_id}/messages?before=&limit=
/// One backward page of the room as the caller sees it, oldest first.
pub async fn get_messages(
    req: HttpRequest,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse> {
    let user_id = current_user(&req)?;
    let project_id = project_id.into_inner();

    if !data.directory.is_member(&user_id, &project_id).await? {
        return Err(ChatError::Forbidden(format!(
            "user {} is not a member of project {}",
            user_id, project_id
        )));
    }

    let before = query
        .before
        .as_deref()
        .filter(|raw| !raw.is_empty())
        .map(str::parse::<HistoryCursor>)
        .transpose()?;
    let limit = data.config.page_limit(query.limit);

    let page = data
        .store
        .list_history(&project_id, &user_id, before.as_ref(), limit)
        .await?;
    debug!(
        "History page for {} in {}: {} message(s)",
        user_id,
        project_id,
        page.messages.len()
    );

    Ok(HttpResponse::Ok().json(HistoryResponse {
        success: true,
        data: page.messages,
        next_cursor: page.next_cursor.map(|cursor| cursor.to_string()),
    }))
}
