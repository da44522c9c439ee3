use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use parley_types::api::{ChatSummary, Claims, MemberResponse, MessageResponse};

use crate::auth::AppStateInner;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

/// Conversations for the authenticated user, newest activity first.
pub async fn get_chats(
    State(state): State<Arc<AppStateInner>>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.clone();
    let user_id = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.db.get_chats_for_user(&user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let chats: Vec<ChatSummary> = rows
        .into_iter()
        .map(|row| ChatSummary {
            id: parse_id(&row.id, "chat"),
            last_message: row.last_message,
            last_message_time: parse_timestamp(&row.last_message_time, &row.id),
        })
        .collect();

    Ok(Json(chats))
}

/// Paginated history for one chat, newest first. Read-only; the write path
/// goes through the socket session.
pub async fn get_messages(
    State(state): State<Arc<AppStateInner>>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.clone();
    let cid = chat_id.to_string();
    let limit = query.limit.min(200);
    let offset = query.offset;

    let rows = tokio::task::spawn_blocking(move || db.db.get_messages(&cid, limit, offset))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let messages: Vec<MessageResponse> = rows
        .into_iter()
        .map(|row| MessageResponse {
            id: parse_id(&row.id, "message"),
            body: row.body,
            sender: row.author_username,
            created_at: parse_timestamp(&row.created_at, &row.id),
        })
        .collect();

    Ok(Json(messages))
}

pub async fn get_members(
    State(state): State<Arc<AppStateInner>>,
    Path(chat_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.clone();
    let cid = chat_id.to_string();

    let rows = tokio::task::spawn_blocking(move || db.db.get_members(&cid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let members: Vec<MemberResponse> = rows
        .into_iter()
        .map(|row| MemberResponse {
            username: row.username,
            public_key: row.public_key,
        })
        .collect();

    Ok(Json(members))
}

fn parse_id(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} id '{}': {}", what, raw, e);
        Uuid::default()
    })
}

fn parse_timestamp(raw: &str, row_id: &str) -> chrono::DateTime<chrono::Utc> {
    raw.parse::<chrono::DateTime<chrono::Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') default stores "YYYY-MM-DD HH:MM:SS"
            // without timezone. Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt created_at '{}' on row '{}': {}", raw, row_id, e);
            chrono::DateTime::default()
        })
}
