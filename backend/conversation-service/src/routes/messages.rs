//! Message ledger and read marker endpoints

use crate::{
    error::AppError,
    middleware::guards::User,
    models::MediaInput,
    services::OutgoingMessage,
    state::AppState,
};
use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

// ============================================
// Request DTOs
// ============================================

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media: Vec<MediaInput>,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub before: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AfterQuery {
    #[serde(default)]
    pub after: i64,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub upto_sequence: i64,
}

// ============================================
// Endpoints
// ============================================

/// POST /conversations/{id}/messages
#[post("/conversations/{id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let outgoing = OutgoingMessage {
        content: body.content,
        media: body.media.into_iter().map(Into::into).collect(),
        reply_to_id: body.reply_to_id,
    };

    let message = state
        .orchestrator
        .send_message(conversation_id.into_inner(), user.id, outgoing)
        .await?;
    Ok(HttpResponse::Created().json(message))
}

/// GET /conversations/{id}/messages?before=&limit=
/// Newest first; pass `next_before` back as `before` for older history.
#[get("/conversations/{id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, AppError> {
    let page = state
        .orchestrator
        .get_page(conversation_id.into_inner(), user.id, query.before, query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

/// GET /conversations/{id}/messages/after?after=&limit=
/// Oldest first; catch-up for clients that are not on a socket.
#[get("/conversations/{id}/messages/after")]
pub async fn get_messages_after(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    query: web::Query<AfterQuery>,
) -> Result<HttpResponse, AppError> {
    let window = state
        .orchestrator
        .messages_after(conversation_id.into_inner(), user.id, query.after, query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(window))
}

/// POST /conversations/{id}/read
#[post("/conversations/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<MarkReadRequest>,
) -> Result<HttpResponse, AppError> {
    let read = state
        .orchestrator
        .mark_read(conversation_id.into_inner(), user.id, body.upto_sequence)
        .await?;
    Ok(HttpResponse::Ok().json(read))
}
