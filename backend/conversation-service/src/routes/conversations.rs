//! Conversation directory endpoints

use crate::{
    error::AppError, middleware::guards::User, models::MetadataPatch, state::AppState,
};
use actix_web::{get, patch, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

// ============================================
// Request DTOs
// ============================================

#[derive(Debug, Deserialize)]
pub struct CreateDirectRequest {
    pub peer_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub title: String,
    /// Group photo URL from the media service
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

// ============================================
// Endpoints
// ============================================

/// POST /conversations/direct
/// Returns the existing direct conversation with the peer or creates it.
#[post("/conversations/direct")]
pub async fn create_direct(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateDirectRequest>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .orchestrator
        .create_direct(user.id, body.peer_id)
        .await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// POST /conversations/groups
#[post("/conversations/groups")]
pub async fn create_group(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateGroupRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let summary = state
        .orchestrator
        .create_group(user.id, &body.title, body.media, &body.member_ids)
        .await?;
    Ok(HttpResponse::Created().json(summary))
}

/// GET /conversations
/// Conversations of the caller, most recently active first.
#[get("/conversations")]
pub async fn list_conversations(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let summaries = state.orchestrator.list_conversations(user.id).await?;
    Ok(HttpResponse::Ok().json(summaries))
}

#[get("/conversations/{id}")]
pub async fn get_conversation(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .orchestrator
        .get_conversation(conversation_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// PATCH /conversations/{id}
/// Authorization: owner or admin of a group
#[patch("/conversations/{id}")]
pub async fn update_conversation(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<MetadataPatch>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .orchestrator
        .update_metadata(conversation_id.into_inner(), user.id, body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(summary))
}
