//! Group membership endpoints
//!
//! All endpoints in this file require the conversation to be a group (not direct).
//! Permission rules live in the membership state machine; handlers only translate.

use crate::{
    error::AppError,
    middleware::guards::User,
    models::MemberRole,
    services::LeaveOutcome,
    state::AppState,
};
use actix_web::{delete, post, put, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================
// Request/Response DTOs
// ============================================

#[derive(Debug, Deserialize)]
pub struct AddMembersRequest {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: MemberRole,
}

#[derive(Debug, Deserialize)]
pub struct TransferOwnershipRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct LeaveResponse {
    pub conversation_id: Uuid,
    pub conversation_deleted: bool,
}

// ============================================
// Endpoints
// ============================================

/// POST /conversations/{id}/members
/// Authorization: owner or admin
#[post("/conversations/{id}/members")]
pub async fn add_members(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<AddMembersRequest>,
) -> Result<HttpResponse, AppError> {
    let added = state
        .orchestrator
        .add_members(conversation_id.into_inner(), user.id, &body.user_ids)
        .await?;
    Ok(HttpResponse::Created().json(added))
}

/// DELETE /conversations/{id}/members/{user_id}
/// Authorization: owner, or admin removing a plain member
#[delete("/conversations/{id}/members/{user_id}")]
pub async fn remove_member(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<(Uuid, Uuid)>,
) -> Result<HttpResponse, AppError> {
    let (conversation_id, target_id) = path.into_inner();
    state
        .orchestrator
        .remove_member(conversation_id, user.id, target_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// PUT /conversations/{id}/members/{user_id}/role
#[put("/conversations/{id}/members/{user_id}/role")]
pub async fn update_member_role(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<(Uuid, Uuid)>,
    body: web::Json<UpdateRoleRequest>,
) -> Result<HttpResponse, AppError> {
    let (conversation_id, target_id) = path.into_inner();
    let member = state
        .orchestrator
        .update_role(conversation_id, user.id, target_id, body.role)
        .await?;
    Ok(HttpResponse::Ok().json(member))
}

/// POST /conversations/{id}/leave
/// The last member leaving deletes the conversation.
#[post("/conversations/{id}/leave")]
pub async fn leave_conversation(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = conversation_id.into_inner();
    let outcome = state.orchestrator.leave(conversation_id, user.id).await?;
    Ok(HttpResponse::Ok().json(LeaveResponse {
        conversation_id,
        conversation_deleted: outcome == LeaveOutcome::ConversationDeleted,
    }))
}

/// POST /conversations/{id}/owner
/// Authorization: owner only; the previous owner becomes an admin.
#[post("/conversations/{id}/owner")]
pub async fn transfer_ownership(
    state: web::Data<AppState>,
    user: User,
    conversation_id: web::Path<Uuid>,
    body: web::Json<TransferOwnershipRequest>,
) -> Result<HttpResponse, AppError> {
    state
        .orchestrator
        .transfer_ownership(conversation_id.into_inner(), user.id, body.user_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
