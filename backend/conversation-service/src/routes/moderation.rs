//! Inbound verdicts from the moderation collaborator

use crate::{
    error::AppError, middleware::guards::InternalCaller, models::ModerationState, state::AppState,
};
use actix_web::{post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ModerationVerdict {
    pub state: ModerationState,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /internal/messages/{id}/moderation
/// Idempotent: repeating the current state changes nothing and emits no event.
#[post("/internal/messages/{id}/moderation")]
pub async fn apply_verdict(
    state: web::Data<AppState>,
    _caller: InternalCaller,
    message_id: web::Path<Uuid>,
    body: web::Json<ModerationVerdict>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let message = state
        .orchestrator
        .mark_moderated(message_id.into_inner(), body.state, body.reason)
        .await?;
    Ok(HttpResponse::Ok().json(message))
}
