mod common;

use actix_web::{http::StatusCode, test, web, App};
use conversation_service::{
    config::Config,
    middleware::error_handling::ErrorResponse,
    routes::configure_routes,
    state::AppState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const TOKEN: &str = "test-internal-token";

fn app_state() -> AppState {
    AppState::new(common::orchestrator(), Arc::new(Config::test_defaults()))
}

macro_rules! init_app {
    () => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .configure(configure_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn health_is_public() {
    let app = init_app!();
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn missing_identity_is_unauthorized() {
    let app = init_app!();
    let req = test::TestRequest::get().uri("/api/v1/conversations").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.code, "UNAUTHORIZED");
    assert_eq!(body.status, 401);
}

#[actix_web::test]
async fn group_conversation_round_trip() {
    let app = init_app!();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/groups")
        .insert_header(("X-User-Id", owner.to_string()))
        .set_json(json!({ "title": "Weekend", "member_ids": [member] }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let group: Value = test::read_body_json(resp).await;
    let id = group["id"].as_str().unwrap().to_string();
    assert_eq!(group["title"], "Weekend");
    assert_eq!(group["last_sequence"], 1);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/conversations/{id}/messages"))
        .insert_header(("X-User-Id", member.to_string()))
        .set_json(json!({ "content": "see you there" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let message: Value = test::read_body_json(resp).await;
    assert_eq!(message["sequence"], 2);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{id}/messages?limit=10"))
        .insert_header(("X-User-Id", owner.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let page: Value = test::read_body_json(resp).await;
    let seqs: Vec<i64> = page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["sequence"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![2, 1]);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/conversations/{id}/read"))
        .insert_header(("X-User-Id", owner.to_string()))
        .set_json(json!({ "upto_sequence": 2 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri("/api/v1/conversations")
        .insert_header(("X-User-Id", owner.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let list: Value = test::read_body_json(resp).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["unread_count"], 0);
}

#[actix_web::test]
async fn outsiders_get_forbidden_json() {
    let app = init_app!();
    let owner = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/groups")
        .insert_header(("X-User-Id", owner.to_string()))
        .set_json(json!({ "title": "Private" }))
        .to_request();
    let group: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let id = group["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{id}/messages"))
        .insert_header(("X-User-Id", Uuid::new_v4().to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.code, "FORBIDDEN");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{}", Uuid::new_v4()))
        .insert_header(("X-User-Id", owner.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn blank_group_title_is_rejected() {
    let app = init_app!();
    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/groups")
        .insert_header(("X-User-Id", Uuid::new_v4().to_string()))
        .set_json(json!({ "title": "  " }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.code, "INVALID_REQUEST");
}

#[actix_web::test]
async fn moderation_verdict_requires_internal_token() {
    let app = init_app!();
    let owner = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/groups")
        .insert_header(("X-User-Id", owner.to_string()))
        .set_json(json!({ "title": "Moderated" }))
        .to_request();
    let group: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let id = group["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/conversations/{id}/messages"))
        .insert_header(("X-User-Id", owner.to_string()))
        .set_json(json!({ "content": "spam spam spam" }))
        .to_request();
    let message: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let message_id = message["id"].as_str().unwrap().to_string();
    let uri = format!("/internal/messages/{message_id}/moderation");

    let req = test::TestRequest::post()
        .uri(&uri)
        .set_json(json!({ "state": "system_removed" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&uri)
        .insert_header(("X-Internal-Token", TOKEN))
        .set_json(json!({ "state": "system_removed", "reason": "spam" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/conversations/{id}/messages"))
        .insert_header(("X-User-Id", owner.to_string()))
        .to_request();
    let page: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let removed = page["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["id"] == message_id.as_str())
        .unwrap()
        .clone();
    assert_eq!(removed["moderation_state"], "system_removed");
    assert_eq!(removed["content"], "");
}

#[actix_web::test]
async fn owner_leave_is_rejected_until_transfer() {
    let app = init_app!();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri("/api/v1/conversations/groups")
        .insert_header(("X-User-Id", owner.to_string()))
        .set_json(json!({ "title": "Club", "member_ids": [member] }))
        .to_request();
    let group: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let id = group["id"].as_str().unwrap().to_string();

    let leave = |user: Uuid| {
        test::TestRequest::post()
            .uri(&format!("/api/v1/conversations/{id}/leave"))
            .insert_header(("X-User-Id", user.to_string()))
            .to_request()
    };

    let resp = test::call_service(&app, leave(owner)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/conversations/{id}/owner"))
        .insert_header(("X-User-Id", owner.to_string()))
        .set_json(json!({ "user_id": member }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = test::call_service(&app, leave(owner)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["conversation_deleted"], false);
}
