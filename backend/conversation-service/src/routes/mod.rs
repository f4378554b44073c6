// Re-export route modules
pub mod conversations;
pub mod members;
pub mod messages;
pub mod moderation;
pub mod wsroute;

use actix_web::{get, web, HttpResponse};

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Registers every endpoint; shared by `main` and the HTTP tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .route("/metrics", web::get().to(crate::metrics::metrics_handler))
        .service(wsroute::ws_handler)
        .service(moderation::apply_verdict)
        .service(
            web::scope("/api/v1")
                .service(conversations::create_direct)
                .service(conversations::create_group)
                .service(conversations::list_conversations)
                .service(conversations::get_conversation)
                .service(conversations::update_conversation)
                .service(messages::send_message)
                .service(messages::get_messages)
                .service(messages::get_messages_after)
                .service(messages::mark_read)
                .service(members::add_members)
                .service(members::remove_member)
                .service(members::update_member_role)
                .service(members::leave_conversation)
                .service(members::transfer_ownership),
        );
}
