use actix_web::{web, App, HttpServer};
use conversation_service::{
    config::{self, StoreBackend},
    db, error, logging,
    redis_client::RedisClient,
    routes,
    services::{
        ConversationOrchestrator, HttpModerationClient, ModerationClient, NoopModeration,
        OrchestratorSettings,
    },
    state::AppState,
    store::{ConversationStore, MemoryStore, PgStore},
    websocket::{
        fanout::Fanout,
        streams::{start_streams_listener, StreamRelay},
        ConnectionRegistry,
    },
};
use std::sync::Arc;
use tracing_actix_web::TracingLogger;
use uuid::Uuid;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    let cfg = Arc::new(config::Config::from_env()?);
    logging::init_tracing(cfg.log_format);

    let store: Arc<dyn ConversationStore> = match cfg.store_backend {
        StoreBackend::Postgres => {
            let url = cfg
                .database_url
                .as_deref()
                .ok_or_else(|| error::AppError::Config("DATABASE_URL is required".into()))?;
            let pool = db::init_pool(url, cfg.db_max_connections).await?;
            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = ConnectionRegistry::new();
    let mut fanout = Fanout::new(registry.clone());

    // Cross-instance relay for multi-replica deployments
    if let Some(redis_url) = cfg.redis_url.as_deref() {
        let redis = RedisClient::from_url(redis_url)
            .await
            .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;
        let instance_id = Uuid::new_v4();
        fanout = fanout.with_relay(StreamRelay::start(redis.clone(), instance_id));

        let listener_fanout = fanout.clone();
        tokio::spawn(async move {
            start_streams_listener(redis, listener_fanout, instance_id).await;
        });
        tracing::info!(%instance_id, "Redis streams relay enabled");
    }

    let moderation: Arc<dyn ModerationClient> = match cfg.moderation_url.clone() {
        Some(url) => Arc::new(HttpModerationClient::new(url)),
        None => Arc::new(NoopModeration),
    };

    let orchestrator = ConversationOrchestrator::new(
        store,
        fanout,
        moderation,
        OrchestratorSettings::from_config(&cfg),
    );
    let state = AppState::new(orchestrator, cfg.clone());

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, backend = ?cfg.store_backend, "starting conversation-service");

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure_routes)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind REST: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("REST server: {e}")))
}
