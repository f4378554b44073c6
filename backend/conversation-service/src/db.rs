use crate::error::{AppError, AppResult};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_conversations",
    include_str!("../migrations/0001_conversations.sql"),
)];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a deadpool-postgres pool, verify it and apply the schema
pub async fn init_pool(database_url: &str, max_connections: usize) -> AppResult<Pool> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    tokio::time::timeout(CONNECT_TIMEOUT, async {
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok::<(), AppError>(())
    })
    .await
    .map_err(|_| AppError::StartServer("timed out connecting to postgres".into()))??;

    info!(max_connections, "Database pool created and verified");
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Schema files are idempotent; applied in order on every start.
pub async fn run_migrations(pool: &Pool) -> AppResult<()> {
    let client = pool.get().await?;
    for (name, sql) in MIGRATIONS {
        client.batch_execute(sql).await?;
        info!(migration = *name, "Migration applied");
    }
    Ok(())
}
