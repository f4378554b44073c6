use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which durable store backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(AppError::Config(format!("STORE_BACKEND: unknown backend {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub redis_url: Option<String>,
    pub port: u16,
    /// Bounded wait for a conversation's serialization point
    pub lock_timeout: Duration,
    pub conflict_max_retries: u32,
    pub max_message_length: usize,
    pub moderation_url: Option<String>,
    pub internal_api_token: Option<String>,
    pub ws_dev_allow_query_identity: bool,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store_backend = match lookup("STORE_BACKEND") {
            Some(v) => v.parse()?,
            None => StoreBackend::Postgres,
        };

        let database_url = lookup("DATABASE_URL").filter(|s| !s.trim().is_empty());
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(AppError::Config("DATABASE_URL missing".into()));
        }

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(AppError::Config(format!("LOG_FORMAT: unknown format {other}")))
            }
        };

        let lock_timeout_ms: u64 = parse_or(&lookup, "LOCK_TIMEOUT_MS", 2000)?;
        if lock_timeout_ms == 0 {
            return Err(AppError::Config("LOCK_TIMEOUT_MS must be positive".into()));
        }

        let max_message_length: usize = parse_or(&lookup, "MAX_MESSAGE_LENGTH", 4000)?;
        if max_message_length == 0 {
            return Err(AppError::Config("MAX_MESSAGE_LENGTH must be positive".into()));
        }

        Ok(Self {
            store_backend,
            database_url,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 16)?,
            redis_url: lookup("REDIS_URL").filter(|s| !s.trim().is_empty()),
            port: parse_or(&lookup, "PORT", 8080)?,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            conflict_max_retries: parse_or(&lookup, "CONFLICT_MAX_RETRIES", 3)?,
            max_message_length,
            moderation_url: lookup("MODERATION_URL").filter(|s| !s.trim().is_empty()),
            internal_api_token: lookup("INTERNAL_API_TOKEN").filter(|s| !s.trim().is_empty()),
            ws_dev_allow_query_identity: lookup("WS_DEV_ALLOW_QUERY_IDENTITY")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            log_format,
        })
    }

    /// In-memory configuration used by tests and local runs
    pub fn test_defaults() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            database_url: None,
            db_max_connections: 4,
            redis_url: None,
            port: 0,
            lock_timeout: Duration::from_millis(2000),
            conflict_max_retries: 3,
            max_message_length: 4000,
            moderation_url: None,
            internal_api_token: Some("test-internal-token".into()),
            ws_dev_allow_query_identity: true,
            log_format: LogFormat::Text,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key}: {e}"))),
    }
}
