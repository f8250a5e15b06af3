//! Configuration module
//!
//! Settings for the durable store, the in-process draft cache and the render
//! queue. Everything is read from the environment (a `.env` file is honoured).

use std::env;
use std::str::FromStr;

const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const MEMORY_CACHE_SIZE: usize = 100;
const DRAFT_RETENTION_DAYS: i32 = 0;
const RENDER_QUEUE_NAME: &str = "default";
const RENDER_POLL_INTERVAL_MS: u64 = 1000;
const RENDER_WATCH_TIMEOUT_SECS: u64 = 6 * 60 * 60;
const RENDER_PING_TIMEOUT_MS: u64 = 1000;

#[derive(Clone, Debug)]
pub struct Config {
    pub environment: String,
    pub log_format: String,
    // Durable store
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    // Draft cache
    pub memory_cache_size: usize,
    /// Drafts not read or written for this many days are removed by the cleanup sweep. 0 = disabled.
    pub draft_retention_days: i32,
    // Render queue
    pub celery_broker_url: Option<String>,
    pub celery_result_backend: Option<String>,
    pub render_queue_name: String,
    pub render_poll_interval_ms: u64,
    /// Hard limit on how long a watcher waits for a render before marking it failed.
    pub render_watch_timeout_secs: u64,
    pub render_ping_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let redis_url = non_empty_var("REDIS_URL");

        let config = Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_format: env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "compact".to_string())
                .to_lowercase(),
            database_url: database_url_from_env(),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: parse_var("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            memory_cache_size: parse_var("MEMORY_CACHE_SIZE", MEMORY_CACHE_SIZE),
            draft_retention_days: parse_var("DRAFT_RETENTION_DAYS", DRAFT_RETENTION_DAYS),
            celery_broker_url: non_empty_var("CELERY_BROKER_URL").or_else(|| redis_url.clone()),
            celery_result_backend: non_empty_var("CELERY_RESULT_BACKEND").or(redis_url),
            render_queue_name: env::var("RENDER_QUEUE_NAME")
                .unwrap_or_else(|_| RENDER_QUEUE_NAME.to_string()),
            render_poll_interval_ms: parse_var("RENDER_POLL_INTERVAL_MS", RENDER_POLL_INTERVAL_MS),
            render_watch_timeout_secs: parse_var(
                "RENDER_WATCH_TIMEOUT_SECS",
                RENDER_WATCH_TIMEOUT_SECS,
            ),
            render_ping_timeout_ms: parse_var("RENDER_PING_TIMEOUT_MS", RENDER_PING_TIMEOUT_MS),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !(self.database_url.starts_with("postgresql://")
            || self.database_url.starts_with("postgres://"))
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.memory_cache_size == 0 {
            return Err(anyhow::anyhow!("MEMORY_CACHE_SIZE must be greater than 0"));
        }

        if self.render_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "RENDER_POLL_INTERVAL_MS must be greater than 0"
            ));
        }

        if self.draft_retention_days < 0 {
            return Err(anyhow::anyhow!("DRAFT_RETENTION_DAYS must not be negative"));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }

    /// Both broker and result backend are needed to dispatch renders.
    pub fn render_queue_configured(&self) -> bool {
        self.celery_broker_url.is_some() && self.celery_result_backend.is_some()
    }
}

/// `DATABASE_URL`, or a URL assembled from the individual `POSTGRES_*` parts.
fn database_url_from_env() -> String {
    if let Some(url) = non_empty_var("DATABASE_URL") {
        return url;
    }
    let user = env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "postgres".to_string());
    let host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let dbname = env::var("POSTGRES_DB").unwrap_or_else(|_| "kox".to_string());
    format!("postgresql://{user}:{password}@{host}:{port}/{dbname}")
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
