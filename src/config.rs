use std::env;
use std::time::Duration;

use crate::constants::{DEFAULT_DATABASE_PATH, DEFAULT_OP_TIMEOUT_MS};

/// Which [`KvStore`](crate::store::KvStore) backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redb,
    Redis,
    /// Process-local and empty at startup
    Memory,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redb" => Some(StoreBackend::Redb),
            "redis" => Some(StoreBackend::Redis),
            "memory" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub store_backend: StoreBackend,
    pub redis_url: Option<String>,
    pub op_timeout_ms: u64,
    pub prune_orphans: bool,
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists (development)
        dotenvy::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());

        let store_backend = match env::var("STORE_BACKEND") {
            Ok(value) => StoreBackend::parse(&value).ok_or("Invalid STORE_BACKEND")?,
            Err(_) => StoreBackend::Redb,
        };

        let redis_url = env::var("REDIS_URL").ok();
        if store_backend == StoreBackend::Redis && redis_url.is_none() {
            return Err("STORE_BACKEND=redis requires REDIS_URL".to_string());
        }

        let op_timeout_ms = env::var("OP_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_OP_TIMEOUT_MS.to_string())
            .parse()
            .map_err(|_| "Invalid OP_TIMEOUT_MS")?;

        let prune_orphans = env::var("PRUNE_ORPHANS")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .map_err(|_| "Invalid PRUNE_ORPHANS")?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Ok(Config {
            database_path,
            store_backend,
            redis_url,
            op_timeout_ms,
            prune_orphans,
            environment,
        })
    }

    /// Bound applied to each repository operation
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}
