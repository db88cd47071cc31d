use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
}

/// Knobs for the synchronization kernel: chunking, replication pacing, and
/// node liveness. Defaults match spec.md (chunk size 4096, heartbeat 30s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Fixed chunk size `C` for the delta engine (§4.3).
    pub chunk_size: usize,
    /// Per-step delay between `sync_progress` events during replication
    /// (§4.6). Tests set this to zero.
    pub replication_progress_delay_ms: u64,
    /// Node heartbeat interval; two missed intervals marks a node offline
    /// (§5 "Heartbeats").
    pub heartbeat_interval_ms: u64,
    /// Retention window for processed events before `purge` removes them.
    pub event_retention_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            replication_progress_delay_ms: 50,
            heartbeat_interval_ms: 30_000,
            event_retention_days: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:data/syncd.db".to_string()),
            },
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .unwrap_or(8080),
            },
            cache: CacheConfig {
                capacity: env::var("CACHE_CAPACITY")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
            },
            sync: SyncConfig {
                chunk_size: env::var("SYNC_CHUNK_SIZE")
                    .unwrap_or_else(|_| "4096".to_string())
                    .parse()
                    .unwrap_or(4096),
                replication_progress_delay_ms: env::var("SYNC_PROGRESS_DELAY_MS")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
                heartbeat_interval_ms: env::var("SYNC_HEARTBEAT_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()
                    .unwrap_or(30_000),
                event_retention_days: env::var("SYNC_EVENT_RETENTION_DAYS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
