//! Environment-driven configuration, following the teacher pack's
//! `DbConfig::from_env()` convention rather than a config file.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::conflict::ConflictStrategy;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub primary_url: String,
    pub fallback_path: String,
    pub redis_url: Option<String>,
    pub fencing_key: String,
    pub fencing_lease_ms: u64,
    pub fencing_strict: bool,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub min_recovery_interval: Duration,
    pub sliding_window_size: usize,
    pub syncing_queue_capacity: usize,
    pub pending_write_retry_interval: Duration,
    pub critical_tables: HashSet<String>,
    pub max_pg_connections: u32,
    pub full_sync_page_size: i64,
    pub conflict_strategy: ConflictStrategy,
}

impl ProxyConfig {
    /// Reads configuration from the process environment, falling back to
    /// conservative defaults for anything not set. Only `PRIMARY_DATABASE_URL`
    /// and `FALLBACK_DATABASE_PATH` are required.
    pub fn from_env() -> Result<Self, String> {
        let primary_url = env::var("PRIMARY_DATABASE_URL")
            .map_err(|_| "PRIMARY_DATABASE_URL is not set".to_string())?;
        let fallback_path = env::var("FALLBACK_DATABASE_PATH")
            .unwrap_or_else(|_| "./fallback.sqlite3".to_string());
        let redis_url = env::var("FENCING_REDIS_URL").ok();
        let fencing_key = env::var("FENCING_KEY").unwrap_or_else(|_| "standby-proxy:lock".to_string());
        let fencing_strict = env_bool("FENCING_STRICT", true);

        let critical_tables = env::var("CRITICAL_TABLES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            primary_url,
            fallback_path,
            redis_url,
            fencing_key,
            fencing_lease_ms: env_u64("FENCING_LEASE_MS", 10_000),
            fencing_strict,
            health_check_interval: Duration::from_millis(env_u64("HEALTH_CHECK_INTERVAL_MS", 2_000)),
            health_check_timeout: Duration::from_millis(env_u64("HEALTH_CHECK_TIMEOUT_MS", 1_500)),
            failure_threshold: env_u64("HEALTH_FAILURE_THRESHOLD", 3) as u32,
            recovery_threshold: env_u64("HEALTH_RECOVERY_THRESHOLD", 3) as u32,
            min_recovery_interval: Duration::from_millis(env_u64("HEALTH_MIN_RECOVERY_INTERVAL_MS", 5_000)),
            sliding_window_size: env_u64("HEALTH_SLIDING_WINDOW_SIZE", 10) as usize,
            syncing_queue_capacity: env_u64("SYNCING_QUEUE_CAPACITY", 10_000) as usize,
            pending_write_retry_interval: Duration::from_millis(env_u64("PENDING_WRITE_RETRY_INTERVAL_MS", 3_000)),
            critical_tables,
            max_pg_connections: env_u64("PRIMARY_MAX_CONNECTIONS", 10) as u32,
            full_sync_page_size: env_u64("FULL_SYNC_PAGE_SIZE", 500) as i64,
            conflict_strategy: env_conflict_strategy("CONFLICT_STRATEGY", ConflictStrategy::RemoteWins),
        })
    }

    pub fn is_critical_table(&self, table: &str) -> bool {
        self.critical_tables.contains(table)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_conflict_strategy(key: &str, default: ConflictStrategy) -> ConflictStrategy {
    match env::var(key).ok().as_deref().map(|s| s.to_lowercase()) {
        Some(s) if s == "local-wins" || s == "local_wins" => ConflictStrategy::LocalWins,
        Some(s) if s == "remote-wins" || s == "remote_wins" => ConflictStrategy::RemoteWins,
        Some(s) if s == "version-based" || s == "version_based" => ConflictStrategy::VersionBased,
        Some(s) if s == "manual" => ConflictStrategy::Manual,
        Some(other) => {
            tracing::warn!(value = %other, "unrecognized CONFLICT_STRATEGY, using default");
            default
        }
        None => default,
    }
}
