//! Proxy (C10): the public facade. Wires the state machine, health
//! monitor, fencing manager, dual-write manager and sync manager together
//! and exposes a single `write`/`query` surface to callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, SqlitePool};
use tokio::sync::RwLock;

use crate::adapter::{fallback as fb, primary as pg};
use crate::changelog::ChangeLogStore;
use crate::config::ProxyConfig;
use crate::dualwrite::{DualWriteManager, WriteResult};
use crate::error::ProxyError;
use crate::fencing::{FencingManager, FencingMode};
use crate::health::{HealthCheckResult, HealthTracker};
use crate::pending::PendingWriteStore;
use crate::schema::{SchemaError, SchemaRegistry};
use crate::state::{DatabaseState, DatabaseStateMachine};
use crate::sync_manager::{SyncManager, SyncResult};
use crate::types::{Row, WriteOperation};

/// A read-only snapshot of the proxy's current health and routing state,
/// useful for a status endpoint or CLI. Not a metrics-export integration —
/// just the in-process counters callers need to build one.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    pub state: DatabaseState,
    pub primary_healthy: bool,
    pub fallback_healthy: bool,
    pub fencing_enabled: bool,
    pub has_lock: bool,
    pub pending_write_count: usize,
    pub unsynced_count: i64,
    pub last_sync_result: Option<SyncResult>,
}

pub struct Proxy {
    config: Arc<ProxyConfig>,
    primary: PgPool,
    fallback: SqlitePool,
    registry: Arc<RwLock<SchemaRegistry>>,
    state_machine: Arc<RwLock<DatabaseStateMachine>>,
    primary_health: Arc<RwLock<HealthTracker>>,
    fallback_health: Arc<RwLock<HealthTracker>>,
    fencing: Arc<FencingManager>,
    dual_write: Arc<DualWriteManager>,
    sync_manager: Arc<SyncManager>,
    changelog: Arc<ChangeLogStore>,
    last_sync_result: Arc<RwLock<Option<SyncResult>>>,
    shutting_down: Arc<AtomicBool>,
    recovering: Arc<AtomicBool>,
}

impl Proxy {
    pub async fn from_env() -> Result<Arc<Self>, ProxyError> {
        let config = ProxyConfig::from_env().map_err(ProxyError::Config)?;
        Self::new(config).await
    }

    pub async fn new(config: ProxyConfig) -> Result<Arc<Self>, ProxyError> {
        let config = Arc::new(config);

        let primary = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .connect_lazy(&config.primary_url)?;
        let fallback = SqlitePoolOptions::new().connect(&format!("sqlite://{}?mode=rwc", config.fallback_path)).await?;

        let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
        changelog.init_schema().await?;
        let pending_store = Arc::new(PendingWriteStore::new(fallback.clone()));
        pending_store.init_schema().await?;

        let registry = match SchemaRegistry::introspect(&primary).await {
            Ok(registry) => registry,
            Err(err) => {
                tracing::warn!(error = %err, "schema introspection failed, starting with an empty registry");
                SchemaRegistry::empty()
            }
        };
        let registry = Arc::new(RwLock::new(registry));

        let fencing = Arc::new(
            FencingManager::new(
                config.fencing_key.clone(),
                Duration::from_millis(config.fencing_lease_ms),
                if config.fencing_strict { FencingMode::Strict } else { FencingMode::Lenient },
                config.redis_url.clone(),
            )
            .await,
        );

        let dual_write = Arc::new(DualWriteManager::new(
            primary.clone(),
            fallback.clone(),
            registry.clone(),
            changelog.clone(),
            pending_store.clone(),
            fencing.clone(),
            config.clone(),
        ));
        dual_write.initialize().await;

        let sync_manager = Arc::new(SyncManager::new(
            primary.clone(),
            fallback.clone(),
            registry.clone(),
            changelog.clone(),
            config.conflict_strategy,
            config.full_sync_page_size,
        ));

        // Starts optimistic; the health monitor's first tick demotes this
        // within one `health_check_interval` if the primary is actually
        // unreachable.
        let proxy = Arc::new(Self {
            config: config.clone(),
            primary,
            fallback,
            registry,
            state_machine: Arc::new(RwLock::new(DatabaseStateMachine::new(DatabaseState::Normal))),
            primary_health: Arc::new(RwLock::new(HealthTracker::new(
                config.sliding_window_size,
                config.failure_threshold,
                config.recovery_threshold,
                config.min_recovery_interval,
            ))),
            fallback_health: Arc::new(RwLock::new(HealthTracker::new(
                config.sliding_window_size,
                config.failure_threshold,
                config.recovery_threshold,
                config.min_recovery_interval,
            ))),
            fencing,
            dual_write,
            sync_manager,
            changelog,
            last_sync_result: Arc::new(RwLock::new(None)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            recovering: Arc::new(AtomicBool::new(false)),
        });

        proxy.fencing.acquire_lock().await.ok();
        proxy.start_health_monitor();
        Ok(proxy)
    }

    pub fn start_health_monitor(self: &Arc<Self>) {
        let proxy = self.clone();
        tokio::spawn(async move {
            loop {
                if proxy.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                proxy.health_tick().await;
                tokio::time::sleep(proxy.config.health_check_interval).await;
            }
        });
    }

    async fn health_tick(self: &Arc<Self>) {
        let primary_result = self.check_primary().await;
        let fallback_result = self.check_fallback().await;

        let primary_transition = {
            let mut tracker = self.primary_health.write().await;
            tracker.process(primary_result);
            tracker.snapshot()
        };
        {
            let mut tracker = self.fallback_health.write().await;
            tracker.process(fallback_result);
        }

        if self.fencing.enabled() {
            if let Err(err) = self.fencing.renew_lock().await {
                tracing::warn!(error = %err, "fencing lease renewal failed");
            }
        }

        self.apply_state_transitions(primary_transition.healthy).await;
    }

    async fn check_primary(&self) -> HealthCheckResult {
        perform_sql_check(&self.primary, self.config.health_check_timeout).await
    }

    async fn check_fallback(&self) -> HealthCheckResult {
        perform_sql_check_sqlite(&self.fallback, self.config.health_check_timeout).await
    }

    /// Health- and fencing-driven transition logic: the primary going
    /// unhealthy moves the proxy toward DEGRADED, recovering past the
    /// hysteresis threshold starts a recovery sync, and losing the
    /// fencing lock in strict mode forces UNAVAILABLE regardless of
    /// health.
    async fn apply_state_transitions(self: &Arc<Self>, primary_healthy: bool) {
        if self.fencing.enabled() && self.fencing.mode() == crate::fencing::FencingMode::Strict && !self.fencing.allows_write() {
            let mut machine = self.state_machine.write().await;
            if machine.state() != DatabaseState::Unavailable {
                let _ = machine.transition_to(DatabaseState::Unavailable, "fencing lock lost in strict mode");
            }
            return;
        }

        let current = { self.state_machine.read().await.state() };

        match (current, primary_healthy) {
            (DatabaseState::Normal, false) => {
                self.transition(DatabaseState::Degraded, "primary health check failed threshold").await;
            }
            (DatabaseState::Degraded, true) => {
                let reached = { self.primary_health.read().await.is_recovery_threshold_reached() };
                if reached {
                    self.transition(DatabaseState::Syncing, "primary recovered, starting resync").await;
                    self.start_recovery_task();
                }
            }
            (DatabaseState::Unavailable, _) => {
                if self.fencing.enabled() {
                    if self.fencing.acquire_lock().await.unwrap_or(false) {
                        self.transition(DatabaseState::Degraded, "fencing lock reacquired").await;
                    }
                } else {
                    self.transition(DatabaseState::Degraded, "fencing disabled, resuming").await;
                }
            }
            _ => {}
        }
    }

    async fn transition(self: &Arc<Self>, next: DatabaseState, reason: &str) {
        {
            let mut machine = self.state_machine.write().await;
            if let Err(err) = machine.transition_to(next, reason) {
                tracing::warn!(error = %err, "illegal state transition attempted");
                return;
            }
        }
        self.dual_write.on_state_changed(next).await;
    }

    fn start_recovery_task(self: &Arc<Self>) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        let proxy = self.clone();
        tokio::spawn(async move {
            proxy.run_recovery().await;
            proxy.recovering.store(false, Ordering::SeqCst);
        });
    }

    async fn run_recovery(self: &Arc<Self>) {
        let result: SyncResult = self.sync_manager.sync().await;
        let success = result.success;
        let applied = result.applied;
        let error_count = result.errors.len();
        *self.last_sync_result.write().await = Some(result);

        if success {
            tracing::info!(applied, "recovery sync completed");
            self.transition(DatabaseState::Normal, "recovery sync completed").await;
        } else {
            tracing::warn!(errors = error_count, "recovery sync reported errors, retrying from degraded");
            self.transition(DatabaseState::Degraded, "recovery sync failed").await;
        }
    }

    /// One-time bulk copy from primary into fallback; intended to be run
    /// once against a freshly provisioned fallback database, not on every
    /// boot.
    pub async fn seed_fallback(&self) -> Result<(), ProxyError> {
        self.sync_manager.full_sync_primary_to_fallback().await?;
        Ok(())
    }

    pub async fn write(self: &Arc<Self>, operation: WriteOperation) -> Result<WriteResult, ProxyError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ProxyError::ShuttingDown);
        }
        let state = { self.state_machine.read().await.state() };
        Ok(self.dual_write.write(state, operation).await?)
    }

    pub async fn fetch_one(&self, table: &str, where_: &crate::types::Where) -> Result<Option<Row>, ProxyError> {
        let schema = {
            let registry = self.registry.read().await;
            registry.get_by_table_name(table).cloned().ok_or_else(|| SchemaError::UnknownTable(table.to_string()))?
        };
        let state = { self.state_machine.read().await.state() };
        match state {
            DatabaseState::Normal | DatabaseState::Syncing => Ok(pg::fetch_one(&self.primary, &schema, where_).await?),
            DatabaseState::Degraded | DatabaseState::Unavailable => Ok(fb::fetch_one(&self.fallback, &schema, where_).await?),
        }
    }

    pub async fn get_metrics(&self) -> ProxyMetrics {
        ProxyMetrics {
            state: self.state_machine.read().await.state(),
            primary_healthy: self.primary_health.read().await.snapshot().healthy,
            fallback_healthy: self.fallback_health.read().await.snapshot().healthy,
            fencing_enabled: self.fencing.enabled(),
            has_lock: self.fencing.has_valid_lock(),
            pending_write_count: self.dual_write.pending_write_count(),
            unsynced_count: self.changelog.count_unapplied().await.unwrap_or(-1),
            last_sync_result: self.last_sync_result.read().await.clone(),
        }
    }

    /// Stops the health monitor loop and releases the fencing lock. Safe
    /// to call multiple times.
    pub async fn close(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if self.fencing.enabled() {
            if let Err(err) = self.fencing.release_lock().await {
                tracing::warn!(error = %err, "failed to release fencing lock on shutdown");
            }
        }
    }
}

async fn perform_sql_check(pool: &PgPool, timeout: Duration) -> HealthCheckResult {
    let started = std::time::Instant::now();
    match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(pool)).await {
        Ok(Ok(_)) => HealthCheckResult::healthy(started.elapsed()),
        Ok(Err(err)) => HealthCheckResult::unhealthy(err.to_string()),
        Err(_) => HealthCheckResult::unhealthy("health check timed out"),
    }
}

async fn perform_sql_check_sqlite(pool: &SqlitePool, timeout: Duration) -> HealthCheckResult {
    let started = std::time::Instant::now();
    match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(pool)).await {
        Ok(Ok(_)) => HealthCheckResult::healthy(started.elapsed()),
        Ok(Err(err)) => HealthCheckResult::unhealthy(err.to_string()),
        Err(_) => HealthCheckResult::unhealthy("health check timed out"),
    }
}
