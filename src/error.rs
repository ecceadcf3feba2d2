//! Top-level error taxonomy. Each subsystem defines its own `thiserror`
//! enum; `ProxyError` composes them for the caller-facing surface.

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::changelog::ChangeLogError;
use crate::dualwrite::DualWriteError;
use crate::fencing::FencingError;
use crate::pending::PendingWriteError;
use crate::schema::SchemaError;
use crate::state::TransitionError;
use crate::sync_manager::SyncError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("database unavailable")]
    Unavailable,
    #[error(transparent)]
    DualWrite(#[from] DualWriteError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Fencing(#[from] FencingError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    ChangeLog(#[from] ChangeLogError),
    #[error(transparent)]
    PendingWrite(#[from] PendingWriteError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("proxy is shutting down")]
    ShuttingDown,
    #[error("config error: {0}")]
    Config(String),
}
