//! Top-level error type returned by the queue/task domain services.
//!
//! Store and cache failures are wrapped with the short cause prefixes the
//! original service layer uses (`"save task: "`, `"get first pending task:
//! "`, ...) so a log line names the failing step without leaking storage
//! internals past the HTTP/wire boundary.

use crate::store::StoreError;
use crate::tx::{RunError, TxError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("save task: {0}")]
    SaveTask(StoreError),

    #[error("get first pending task: {0}")]
    GetFirstPending(StoreError),

    #[error("check processing task by id existence: {0}")]
    GetProcessingById(StoreError),

    #[error(transparent)]
    Tx(#[from] TxError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Folds a `TxCoordinator::run` outcome into this crate's `Error`, logging
/// (but never surfacing) a rollback failure alongside the originating
/// error, per SPEC_FULL.md §7.
pub(crate) fn fold_run_result<T>(
    op_name: &str,
    result: std::result::Result<T, RunError<Error>>,
    rollback_err: Option<TxError>,
) -> Result<T> {
    if let Some(rb_err) = &rollback_err {
        if let Err(op_err) = &result {
            tracing::error!(
                op = op_name,
                rollback_error = %rb_err,
                op_error = %op_err,
                "rollback error"
            );
        }
    }

    match result {
        Ok(value) => Ok(value),
        Err(RunError::Body(e)) => Err(e),
        Err(RunError::Commit(e)) => Err(Error::Tx(e)),
    }
}
