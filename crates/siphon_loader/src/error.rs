//! Error type for the loader core and classification of downstream failures.

use thiserror::Error;

use crate::dml::DmlKind;

/// MySQL server error code for an unknown column (`ER_BAD_FIELD_ERROR`).
pub const ER_BAD_FIELD_ERROR: u16 = 1054;
/// MySQL server error code for a lock wait timeout (`ER_LOCK_WAIT_TIMEOUT`).
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
/// MySQL server error code for a deadlock (`ER_LOCK_DEADLOCK`).
pub const ER_LOCK_DEADLOCK: u16 = 1213;

/// Primary error type for loader operations.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The change stream violated per-key ordering, e.g. an update that
    /// follows a delete on the same primary key with no insert in between.
    #[error("merge conflict on {key}: {prior:?} followed by {next:?}")]
    MergeConflict {
        key: String,
        prior: DmlKind,
        next: DmlKind,
    },

    /// A primary-key column has no value (or a NULL value) in the change
    /// record, so the row cannot be addressed downstream.
    #[error("missing primary key column `{column}` for {table}")]
    MissingPrimaryKey { column: String, table: String },

    /// A plain single-row update matched no existing row. The change record
    /// names a row the downstream does not have, so the two sides have
    /// diverged; safe-mode rewrites and replayed deletes are exempt because
    /// zero matches is their normal idempotent outcome.
    #[error("statement for {table} affected no rows")]
    NoRows { table: String },

    /// The loopback mark update failed or matched zero rows; the transaction
    /// was rolled back.
    #[error("failed to update loopback mark: {reason}")]
    MarkUpdateFailed { reason: String },

    /// A transaction arrived from an address that is itself a migration
    /// target, which means replicated writes are travelling in a cycle.
    #[error("cyclic replication may occur: origin ip {ip} is a migration peer")]
    CyclicReplication { ip: String },

    /// Shutdown was observed; the operation stopped without further retries.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// An extension hook failed and the hook policy is strict.
    #[error("extension hook {hook} failed: {reason}")]
    HookFailed { hook: String, reason: String },

    /// A sub-batch task could not be joined (panic or runtime teardown).
    #[error("batch task failed: {0}")]
    TaskFailed(String),

    /// The downstream server rejected a statement with a numeric error code.
    #[error("downstream server error {code}: {message}")]
    Server { code: u16, message: String },

    /// Any other downstream driver failure (connection, protocol, io).
    #[error("downstream error: {0}")]
    Downstream(#[from] mysql_async::Error),
}

impl LoaderError {
    /// Numeric server error code, when the failure carries one.
    pub fn server_error_code(&self) -> Option<u16> {
        match self {
            LoaderError::Server { code, .. } => Some(*code),
            LoaderError::Downstream(mysql_async::Error::Server(err)) => Some(err.code),
            _ => None,
        }
    }

    /// True when the downstream reports a column the generated statement
    /// references but the table no longer has. Drives a schema refresh.
    pub fn is_schema_drift(&self) -> bool {
        self.server_error_code() == Some(ER_BAD_FIELD_ERROR)
    }

    /// True for failures that a bounded retry is expected to clear.
    pub fn is_transient(&self) -> bool {
        match self {
            LoaderError::Downstream(mysql_async::Error::Io(_)) => true,
            other => matches!(
                other.server_error_code(),
                Some(ER_LOCK_WAIT_TIMEOUT) | Some(ER_LOCK_DEADLOCK)
            ),
        }
    }

    /// True when the failure is a shutdown observation. Never retried.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoaderError::Cancelled)
    }
}
