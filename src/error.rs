//! The five-kind error taxonomy of the sync engine (see spec §7).
//!
//! Each variant carries a distinct recovery policy for the caller:
//! `MsgBad` is swallowed and logged, `BoxBad` aborts the current mailbox,
//! `StoreBad` aborts the whole session, `ConfigError` and `Fatal` are
//! surfaced to the process exit code.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A single message became unreachable. Logged, skipped, sync continues.
    #[error("message error: {0}")]
    MsgBad(String),

    /// The current mailbox is unusable. This mailbox is aborted.
    #[error("mailbox error: {0}")]
    BoxBad(String),

    /// The whole session/store is unusable. Remaining mailboxes on this
    /// store are aborted.
    #[error("store error: {0}")]
    StoreBad(String),

    /// Misconfiguration detected at open time. Fatal for this store.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Internal invariant violation or unrecoverable condition. The
    /// process should exit non-zero immediately.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl SyncError {
    pub fn msg_bad(msg: impl Into<String>) -> Self {
        SyncError::MsgBad(msg.into())
    }

    pub fn box_bad(msg: impl Into<String>) -> Self {
        SyncError::BoxBad(msg.into())
    }

    pub fn store_bad(msg: impl Into<String>) -> Self {
        SyncError::StoreBad(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        SyncError::ConfigError(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        SyncError::Fatal(msg.into())
    }

    /// Whether this error should abort the entire store (session), as
    /// opposed to just the current mailbox or message.
    pub fn is_store_fatal(&self) -> bool {
        matches!(self, SyncError::StoreBad(_) | SyncError::Fatal(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::StoreBad(format!("I/O error: {}", e))
    }
}
