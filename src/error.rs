//! Crate-wide error type for the RDMA file transfer engine.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type used throughout the stream engine.
pub type Result<T> = std::result::Result<T, RftpError>;

/// Errors that can occur while bringing up a connection or streaming a file.
///
/// Each variant corresponds to one of the error kinds named in the design:
/// a coarse classification, not a detailed trace. The first distinct
/// failure on any given operation wins; nothing here retries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RftpError {
    /// Config file malformed or a value was out of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Device enumeration, open, PD allocation, or QP modify failed.
    #[error("device error: {0}")]
    Device(String),

    /// No free bytes left in the device registry to register another MR.
    #[error("resource exhausted: requested {requested} bytes, {free} free")]
    ResourceExhausted {
        /// Bytes requested by the failed `create_mr` call.
        requested: usize,
        /// Bytes actually free in the registry at the time of the call.
        free: usize,
    },

    /// A regular-file open failed.
    #[error("failed to open {path}: {source}")]
    IoOpen {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A read or write against an already-open file failed mid-transfer,
    /// as distinct from [`RftpError::IoOpen`]'s failure to open it at all.
    #[error("I/O error transferring {path}: {source}")]
    IoTransfer {
        /// Path being read or written.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A TCP side-channel exchange was short or otherwise failed.
    #[error("side-channel sync failed: {0}")]
    SyncFailure(String),

    /// The peer did not answer with the expected readiness token, or the
    /// TCP connect failed after the socket was created. Reported distinctly
    /// from `InvalidConfig` so a caller can surface "server not online".
    #[error("peer not ready: {0}")]
    NotReady(String),

    /// A work completion reported a non-success status.
    #[error("work completion failed: {0}")]
    WorkCompletionError(String),

    /// The peer closed the TCP side channel mid-transfer.
    #[error("peer closed the connection mid-transfer")]
    PeerClosed,

    /// The file was not found or could not be stat'd.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Local cancellation signal was honored.
    #[error("transfer cancelled")]
    Cancelled,

    /// Catch-all for underlying OS I/O errors that don't fit a more
    /// specific variant above.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RftpError {
    /// True for the one kind the UI is expected to surface as "server not
    /// online" rather than as a generic setup failure.
    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        matches!(self, RftpError::NotReady(_))
    }
}
