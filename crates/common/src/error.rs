//! Central error types for the codec session crates (thiserror-based).

use std::fmt;

use thiserror::Error;

use crate::types::SessionState;

// ---------------------------------------------------------------------------
// Driver status codes
// ---------------------------------------------------------------------------

/// Status code returned by a driver peer call.
///
/// Zero is success; everything else is a driver-defined failure. The named
/// constants cover the codes the controller reacts to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DriverStatus(pub i32);

impl DriverStatus {
    pub const OK: Self = Self(0);
    pub const FAILURE: Self = Self(-1);
    pub const NOT_SUPPORTED: Self = Self(-2);
    pub const INVALID_PARAM: Self = Self(-3);
    pub const INVALID_OBJECT: Self = Self(-4);
    pub const NO_MEMORY: Self = Self(-6);
    pub const TIMEOUT: Self = Self(-7);
    pub const INCORRECT_STATE: Self = Self(-10);
    /// Enumeration index past the last entry.
    pub const NO_MORE: Self = Self(-11);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Human-readable name for a status code.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "OK",
            -1 => "FAILURE",
            -2 => "NOT_SUPPORTED",
            -3 => "INVALID_PARAM",
            -4 => "INVALID_OBJECT",
            -6 => "NO_MEMORY",
            -7 => "TIMEOUT",
            -10 => "INCORRECT_STATE",
            -11 => "NO_MORE",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Map a driver status into a `CodecError::DriverCall` tagged with `op`.
pub fn check_status(status: DriverStatus, op: &'static str) -> CodecResult<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(CodecError::DriverCall { op, status })
    }
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Errors from the session controller, port buffer managers, and parameter
/// translation.
///
/// `Clone` so that one transition outcome can be reported to every thread
/// that waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Codec component '{component}' unavailable: {status}")]
    DriverUnavailable {
        component: String,
        status: DriverStatus,
    },

    #[error("Driver rejected command {command}: {status}")]
    CommandRejected {
        command: String,
        status: DriverStatus,
    },

    #[error("Driver call {op} failed: {status}")]
    DriverCall {
        op: &'static str,
        status: DriverStatus,
    },

    #[error("Driver reported fatal error {code:#x}")]
    DriverError { code: u32 },

    #[error("Port buffer count mismatch: port expects {expected}, got {actual}")]
    BufferCountMismatch { expected: u32, actual: usize },

    #[error("Buffer with backing id {backing} is not registered on this port")]
    UnknownBuffer { backing: u64 },

    #[error("Driver returned buffer {buffer_id} which is not in flight")]
    UnknownDescriptor { buffer_id: u32 },

    #[error("Unexpected session state: expected {expected}, got {actual}")]
    UnexpectedState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Codec session is closed")]
    SessionClosed,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CodecError {
    /// Whether the error leaves the session unusable until it is reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DriverUnavailable { .. } | Self::DriverError { .. } | Self::SessionClosed
        )
    }
}

/// Convenience Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

// ---------------------------------------------------------------------------
// Shared-memory pool errors
// ---------------------------------------------------------------------------

/// Shared-memory pool errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Requested {requested} bytes exceeds pool block size {block_size}")]
    TooLarge { requested: usize, block_size: usize },

    #[error("Pool exhausted: all {count} blocks are in use")]
    Exhausted { count: usize },

    #[error("Pool is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors loading or validating a session configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
