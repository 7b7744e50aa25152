//! The error type shared by every qlite crate.

use std::path::PathBuf;

use thiserror::Error;

/// Everything a qlite operation can fail with.
///
/// Backend failures keep their own variants and pass through the capture
/// layer untouched. The capture layer and the parameter binder add the
/// misuse, protocol and consistency variants.
#[derive(Error, Debug)]
pub enum QliteError {
    #[error("short read: wanted {expected} bytes, file had {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("cannot open '{path}'")]
    CannotOpen { path: PathBuf },

    /// Another connection holds a conflicting lock.
    #[error("database is busy")]
    Busy,

    #[error("lock request rejected: {detail}")]
    LockFailed { detail: String },

    #[error("WAL is corrupt: {detail}")]
    WalCorrupt { detail: String },

    /// Poll on a handle with no captured transaction.
    #[error("no pending transaction: nothing has been captured on this file")]
    NoPendingTransaction,

    /// Apply on a handle with no captured transaction.
    #[error("nothing to apply: no captured transaction on this file")]
    NothingToApply,

    /// The WAL restarted after the slice was captured.
    #[error(
        "stale WAL slice: captured under salts {captured:08x?}, WAL is now at {current:08x?}"
    )]
    StaleSlice {
        captured: [u32; 2],
        current: [u32; 2],
    },

    /// An operation would disturb a captured transaction.
    #[error("consistency violation: {detail}")]
    Consistency { detail: String },

    /// Tuple bytes that cannot be decoded into parameters.
    #[error("protocol error: {detail}")]
    Protocol { detail: String },

    #[error("bind index {index} out of range (statement has {count} parameters)")]
    Range { index: usize, count: usize },

    /// A transaction or payload larger than the format can describe.
    #[error("string or BLOB exceeds size limit")]
    TooBig,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unsupported operation")]
    Unsupported,

    #[error("file control {op} not handled by this file")]
    FileControlNotFound { op: &'static str },

    #[error("interrupted")]
    Interrupted,
}

/// SQLite primary result codes, numbered as in `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Internal = 2,
    Busy = 5,
    Interrupt = 9,
    IoErr = 10,
    Corrupt = 11,
    NotFound = 12,
    CantOpen = 14,
    Protocol = 15,
    TooBig = 18,
    Misuse = 21,
    NoLfs = 22,
    Range = 25,
}

/// How a caller of the capture layer should treat a failure.
///
/// Everything the wrapped backend reports is [`ErrorCategory::Backend`];
/// the other categories are raised by the capture layer or the binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Backend,
    NoPendingTransaction,
    NothingToApply,
    Protocol,
    Consistency,
}

impl QliteError {
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::ShortRead { .. } => ErrorCode::IoErr,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::Busy | Self::LockFailed { .. } => ErrorCode::Busy,
            Self::WalCorrupt { .. } => ErrorCode::Corrupt,
            Self::NoPendingTransaction
            | Self::NothingToApply
            | Self::StaleSlice { .. }
            | Self::Consistency { .. } => ErrorCode::Misuse,
            Self::Protocol { .. } => ErrorCode::Protocol,
            Self::Range { .. } => ErrorCode::Range,
            Self::TooBig => ErrorCode::TooBig,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Unsupported => ErrorCode::NoLfs,
            Self::FileControlNotFound { .. } => ErrorCode::NotFound,
            Self::Interrupted => ErrorCode::Interrupt,
        }
    }

    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NoPendingTransaction => ErrorCategory::NoPendingTransaction,
            Self::NothingToApply => ErrorCategory::NothingToApply,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::StaleSlice { .. } | Self::Consistency { .. } => ErrorCategory::Consistency,
            _ => ErrorCategory::Backend,
        }
    }

    /// A hint for the caller, where one exists.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy => Some("Retry once the captured transaction has been applied"),
            Self::NoPendingTransaction => Some("Poll only after a write transaction commits"),
            Self::NothingToApply => Some("Apply each captured transaction exactly once"),
            Self::StaleSlice { .. } => {
                Some("The WAL was reset after capture; re-read the slice from the new epoch")
            }
            Self::Protocol { .. } => Some("Check that client and server agree on the tuple format"),
            _ => None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    pub fn consistency(detail: impl Into<String>) -> Self {
        Self::Consistency {
            detail: detail.into(),
        }
    }

    pub fn wal_corrupt(detail: impl Into<String>) -> Self {
        Self::WalCorrupt {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QliteError>;
