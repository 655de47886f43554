//! Status codes and the synchronous error surface.
//!
//! Every call returns a [`Status`] (directly or through [`PalmError::status`])
//! and every delivered message carries one. Operational failures of a valid
//! request are never returned here; they travel inside the result message.

use serde::{Deserialize, Serialize};

/// Outcome codes shared by synchronous calls and delivered messages.
///
/// Numeric values are stable and safe to ship to a remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Timeout = 1,
    MemoryLeak = 2,
    UnknownError = 0x8000,
    InvalidHandle = 0x8001,
    InvalidArgument = 0x8002,
    OutOfMemory = 0x8003,
    UnexpectedRequest = 0x8004,
    InvalidLicense = 0x8005,
    InvalidModel = 0x8006,
    ServerConnectionError = 0x8007,
    SerializationError = 0x8008,
    /// Capture finished without a template because the liveness check failed.
    LivenessFailed = 0x8009,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let status = match code {
            0 => Status::Success,
            1 => Status::Timeout,
            2 => Status::MemoryLeak,
            0x8000 => Status::UnknownError,
            0x8001 => Status::InvalidHandle,
            0x8002 => Status::InvalidArgument,
            0x8003 => Status::OutOfMemory,
            0x8004 => Status::UnexpectedRequest,
            0x8005 => Status::InvalidLicense,
            0x8006 => Status::InvalidModel,
            0x8007 => Status::ServerConnectionError,
            0x8008 => Status::SerializationError,
            0x8009 => Status::LivenessFailed,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Codes with the high bit set are errors; the rest are informational.
    pub fn is_error(self) -> bool {
        self.code() & 0x8000 != 0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::Timeout => "timeout",
            Status::MemoryLeak => "memory leak",
            Status::UnknownError => "unknown error",
            Status::InvalidHandle => "invalid handle",
            Status::InvalidArgument => "invalid argument",
            Status::OutOfMemory => "out of memory",
            Status::UnexpectedRequest => "unexpected request",
            Status::InvalidLicense => "invalid license",
            Status::InvalidModel => "invalid model",
            Status::ServerConnectionError => "server connection error",
            Status::SerializationError => "serialization error",
            Status::LivenessFailed => "liveness failed",
        };
        write!(f, "{} (0x{:04x})", s, self.code())
    }
}

/// Errors returned synchronously by session and configuration calls.
#[derive(Debug, thiserror::Error)]
pub enum PalmError {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected request: {0}")]
    UnexpectedRequest(String),

    #[error("invalid license: {0}")]
    InvalidLicense(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("{outstanding} delivered message(s) were never released")]
    MemoryLeak { outstanding: usize },

    #[error("buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("server connection error: {0}")]
    ServerConnection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PalmError {
    pub fn status(&self) -> Status {
        match self {
            PalmError::InvalidHandle => Status::InvalidHandle,
            PalmError::InvalidArgument(_) => Status::InvalidArgument,
            PalmError::UnexpectedRequest(_) => Status::UnexpectedRequest,
            PalmError::InvalidLicense(_) => Status::InvalidLicense,
            PalmError::InvalidModel(_) => Status::InvalidModel,
            PalmError::MemoryLeak { .. } => Status::MemoryLeak,
            PalmError::BufferTooSmall { .. } => Status::OutOfMemory,
            PalmError::Serialization(_) => Status::SerializationError,
            PalmError::ServerConnection(_) => Status::ServerConnectionError,
            PalmError::Internal(_) => Status::UnknownError,
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        PalmError::InvalidArgument(msg.into())
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        PalmError::Internal(format!("{} lock poisoned", what))
    }
}

pub type PalmResult<T> = std::result::Result<T, PalmError>;
