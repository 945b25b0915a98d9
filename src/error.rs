//! Error type shared by every layer of the crate.

use std::fmt;

use crate::gpu::NativeError;

/// Errors returned by devices, fences, memory, pools and interop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A native GPU call failed. Already logged with its native code.
    Device(NativeError),
    /// The pool is inactive or being torn down.
    Flushing,
    /// The pool has no free memory and may not grow (non-blocking acquire only).
    PoolExhausted,
    /// The requested shape cannot be served by this device.
    UnsupportedShape(String),
    /// A foreign resource could not be registered; use the host copy path.
    InteropUnavailable(String),
    /// The operation is not allowed in the current state.
    InvalidState(&'static str),
    /// Source and destination of a copy are incompatible.
    InvalidCopy(&'static str),
    /// A bounded wait elapsed.
    TimedOut,
}

impl FrameError {
    /// Whether this error is an expected part of pool shutdown.
    pub fn is_flushing(&self) -> bool {
        matches!(self, FrameError::Flushing)
    }

    /// The native error code, if this is a device error.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            FrameError::Device(err) => Some(err.code),
            _ => None,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Device(err) => write!(f, "Device error: {}", err),
            FrameError::Flushing => write!(f, "Pool is flushing"),
            FrameError::PoolExhausted => write!(f, "Pool exhausted"),
            FrameError::UnsupportedShape(msg) => write!(f, "Unsupported shape: {}", msg),
            FrameError::InteropUnavailable(msg) => write!(f, "Interop unavailable: {}", msg),
            FrameError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            FrameError::InvalidCopy(msg) => write!(f, "Invalid copy: {}", msg),
            FrameError::TimedOut => write!(f, "Timed out"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NativeError> for FrameError {
    fn from(err: NativeError) -> Self {
        FrameError::Device(err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FrameError>;
