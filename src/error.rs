//! Error taxonomy for acquisition, device and accelerator failures

use std::time::Duration;

use thiserror::Error;

use crate::capture::session::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the acquisition pipeline
#[derive(Debug, Error)]
pub enum Error {
    #[error("no depth devices found")]
    NoDevice,

    #[error("failed to open device {index}: {reason}")]
    DeviceOpen { index: usize, reason: String },

    #[error("failed to reserve {bytes} bytes for {region} depth buffer: {reason}")]
    Allocation {
        bytes: usize,
        region: &'static str,
        reason: String,
    },

    #[error("payload is {actual} bytes, buffer holds {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("no frame within {0:?}")]
    FrameTimeout(Duration),

    #[error("cannot start streaming: {0}")]
    StreamStart(String),

    #[error("`{op}` is not valid while the session is {state:?}")]
    InvalidState { op: &'static str, state: SessionState },

    #[error("previous frame bundle has not been released")]
    FrameOutstanding,

    #[error("source is not initialized")]
    NotInitialized,

    #[error("frame {requested} is out of range (source holds {available})")]
    FrameOutOfRange { requested: u32, available: usize },

    #[error("accelerator error: {0}")]
    Accelerator(#[from] AcceleratorError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Errors reported by a device backend
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} is already claimed")]
    Busy(String),

    #[error("device {0} not found")]
    NotFound(String),

    #[error("device refused: {0}")]
    Refused(String),

    #[error("unsupported depth format: {0}")]
    UnsupportedFormat(String),

    #[error("capture thread panicked")]
    CaptureThread,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors reported by an accelerator memory backend
#[derive(Debug, Error)]
pub enum AcceleratorError {
    #[error("out of accelerator memory ({requested} bytes requested)")]
    OutOfMemory { requested: usize },

    #[error("region holds {capacity} bytes, transfer was {len}")]
    RegionSize { capacity: usize, len: usize },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("no accelerator adapter available")]
    Unavailable,
}
