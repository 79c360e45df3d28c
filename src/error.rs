//! Error types and the status vocabulary for the VLM runtime.
//!
//! Every failure the runtime can produce maps totally onto [`StatusCode`],
//! the small vocabulary exposed across the C boundary. Internal call sites
//! work with [`VlmError`] and convert at the API edge via
//! [`VlmError::status`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VlmError>;

/// Status vocabulary reported in responses and across the C boundary.
///
/// The first four variants are the documented chat-completions outcomes;
/// the rest surface initialization and resource failures.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Success = 0,
    NotInitialized = 1,
    InvalidRequest = 2,
    Timeout = 3,
    InvalidDevices = 4,
    ModelLoadError = 5,
    DeviceInitError = 6,
    AllocationFailure = 7,
}

impl StatusCode {
    /// Human-readable label (for logging and diagnostics).
    pub fn label(&self) -> &'static str {
        match self {
            StatusCode::Success => "Success",
            StatusCode::NotInitialized => "NotInitialized",
            StatusCode::InvalidRequest => "InvalidRequest",
            StatusCode::Timeout => "Timeout",
            StatusCode::InvalidDevices => "InvalidDevices",
            StatusCode::ModelLoadError => "ModelLoadError",
            StatusCode::DeviceInitError => "DeviceInitError",
            StatusCode::AllocationFailure => "AllocationFailure",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Top-level error type for all runtime operations.
#[derive(Debug, Error)]
pub enum VlmError {
    #[error("invalid device string: {0}")]
    InvalidDevices(String),

    #[error("invalid model path: {0}")]
    InvalidModelPath(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("device initialization failed: {0}")]
    DeviceInit(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("handle not initialized")]
    NotInitialized,

    #[error("generation exceeded the request deadline")]
    Timeout,

    #[error("internal runtime failure: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VlmError {
    /// Collapse the error into the boundary status vocabulary.
    ///
    /// `Io`/`Json` only occur while resolving model artifacts, so they
    /// report as load failures. A worker that died mid-request is treated
    /// as a device-class resource failure.
    pub fn status(&self) -> StatusCode {
        match self {
            VlmError::InvalidDevices(_) => StatusCode::InvalidDevices,
            VlmError::InvalidModelPath(_) => StatusCode::ModelLoadError,
            VlmError::ModelLoad(_) => StatusCode::ModelLoadError,
            VlmError::DeviceInit(_) => StatusCode::DeviceInitError,
            VlmError::Allocation(_) => StatusCode::AllocationFailure,
            VlmError::InvalidRequest(_) => StatusCode::InvalidRequest,
            VlmError::NotInitialized => StatusCode::NotInitialized,
            VlmError::Timeout => StatusCode::Timeout,
            VlmError::Internal(_) => StatusCode::DeviceInitError,
            VlmError::Io(_) => StatusCode::ModelLoadError,
            VlmError::Json(_) => StatusCode::ModelLoadError,
        }
    }
}
