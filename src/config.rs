//! Runtime configuration: initialization options and request parameters.
//!
//! Both structs carry documented defaults obtained from plain `Default`
//! constructors; the C helpers copy these values into caller-owned structs.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VlmError};

/// Advanced initialization options for [`crate::handle::VlmHandle::initialize`].
///
/// Passing `None` to `initialize` is equivalent to `InitOptions::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOptions {
    /// Memory budget per device context in bytes. Default: 64 MiB.
    pub device_memory_bytes: u64,

    /// Batch size hint for device inference. Must be >= 1. Default: 8.
    ///
    /// The loaded embedding table must hold at least this many items.
    pub batch_size: u32,

    /// Maximum number of generation-cache entries retained per handle
    /// before least-recently-updated eviction. Must be >= 1. Default: 32.
    pub cache_entries: u32,
}

impl Default for InitOptions {
    fn default() -> Self {
        InitOptions {
            device_memory_bytes: 64 * 1024 * 1024,
            batch_size: 8,
            cache_entries: 32,
        }
    }
}

impl InitOptions {
    /// Reject option combinations no device context can satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.device_memory_bytes == 0 {
            return Err(VlmError::DeviceInit(
                "device memory budget must be non-zero".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(VlmError::DeviceInit("batch size must be >= 1".into()));
        }
        if self.cache_entries == 0 {
            return Err(VlmError::DeviceInit(
                "generation cache must hold at least one entry".into(),
            ));
        }
        Ok(())
    }
}

/// Per-request generation parameters.
///
/// Passing `None` to `chat_completions` is equivalent to
/// `RequestParams::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    /// Score scaling before ranking. Must be finite and > 0. Default: 1.0.
    pub temperature: f32,

    /// Upper bound on the candidate pool considered per turn.
    /// `0` means unbounded. Default: 50.
    pub top_k: u32,

    /// Number of recommended items emitted per turn. Must be >= 1.
    /// Default: 10.
    pub max_new_items: u32,
}

impl Default for RequestParams {
    fn default() -> Self {
        RequestParams {
            temperature: 1.0,
            top_k: 50,
            max_new_items: 10,
        }
    }
}

impl RequestParams {
    /// Reject parameter values with no defined generation behavior.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(VlmError::InvalidRequest(format!(
                "temperature must be finite and > 0, got {}",
                self.temperature
            )));
        }
        if self.max_new_items == 0 {
            return Err(VlmError::InvalidRequest(
                "max_new_items must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
