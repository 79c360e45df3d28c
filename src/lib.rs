//! # vlm-runtime
//!
//! Generative-recommendation serving runtime behind an opaque,
//! C-callable inference handle.
//!
//! A handle moves through a small lifecycle (`Created` → `Initializing`
//! → `Ready`, with `Failed` recoverable and `Destroyed` terminal). Once
//! `Ready`, `chat_completions` turns a conversation into ranked item
//! recommendations: each session keeps a device-resident attention
//! profile, a behavior sequence, and a candidate pool in a bounded,
//! least-recently-updated cache. Requests run under a deadline and never
//! leave partially committed session state behind.
//!
//! The [`capi`] module exports the stable `vlm_*` C symbols; the rest of
//! the crate is the Rust-native API underneath them.
//!
//! ```no_run
//! use vlm_runtime::{ChatMessage, VlmHandle};
//!
//! let handle = VlmHandle::new();
//! handle.initialize("/models/rec-v1", "cuda:0", None)?;
//! let response = handle.chat_completions(
//!     "rec-v1",
//!     &[ChatMessage::user("recommend a winter jacket")],
//!     None,
//!     5_000,
//! );
//! assert!(response.is_success());
//! handle.destroy();
//! # Ok::<(), vlm_runtime::VlmError>(())
//! ```

pub mod capi;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod handle;
pub mod model;
pub mod ranker;
pub mod response;
pub mod weights;

pub use cache::{derive_session_key, GenerationCache, ItemId, SessionKey, TurnSnapshot};
pub use config::{InitOptions, RequestParams};
pub use device::{DeviceContextPool, DeviceDescriptor, DeviceKind, DeviceSpec, MemoryGauge};
pub use error::{Result, StatusCode, VlmError};
pub use executor::Ticket;
pub use handle::{HandleState, HandleStats, VlmHandle};
pub use model::{ModelBinding, ModelConfig, ModelLoader};
pub use ranker::{EmbeddingRanker, RankOutcome, RankingModel};
pub use response::{ChatMessage, Choice, Response};

/// Crate version, exported for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
