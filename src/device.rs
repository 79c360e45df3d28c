//! Device selection and per-device execution contexts.
//!
//! The device mini-language (`"cuda:0,1"`, `"npu:2"`, `"auto"`) is parsed
//! into a validated [`DeviceSpec`] before any resource is touched.
//! [`DeviceContextPool`] then acquires one execution context per resolved
//! descriptor, all-or-nothing: a failure while acquiring releases every
//! context already acquired.
//!
//! Driver and kernel execution are out of scope here; contexts model the
//! orchestration-relevant surface — an ordered stream id and a memory pool
//! with atomic byte accounting. The [`MemoryGauge`] is cloneable so leak
//! checks can observe pool usage after the pool itself is gone.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::InitOptions;
use crate::error::{Result, VlmError};

/// Ordinals visible per device kind. Driver probing is out of scope, so
/// the inventory is fixed; ordinals at or above this bound are rejected
/// as unavailable.
pub const VISIBLE_ORDINALS: u32 = 8;

/// Accelerator families the runtime can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cuda,
    Npu,
}

impl DeviceKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Npu => "npu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub ordinal: u32,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.label(), self.ordinal)
    }
}

/// Parsed, validated device selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Defer placement to the first-fit policy.
    Auto,
    /// Explicit kind with a non-empty, duplicate-free ordinal list.
    Explicit {
        kind: DeviceKind,
        ordinals: Vec<u32>,
    },
}

impl DeviceSpec {
    /// Parse a device string.
    ///
    /// Grammar: `"<kind>:<ordinal>[,<ordinal>...]"` with
    /// `kind ∈ {cuda, npu}` (case-insensitive), or the literal `"auto"`.
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(VlmError::InvalidDevices("empty device string".into()));
        }
        if s.eq_ignore_ascii_case("auto") {
            return Ok(DeviceSpec::Auto);
        }

        let (kind_str, list) = s.split_once(':').ok_or_else(|| {
            VlmError::InvalidDevices(format!("expected '<kind>:<ordinals>' or 'auto', got {s:?}"))
        })?;

        let kind = match kind_str.to_ascii_lowercase().as_str() {
            "cuda" => DeviceKind::Cuda,
            "npu" => DeviceKind::Npu,
            other => {
                return Err(VlmError::InvalidDevices(format!(
                    "unknown device kind {other:?} (expected cuda or npu)"
                )))
            }
        };

        if list.is_empty() {
            return Err(VlmError::InvalidDevices(format!(
                "empty ordinal list in {s:?}"
            )));
        }

        let mut ordinals = Vec::new();
        for part in list.split(',') {
            if part.is_empty() {
                return Err(VlmError::InvalidDevices(format!(
                    "empty ordinal in {s:?}"
                )));
            }
            let ordinal: u32 = part.parse().map_err(|_| {
                VlmError::InvalidDevices(format!("invalid ordinal {part:?} in {s:?}"))
            })?;
            if ordinals.contains(&ordinal) {
                return Err(VlmError::InvalidDevices(format!(
                    "duplicate ordinal {ordinal} in {s:?}"
                )));
            }
            ordinals.push(ordinal);
        }

        Ok(DeviceSpec::Explicit { kind, ordinals })
    }

    /// Resolve to concrete descriptors. `auto` places first-fit on the
    /// default kind's first ordinal.
    pub fn resolve(&self) -> Vec<DeviceDescriptor> {
        match self {
            DeviceSpec::Auto => vec![DeviceDescriptor {
                kind: DeviceKind::Cuda,
                ordinal: 0,
            }],
            DeviceSpec::Explicit { kind, ordinals } => ordinals
                .iter()
                .map(|&ordinal| DeviceDescriptor {
                    kind: *kind,
                    ordinal,
                })
                .collect(),
        }
    }
}

/// Cloneable atomic byte counter shared by a pool and its allocations.
///
/// Survives the pool it came from, so tests can verify that device memory
/// returns to zero after `destroy`.
#[derive(Debug, Clone, Default)]
pub struct MemoryGauge(Arc<AtomicUsize>);

impl MemoryGauge {
    pub fn bytes(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }

    fn sub(&self, n: usize) {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(n);
            match self
                .0
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// One bound execution context: a stream/queue plus a memory pool.
#[derive(Debug)]
pub struct DeviceContext {
    descriptor: DeviceDescriptor,
    stream_id: u64,
    budget: usize,
    used: Arc<AtomicUsize>,
}

impl DeviceContext {
    pub fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// RAII handle for bytes charged to one device context.
///
/// Dropping returns the bytes to the context pool and the shared gauge,
/// so rollback of partial acquisitions is automatic.
#[derive(Debug)]
pub struct DeviceAllocation {
    bytes: usize,
    context_used: Arc<AtomicUsize>,
    gauge: MemoryGauge,
}

impl DeviceAllocation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.context_used.fetch_sub(self.bytes, Ordering::SeqCst);
        self.gauge.sub(self.bytes);
    }
}

/// Owns the execution contexts for one handle.
#[derive(Debug)]
pub struct DeviceContextPool {
    contexts: Vec<DeviceContext>,
    gauge: MemoryGauge,
}

impl DeviceContextPool {
    /// Acquire one context per descriptor of `spec`, all-or-nothing.
    ///
    /// Fails with `InvalidDevices` for ordinals outside the visible
    /// inventory and `DeviceInit` for unsatisfiable options. Contexts
    /// acquired before a failure are released by drop.
    pub fn acquire(spec: &DeviceSpec, options: &InitOptions) -> Result<Self> {
        options.validate()?;

        let descriptors = spec.resolve();
        let mut contexts = Vec::with_capacity(descriptors.len());
        for (stream_id, descriptor) in descriptors.into_iter().enumerate() {
            if descriptor.ordinal >= VISIBLE_ORDINALS {
                // Partial acquisitions in `contexts` are dropped here.
                return Err(VlmError::InvalidDevices(format!(
                    "{descriptor} unavailable (visible ordinals: 0..{VISIBLE_ORDINALS})"
                )));
            }
            contexts.push(DeviceContext {
                descriptor,
                stream_id: stream_id as u64,
                budget: options.device_memory_bytes as usize,
                used: Arc::new(AtomicUsize::new(0)),
            });
        }

        tracing::debug!(
            contexts = contexts.len(),
            budget_bytes = options.device_memory_bytes,
            "acquired device contexts"
        );

        Ok(DeviceContextPool {
            contexts,
            gauge: MemoryGauge::default(),
        })
    }

    pub fn contexts(&self) -> &[DeviceContext] {
        &self.contexts
    }

    /// Shared byte gauge across all contexts of this pool.
    pub fn gauge(&self) -> MemoryGauge {
        self.gauge.clone()
    }

    /// Charge `bytes` to the context at `index`.
    pub fn alloc(&self, index: usize, bytes: usize) -> Result<DeviceAllocation> {
        let ctx = self.contexts.get(index).ok_or_else(|| {
            VlmError::DeviceInit(format!("no device context at index {index}"))
        })?;

        let previous = ctx.used.fetch_add(bytes, Ordering::SeqCst);
        if previous + bytes > ctx.budget {
            ctx.used.fetch_sub(bytes, Ordering::SeqCst);
            return Err(VlmError::DeviceInit(format!(
                "out of device memory on {}: {} + {} exceeds budget {}",
                ctx.descriptor,
                previous,
                bytes,
                ctx.budget
            )));
        }

        self.gauge.add(bytes);
        Ok(DeviceAllocation {
            bytes,
            context_used: ctx.used.clone(),
            gauge: self.gauge.clone(),
        })
    }

    /// Charge `bytes` to every context (weight upload), all-or-nothing.
    pub fn alloc_on_all(&self, bytes: usize) -> Result<Vec<DeviceAllocation>> {
        let mut allocations = Vec::with_capacity(self.contexts.len());
        for index in 0..self.contexts.len() {
            // On failure the partial vec drops, returning its bytes.
            allocations.push(self.alloc(index, bytes)?);
        }
        Ok(allocations)
    }

    /// Whether any context is running low on memory (>= 3/4 of budget).
    ///
    /// The generation cache uses this to trigger eviction of the
    /// least-recently-updated entry.
    pub fn memory_pressure(&self) -> bool {
        self.contexts
            .iter()
            .any(|ctx| ctx.used_bytes() * 4 >= ctx.budget * 3)
    }
}
