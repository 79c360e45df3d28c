//! Session-keyed generation cache.
//!
//! Each conversation owns one [`CacheEntry`] holding its behavior
//! sequence, candidate pool, and device-resident attention state. Entries
//! are shared as `Arc<Mutex<_>>`: a request locks its entry for the whole
//! turn, so at most one writer mutates a session at a time while requests
//! for other sessions proceed in parallel.
//!
//! Capacity is bounded; the least-recently-updated entry is evicted when
//! the cache is full or its devices report memory pressure. An entry that
//! is currently locked by a request (observable as an extra `Arc` strong
//! reference) is never evicted mid-turn.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::device::{DeviceAllocation, DeviceContextPool};
use crate::error::{Result, VlmError};
use crate::model::ModelBinding;
use crate::response::ChatMessage;

pub type SessionKey = u64;
pub type ItemId = u64;

/// Derive the cache key for a conversation.
///
/// The key hashes the model id together with the opening message, so a
/// conversation keeps hitting its own entry as later turns are appended.
pub fn derive_session_key(model_id: &str, messages: &[ChatMessage]) -> SessionKey {
    let mut hasher = DefaultHasher::new();
    model_id.hash(&mut hasher);
    if let Some(first) = messages.first() {
        first.role.hash(&mut hasher);
        first.content.hash(&mut hasher);
    }
    hasher.finish()
}

/// Device-resident attention summary for one session.
///
/// The profile is the running mean of the embeddings of every item the
/// session has interacted with.
#[derive(Debug)]
pub struct AttentionState {
    profile: Vec<f32>,
    turns: u64,
    /// Byte charge for the profile's device copy.
    _device: DeviceAllocation,
}

impl AttentionState {
    fn new(hidden_dim: usize, device: DeviceAllocation) -> Self {
        AttentionState {
            profile: vec![0.0; hidden_dim],
            turns: 0,
            _device: device,
        }
    }

    /// Fold one item embedding into the running-mean profile.
    fn fold(&mut self, embedding: &[f32]) {
        self.turns += 1;
        let n = self.turns as f32;
        for (slot, &value) in self.profile.iter_mut().zip(embedding) {
            *slot += (value - *slot) / n;
        }
    }

    pub fn profile(&self) -> &[f32] {
        &self.profile
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }
}

/// Read-only view of an entry taken at the start of a turn.
///
/// Workers rank against the snapshot; the entry itself is only mutated on
/// commit, so an aborted turn leaves no trace.
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    pub behavior_sequence: Vec<ItemId>,
    pub candidate_pool: Vec<ItemId>,
    pub profile: Vec<f32>,
    pub turns: u64,
}

/// Mutable per-session state.
#[derive(Debug)]
pub struct CacheEntry {
    behavior_sequence: Vec<ItemId>,
    candidate_pool: Vec<ItemId>,
    attention: AttentionState,
    updated_at: Instant,
}

impl CacheEntry {
    fn new(attention: AttentionState) -> Self {
        CacheEntry {
            behavior_sequence: Vec::new(),
            candidate_pool: Vec::new(),
            attention,
            updated_at: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot {
            behavior_sequence: self.behavior_sequence.clone(),
            candidate_pool: self.candidate_pool.clone(),
            profile: self.attention.profile.clone(),
            turns: self.attention.turns,
        }
    }

    /// Commit a completed turn: fold the turn's items into the attention
    /// profile, extend the behavior sequence, and install the refreshed
    /// candidate pool.
    pub fn commit_turn(
        &mut self,
        new_items: &[ItemId],
        ranked: &[ItemId],
        refreshed_pool: Vec<ItemId>,
        binding: &ModelBinding,
    ) {
        for &item in new_items {
            self.attention.fold(binding.embedding(item));
        }
        self.behavior_sequence.extend_from_slice(new_items);
        self.behavior_sequence.extend_from_slice(ranked);
        self.candidate_pool = refreshed_pool;
        self.updated_at = Instant::now();
    }

    pub fn behavior_len(&self) -> usize {
        self.behavior_sequence.len()
    }

    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }
}

struct CacheState {
    entries: HashMap<SessionKey, Arc<Mutex<CacheEntry>>>,
    /// Keys ordered least-recently-used first.
    lru: VecDeque<SessionKey>,
}

/// Bounded session cache for one handle.
pub struct GenerationCache {
    state: Mutex<CacheState>,
    capacity: usize,
    hidden_dim: usize,
}

impl GenerationCache {
    pub fn new(capacity: usize, hidden_dim: usize) -> Self {
        GenerationCache {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            hidden_dim,
        }
    }

    /// Fetch the entry for `key`, creating it if absent.
    ///
    /// Creation charges the attention profile to the pool's first context
    /// and may evict least-recently-updated entries to make room. Entries
    /// held by an in-flight request are skipped during eviction.
    pub fn lookup_or_create(
        &self,
        key: SessionKey,
        pool: &DeviceContextPool,
    ) -> Result<Arc<Mutex<CacheEntry>>> {
        let mut state = self.lock_state();

        if let Some(entry) = state.entries.get(&key) {
            let entry = entry.clone();
            promote(&mut state.lru, key);
            return Ok(entry);
        }

        while state.entries.len() >= self.capacity
            || (!state.entries.is_empty() && pool.memory_pressure())
        {
            if !evict_one(&mut state) {
                break;
            }
        }

        // Per-session state is a request-time allocation: exhaustion here
        // is an allocation failure, not a device-initialization one.
        let device = pool
            .alloc(0, self.hidden_dim * std::mem::size_of::<f32>())
            .map_err(|e| VlmError::Allocation(e.to_string()))?;
        let entry = Arc::new(Mutex::new(CacheEntry::new(AttentionState::new(
            self.hidden_dim,
            device,
        ))));
        state.entries.insert(key, entry.clone());
        state.lru.push_back(key);

        tracing::debug!(key, entries = state.entries.len(), "session entry created");
        Ok(entry)
    }

    /// Mark `key` as most recently used.
    pub fn touch(&self, key: SessionKey) {
        let mut state = self.lock_state();
        promote(&mut state.lru, key);
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current snapshot of an entry's behavior length, if the session
    /// exists. Introspection only.
    pub fn behavior_len(&self, key: SessionKey) -> Option<usize> {
        let state = self.lock_state();
        state.entries.get(&key).map(|entry| {
            entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .behavior_len()
        })
    }

    /// Entries mutate only through committed turns, so a lock poisoned by
    /// a panicked worker still guards consistent state and is reclaimed.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn promote(lru: &mut VecDeque<SessionKey>, key: SessionKey) {
    if let Some(pos) = lru.iter().position(|&k| k == key) {
        lru.remove(pos);
        lru.push_back(key);
    }
}

/// Evict the least-recently-used entry not held by a request. Returns
/// false when every entry is in use.
fn evict_one(state: &mut CacheState) -> bool {
    let victim = state.lru.iter().copied().find(|key| {
        state
            .entries
            .get(key)
            .map(|entry| Arc::strong_count(entry) == 1)
            .unwrap_or(false)
    });

    match victim {
        Some(key) => {
            state.entries.remove(&key);
            if let Some(pos) = state.lru.iter().position(|&k| k == key) {
                state.lru.remove(pos);
            }
            tracing::debug!(key, "evicted session entry");
            true
        }
        None => false,
    }
}
