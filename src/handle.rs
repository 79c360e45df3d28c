//! Inference handle lifecycle and request entry points.
//!
//! A [`VlmHandle`] owns one model binding, one device context pool, and
//! one generation cache, guarded by a single `RwLock`: requests hold the
//! read side for their whole duration, so `initialize` and `destroy`
//! (write side) wait for in-flight requests before touching resources.
//! Workers stranded by a timeout are stashed and joined at destroy time.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use uuid::Uuid;

use crate::cache::{derive_session_key, GenerationCache, ItemId};
use crate::config::{InitOptions, RequestParams};
use crate::device::{DeviceContextPool, DeviceSpec, MemoryGauge};
use crate::error::{Result, StatusCode, VlmError};
use crate::executor::{execute, RequestJob};
use crate::model::{ModelBinding, ModelLoader};
use crate::ranker::{message_item_id, EmbeddingRanker, RankingModel};
use crate::response::{format_items, ChatMessage, Choice, Response};

/// Lifecycle states of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Allocated, no resources bound.
    Created,
    /// Binding devices and loading weights.
    Initializing,
    /// Serving requests.
    Ready,
    /// Initialization failed; resources released. Re-initializable.
    Failed,
    /// Terminal. All resources released.
    Destroyed,
}

impl HandleState {
    pub fn label(&self) -> &'static str {
        match self {
            HandleState::Created => "created",
            HandleState::Initializing => "initializing",
            HandleState::Ready => "ready",
            HandleState::Failed => "failed",
            HandleState::Destroyed => "destroyed",
        }
    }

    /// Legal lifecycle transitions. `Destroyed` is terminal.
    pub fn can_transition_to(&self, next: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (self, next),
            (Created, Initializing)
                | (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, Initializing)
                | (Failed, Initializing)
                | (Created, Destroyed)
                | (Initializing, Destroyed)
                | (Ready, Destroyed)
                | (Failed, Destroyed)
        )
    }
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

struct HandleInner {
    state: HandleState,
    options: InitOptions,
    binding: Option<Arc<ModelBinding>>,
    devices: Option<Arc<DeviceContextPool>>,
    cache: Option<Arc<GenerationCache>>,
    ranker: Arc<dyn RankingModel>,
}

impl HandleInner {
    fn transition(&mut self, handle_id: Uuid, next: HandleState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(VlmError::InvalidRequest(format!(
                "handle {handle_id} cannot move from {} to {}",
                self.state, next
            )));
        }
        tracing::info!(handle = %handle_id, from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }

    fn release_resources(&mut self) {
        // Session state first, then the model, then the contexts it was
        // charged to.
        self.cache = None;
        self.binding = None;
        self.devices = None;
    }
}

/// Point-in-time observability snapshot of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleStats {
    pub state: HandleState,
    pub cache_entries: usize,
    pub device_bytes: usize,
}

/// The runtime object behind one opaque C handle.
pub struct VlmHandle {
    id: Uuid,
    inner: RwLock<HandleInner>,
    /// Workers stranded by request timeouts, joined at destroy.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl VlmHandle {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        tracing::info!(handle = %id, "handle created");
        VlmHandle {
            id,
            inner: RwLock::new(HandleInner {
                state: HandleState::Created,
                options: InitOptions::default(),
                binding: None,
                devices: None,
                cache: None,
                ranker: Arc::new(EmbeddingRanker),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> HandleState {
        self.inner.read().unwrap().state
    }

    /// Bind devices and load the model. Re-initializing a `Ready` or
    /// `Failed` handle releases the previous resources first. Waits for
    /// in-flight requests.
    pub fn initialize(
        &self,
        model_path: &str,
        devices: &str,
        options: Option<InitOptions>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.transition(self.id, HandleState::Initializing)?;
        inner.release_resources();

        let options = options.unwrap_or_default();
        match Self::bind(model_path, devices, &options) {
            Ok((pool, binding, cache)) => {
                inner.options = options;
                inner.devices = Some(Arc::new(pool));
                inner.binding = Some(Arc::new(binding));
                inner.cache = Some(Arc::new(cache));
                inner.transition(self.id, HandleState::Ready)?;
                Ok(())
            }
            Err(err) => {
                inner.release_resources();
                inner.transition(self.id, HandleState::Failed)?;
                tracing::error!(handle = %self.id, error = %err, "initialization failed");
                Err(err)
            }
        }
    }

    fn bind(
        model_path: &str,
        devices: &str,
        options: &InitOptions,
    ) -> Result<(DeviceContextPool, ModelBinding, GenerationCache)> {
        options.validate()?;
        let spec = DeviceSpec::parse(devices)?;
        let pool = DeviceContextPool::acquire(&spec, options)?;
        let binding = ModelLoader::load(model_path, &pool, options)?;
        let cache = GenerationCache::new(options.cache_entries as usize, binding.hidden_dim());
        Ok((pool, binding, cache))
    }

    /// Serve one chat-completions turn. The outcome travels in the
    /// response's status; failures never tear the handle down.
    pub fn chat_completions(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: Option<RequestParams>,
        timeout_ms: u64,
    ) -> Response {
        // Read guard held for the whole request: destroy and re-init
        // wait for us.
        let inner = self.inner.read().unwrap();
        if inner.state != HandleState::Ready {
            return Response::status_only(StatusCode::NotInitialized, model_id);
        }

        match self.serve(&inner, model_id, messages, params, timeout_ms) {
            Ok(items) => Response::success(
                model_id,
                vec![Choice {
                    message: ChatMessage::assistant(format_items(&items)),
                }],
            ),
            Err(err) => {
                tracing::warn!(handle = %self.id, error = %err, "request failed");
                Response::status_only(err.status(), model_id)
            }
        }
    }

    fn serve(
        &self,
        inner: &HandleInner,
        model_id: &str,
        messages: &[ChatMessage],
        params: Option<RequestParams>,
        timeout_ms: u64,
    ) -> Result<Vec<ItemId>> {
        // Ready state guarantees these are bound.
        let binding = inner
            .binding
            .clone()
            .ok_or_else(|| VlmError::NotInitialized)?;
        let pool = inner
            .devices
            .clone()
            .ok_or_else(|| VlmError::NotInitialized)?;
        let cache = inner
            .cache
            .clone()
            .ok_or_else(|| VlmError::NotInitialized)?;

        let params = params.unwrap_or_default();
        params.validate()?;
        validate_request(binding.model_id(), model_id, messages)?;

        let key = derive_session_key(model_id, messages);
        let entry = cache.lookup_or_create(key, &pool)?;
        let new_items = turn_items(messages, binding.num_items());

        let job = RequestJob {
            binding,
            entry,
            ranker: inner.ranker.clone(),
            params,
            new_items,
        };
        let (result, lingering) = execute(job, timeout_ms);
        if let Some(worker) = lingering {
            self.workers.lock().unwrap().push(worker);
        }
        cache.touch(key);
        result
    }

    /// Release everything. Idempotent; waits for in-flight requests and
    /// joins workers stranded by timeouts.
    pub fn destroy(&self) {
        {
            // A panicked request may have poisoned the lock; teardown
            // must still run, so reclaim the guard.
            let mut inner = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if inner.state == HandleState::Destroyed {
                return;
            }
            // Transitions to Destroyed are legal from every live state.
            let _ = inner.transition(self.id, HandleState::Destroyed);
            inner.release_resources();
        }

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(handle = %self.id, "stranded worker panicked");
            }
        }
        tracing::info!(handle = %self.id, "handle destroyed");
    }

    /// Swap the ranking model. Test seam.
    pub fn set_ranker(&self, ranker: Arc<dyn RankingModel>) {
        self.inner.write().unwrap().ranker = ranker;
    }

    /// Byte gauge of the bound device pool, if any. The gauge stays
    /// observable after destroy.
    pub fn device_memory_gauge(&self) -> Option<MemoryGauge> {
        self.inner
            .read()
            .unwrap()
            .devices
            .as_ref()
            .map(|pool| pool.gauge())
    }

    pub fn stats(&self) -> HandleStats {
        let inner = self.inner.read().unwrap();
        HandleStats {
            state: inner.state,
            cache_entries: inner
                .cache
                .as_ref()
                .map(|cache| cache.len())
                .unwrap_or(0),
            device_bytes: inner
                .devices
                .as_ref()
                .map(|pool| pool.gauge().bytes())
                .unwrap_or(0),
        }
    }

    pub fn cache_len(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .cache
            .as_ref()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }

    /// Committed behavior-sequence length for a conversation's session.
    pub fn session_history_len(&self, model_id: &str, messages: &[ChatMessage]) -> Option<usize> {
        let inner = self.inner.read().unwrap();
        let cache = inner.cache.as_ref()?;
        cache.behavior_len(derive_session_key(model_id, messages))
    }
}

impl Default for VlmHandle {
    fn default() -> Self {
        VlmHandle::new()
    }
}

impl Drop for VlmHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn validate_request(bound_model: &str, model_id: &str, messages: &[ChatMessage]) -> Result<()> {
    if model_id != bound_model {
        return Err(VlmError::InvalidRequest(format!(
            "model {model_id:?} is not loaded (bound: {bound_model:?})"
        )));
    }
    // An empty message list is a valid cold-start turn: it serves from
    // the model's default session with no new behavior items.
    for (i, message) in messages.iter().enumerate() {
        if message.role.is_empty() {
            return Err(VlmError::InvalidRequest(format!(
                "message {i} has an empty role"
            )));
        }
        if message.content.is_empty() {
            return Err(VlmError::InvalidRequest(format!(
                "message {i} has empty content"
            )));
        }
    }
    Ok(())
}

/// The turn's uncommitted input: item ids of the user messages after the
/// last assistant message. Earlier turns were committed when they were
/// served, so resending the transcript does not double-count them.
fn turn_items(messages: &[ChatMessage], num_items: usize) -> Vec<ItemId> {
    let start = messages
        .iter()
        .rposition(|m| m.role == "assistant")
        .map(|pos| pos + 1)
        .unwrap_or(0);
    messages[start..]
        .iter()
        .filter(|m| m.role == "user")
        .map(|m| message_item_id(&m.content, num_items))
        .collect()
}
