//! C ABI surface.
//!
//! Exposes the handle as an opaque pointer with C-layout option, message,
//! and response structs. Conventions:
//!
//! - Null handles and null out-pointers are safe no-ops; request entry
//!   points report `kNotInitialized` / `kInvalidRequest` through the
//!   response status instead of crashing.
//! - Responses are deep copies. The caller owns the returned pointer and
//!   must release it with [`vlm_free_response`] exactly once.
//! - `vlm_destroy` is idempotent at the Rust level but the pointer must
//!   not be reused after the call.

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use crate::config::{InitOptions, RequestParams};
use crate::error::StatusCode;
use crate::handle::{HandleState, VlmHandle};
use crate::response::{ChatMessage, Response};

/// Opaque instance behind the C handle.
pub struct VlmInstance {
    inner: VlmHandle,
}

/// C-layout view of [`InitOptions`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VlmInitOptions {
    pub device_memory_bytes: u64,
    pub batch_size: u32,
    pub cache_entries: u32,
}

impl From<VlmInitOptions> for InitOptions {
    fn from(c: VlmInitOptions) -> Self {
        InitOptions {
            device_memory_bytes: c.device_memory_bytes,
            batch_size: c.batch_size,
            cache_entries: c.cache_entries,
        }
    }
}

/// C-layout view of [`RequestParams`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VlmRequestParams {
    pub temperature: f32,
    pub top_k: u32,
    pub max_new_items: u32,
}

impl From<VlmRequestParams> for RequestParams {
    fn from(c: VlmRequestParams) -> Self {
        RequestParams {
            temperature: c.temperature,
            top_k: c.top_k,
            max_new_items: c.max_new_items,
        }
    }
}

/// Caller-owned input message. Strings are borrowed for the call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VlmChatMessage {
    pub role: *const c_char,
    pub content: *const c_char,
}

/// Runtime-owned output message.
#[repr(C)]
#[derive(Debug)]
pub struct VlmResponseMessage {
    pub role: *mut c_char,
    pub content: *mut c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct VlmChoice {
    pub message: VlmResponseMessage,
}

/// Runtime-owned response. Release with [`vlm_free_response`].
#[repr(C)]
#[derive(Debug)]
pub struct VlmResponse {
    /// One of the `kSuccess`/`kNotInitialized`/... status values.
    pub status: i32,
    pub model_id: *mut c_char,
    pub created: u64,
    pub choices: *mut VlmChoice,
    pub choices_count: usize,
}

/// Allocate a handle in the `Created` state. Never fails.
#[no_mangle]
pub extern "C" fn vlm_create() -> *mut VlmInstance {
    Box::into_raw(Box::new(VlmInstance {
        inner: VlmHandle::new(),
    }))
}

/// Release a handle and everything it owns. Waits for in-flight
/// requests. Null is a no-op; the pointer must not be reused.
#[no_mangle]
pub unsafe extern "C" fn vlm_destroy(handle: *mut VlmInstance) {
    if handle.is_null() {
        return;
    }
    let instance = Box::from_raw(handle);
    instance.inner.destroy();
}

/// Fill `out` with the documented option defaults. Null is a no-op.
#[no_mangle]
pub unsafe extern "C" fn vlm_init_options_default(out: *mut VlmInitOptions) {
    if out.is_null() {
        return;
    }
    let defaults = InitOptions::default();
    *out = VlmInitOptions {
        device_memory_bytes: defaults.device_memory_bytes,
        batch_size: defaults.batch_size,
        cache_entries: defaults.cache_entries,
    };
}

/// Fill `out` with the documented parameter defaults. Null is a no-op.
#[no_mangle]
pub unsafe extern "C" fn vlm_request_params_default(out: *mut VlmRequestParams) {
    if out.is_null() {
        return;
    }
    let defaults = RequestParams::default();
    *out = VlmRequestParams {
        temperature: defaults.temperature,
        top_k: defaults.top_k,
        max_new_items: defaults.max_new_items,
    };
}

/// Bind devices and load the model. `options` may be null for defaults.
/// Returns true on success; on failure the handle is left `Failed` (or
/// untouched for a null handle) and the cause is logged.
#[no_mangle]
pub unsafe extern "C" fn vlm_initialize(
    handle: *mut VlmInstance,
    model_path: *const c_char,
    devices: *const c_char,
    options: *const VlmInitOptions,
) -> bool {
    let Some(instance) = handle.as_ref() else {
        return false;
    };
    let (Some(model_path), Some(devices)) = (borrow_str(model_path), borrow_str(devices)) else {
        return false;
    };
    let options = options.as_ref().map(|&o| InitOptions::from(o));

    instance.inner.initialize(model_path, devices, options).is_ok()
}

/// Serve one chat-completions turn.
///
/// `messages` must point to `messages_count` entries; `params` may be
/// null for defaults; `timeout_ms == 0` waits indefinitely. The outcome
/// travels in the response's `status` field. Returns null only if the
/// response itself cannot be built.
#[no_mangle]
pub unsafe extern "C" fn vlm_chat_completions(
    handle: *mut VlmInstance,
    model_id: *const c_char,
    messages: *const VlmChatMessage,
    messages_count: usize,
    timeout_ms: u32,
    params: *const VlmRequestParams,
) -> *mut VlmResponse {
    let model_id_str = borrow_str(model_id).unwrap_or("");

    let Some(instance) = handle.as_ref() else {
        return export_response(Response::status_only(
            StatusCode::NotInitialized,
            model_id_str,
        ));
    };
    // Readiness outranks request validation, same as the serve path.
    if instance.inner.state() != HandleState::Ready {
        return export_response(Response::status_only(
            StatusCode::NotInitialized,
            model_id_str,
        ));
    }

    let Some(messages) = borrow_messages(messages, messages_count) else {
        return export_response(Response::status_only(
            StatusCode::InvalidRequest,
            model_id_str,
        ));
    };
    if model_id.is_null() {
        return export_response(Response::status_only(
            StatusCode::InvalidRequest,
            model_id_str,
        ));
    }

    let params = params.as_ref().map(|&p| RequestParams::from(p));
    let response =
        instance
            .inner
            .chat_completions(model_id_str, &messages, params, u64::from(timeout_ms));
    export_response(response)
}

/// Release a response returned by [`vlm_chat_completions`]. Null is a
/// no-op; call exactly once per response.
#[no_mangle]
pub unsafe extern "C" fn vlm_free_response(response: *mut VlmResponse) {
    if response.is_null() {
        return;
    }
    let response = Box::from_raw(response);
    free_c_string(response.model_id);
    if !response.choices.is_null() {
        let choices = Vec::from_raw_parts(
            response.choices,
            response.choices_count,
            response.choices_count,
        );
        for choice in choices {
            free_c_string(choice.message.role);
            free_c_string(choice.message.content);
        }
    }
}

unsafe fn borrow_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Deep-copy the caller's message array. Returns `None` for a null array
/// with a non-zero count, or any null/non-UTF-8 field.
unsafe fn borrow_messages(
    messages: *const VlmChatMessage,
    count: usize,
) -> Option<Vec<ChatMessage>> {
    if count == 0 {
        return Some(Vec::new());
    }
    if messages.is_null() {
        return None;
    }
    let slice = std::slice::from_raw_parts(messages, count);
    let mut out = Vec::with_capacity(count);
    for message in slice {
        let role = borrow_str(message.role)?;
        let content = borrow_str(message.content)?;
        out.push(ChatMessage::new(role, content));
    }
    Some(out)
}

fn export_c_string(s: &str) -> *mut c_char {
    let bytes: Vec<u8> = s.bytes().filter(|&b| b != 0).collect();
    match CString::new(bytes) {
        Ok(c) => c.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

unsafe fn free_c_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

fn export_response(response: Response) -> *mut VlmResponse {
    let mut choices: Vec<VlmChoice> = response
        .choices
        .iter()
        .map(|choice| VlmChoice {
            message: VlmResponseMessage {
                role: export_c_string(&choice.message.role),
                content: export_c_string(&choice.message.content),
            },
        })
        .collect();
    choices.shrink_to_fit();

    let choices_count = choices.len();
    let choices_ptr = if choices_count == 0 {
        ptr::null_mut()
    } else {
        let mut boxed = choices.into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        std::mem::forget(boxed);
        ptr
    };

    Box::into_raw(Box::new(VlmResponse {
        status: response.status as i32,
        model_id: export_c_string(&response.model_id),
        created: response.created,
        choices: choices_ptr,
        choices_count,
    }))
}
