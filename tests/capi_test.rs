//! End-to-end exercise of the exported C symbols.

mod common;

use std::ffi::{CStr, CString};
use std::ptr;

use vlm_runtime::capi::{
    vlm_chat_completions, vlm_create, vlm_destroy, vlm_free_response, vlm_init_options_default,
    vlm_initialize, vlm_request_params_default, VlmChatMessage, VlmInitOptions,
    VlmRequestParams,
};
use vlm_runtime::StatusCode;

fn status(code: StatusCode) -> i32 {
    code as i32
}

fn c_path(dir: &tempfile::TempDir) -> CString {
    CString::new(dir.path().to_str().unwrap()).unwrap()
}

#[test]
fn full_round_trip() {
    common::init_tracing();
    let model = common::model_dir("rec-v1", 32, 8);
    let model_path = c_path(&model);
    let devices = CString::new("cuda:0").unwrap();
    let model_id = CString::new("rec-v1").unwrap();

    let handle = vlm_create();
    assert!(!handle.is_null());

    unsafe {
        let mut options = VlmInitOptions {
            device_memory_bytes: 0,
            batch_size: 0,
            cache_entries: 0,
        };
        vlm_init_options_default(&mut options);
        assert!(vlm_initialize(
            handle,
            model_path.as_ptr(),
            devices.as_ptr(),
            &options
        ));

        let mut params = VlmRequestParams {
            temperature: 0.0,
            top_k: 0,
            max_new_items: 0,
        };
        vlm_request_params_default(&mut params);

        let role = CString::new("user").unwrap();
        let content = CString::new("recommend a winter jacket").unwrap();
        let messages = [VlmChatMessage {
            role: role.as_ptr(),
            content: content.as_ptr(),
        }];

        let response = vlm_chat_completions(
            handle,
            model_id.as_ptr(),
            messages.as_ptr(),
            messages.len(),
            5_000,
            &params,
        );
        assert!(!response.is_null());
        assert_eq!((*response).status, status(StatusCode::Success));
        assert_eq!((*response).choices_count, 1);
        assert!((*response).created > 0);

        let returned_model = CStr::from_ptr((*response).model_id).to_str().unwrap();
        assert_eq!(returned_model, "rec-v1");

        let choice = &*(*response).choices;
        let text = CStr::from_ptr(choice.message.content).to_str().unwrap();
        assert!(text.starts_with("items: "));
        let role = CStr::from_ptr(choice.message.role).to_str().unwrap();
        assert_eq!(role, "assistant");

        vlm_free_response(response);
        vlm_destroy(handle);
    }
}

#[test]
fn request_before_initialize_reports_not_initialized() {
    let handle = vlm_create();
    let model_id = CString::new("rec-v1").unwrap();
    let role = CString::new("user").unwrap();
    let content = CString::new("hi").unwrap();
    let messages = [VlmChatMessage {
        role: role.as_ptr(),
        content: content.as_ptr(),
    }];

    unsafe {
        let response = vlm_chat_completions(
            handle,
            model_id.as_ptr(),
            messages.as_ptr(),
            messages.len(),
            0,
            ptr::null(),
        );
        assert_eq!((*response).status, status(StatusCode::NotInitialized));
        assert_eq!((*response).choices_count, 0);
        assert!((*response).choices.is_null());
        vlm_free_response(response);
        vlm_destroy(handle);
    }
}

#[test]
fn initialize_rejects_bad_inputs() {
    let model = common::model_dir("rec-v1", 32, 8);
    let model_path = c_path(&model);
    let bad_devices = CString::new("tpu:0").unwrap();
    let devices = CString::new("cuda:0").unwrap();
    let bad_path = CString::new("/nonexistent/model").unwrap();

    let handle = vlm_create();
    unsafe {
        assert!(!vlm_initialize(
            handle,
            model_path.as_ptr(),
            bad_devices.as_ptr(),
            ptr::null()
        ));
        assert!(!vlm_initialize(
            handle,
            bad_path.as_ptr(),
            devices.as_ptr(),
            ptr::null()
        ));
        assert!(!vlm_initialize(
            handle,
            ptr::null(),
            devices.as_ptr(),
            ptr::null()
        ));
        assert!(!vlm_initialize(
            ptr::null_mut(),
            model_path.as_ptr(),
            devices.as_ptr(),
            ptr::null()
        ));

        // The handle recovers from failed attempts.
        assert!(vlm_initialize(
            handle,
            model_path.as_ptr(),
            devices.as_ptr(),
            ptr::null()
        ));
        vlm_destroy(handle);
    }
}

#[test]
fn null_message_array_with_nonzero_count_is_invalid() {
    let model = common::model_dir("rec-v1", 32, 8);
    let model_path = c_path(&model);
    let devices = CString::new("cuda:0").unwrap();
    let model_id = CString::new("rec-v1").unwrap();

    let handle = vlm_create();
    unsafe {
        assert!(vlm_initialize(
            handle,
            model_path.as_ptr(),
            devices.as_ptr(),
            ptr::null()
        ));
        let response =
            vlm_chat_completions(handle, model_id.as_ptr(), ptr::null(), 3, 0, ptr::null());
        assert_eq!((*response).status, status(StatusCode::InvalidRequest));
        vlm_free_response(response);
        vlm_destroy(handle);
    }
}

#[test]
fn null_handle_and_null_frees_are_safe() {
    unsafe {
        vlm_destroy(ptr::null_mut());
        vlm_free_response(ptr::null_mut());
        vlm_init_options_default(ptr::null_mut());
        vlm_request_params_default(ptr::null_mut());

        let model_id = CString::new("rec-v1").unwrap();
        let response = vlm_chat_completions(
            ptr::null_mut(),
            model_id.as_ptr(),
            ptr::null(),
            0,
            0,
            ptr::null(),
        );
        assert_eq!((*response).status, status(StatusCode::NotInitialized));
        vlm_free_response(response);
    }
}
