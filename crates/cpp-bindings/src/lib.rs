//! C ABI over the lifecycle manager.
//!
//! Every call blocks on a runtime owned by the handle. Results come back as
//! JSON strings the caller releases with `local_inference_free_string`:
//! `{"ok": <value>}` on success, `{"error": {"kind", "message", "retryable"}}`
//! on failure.

use local_inference::{Config, HardwareTier, LifecycleError, LifecycleManager};
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use tokio::runtime::Runtime;

/// Opaque to C callers.
pub struct LocalInferenceHandle {
    rt: Runtime,
    manager: LifecycleManager,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Response<T: Serialize> {
    Ok(T),
    Error(ErrorBody),
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    retryable: bool,
}

impl From<&LifecycleError> for ErrorBody {
    fn from(e: &LifecycleError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

fn respond<T: Serialize>(result: Result<T, LifecycleError>) -> *mut c_char {
    let response = match &result {
        Ok(value) => Response::Ok(value),
        Err(e) => Response::Error(ErrorBody::from(e)),
    };
    into_c_string(serde_json::to_string(&response).unwrap_or_default())
}

fn invalid_argument(name: &str) -> *mut c_char {
    respond::<()>(Err(LifecycleError::Config(format!(
        "{} must be a non-null UTF-8 string",
        name
    ))))
}

fn into_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(s) => s.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives the call.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// # Safety
/// `handle` must be null or a pointer returned by `local_inference_new`
/// that has not been freed.
unsafe fn handle_ref<'a>(handle: *mut LocalInferenceHandle) -> Option<&'a LocalInferenceHandle> {
    handle.as_ref()
}

/// Create a manager configured from the environment. Returns null on failure.
#[no_mangle]
pub extern "C" fn local_inference_new() -> *mut LocalInferenceHandle {
    let rt = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(_) => return ptr::null_mut(),
    };
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(_) => return ptr::null_mut(),
    };
    let manager = match rt.block_on(LifecycleManager::new(config)) {
        Ok(manager) => manager,
        Err(_) => return ptr::null_mut(),
    };

    Box::into_raw(Box::new(LocalInferenceHandle { rt, manager }))
}

/// # Safety
/// `handle` must come from `local_inference_new` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn local_inference_free(handle: *mut LocalInferenceHandle) {
    if !handle.is_null() {
        let _ = Box::from_raw(handle);
    }
}

/// `hardware` may be null for auto-detection, or one of `cpu`, `cuda`, `npu`, `webgpu`.
///
/// # Safety
/// Pointers must satisfy the contracts of `local_inference_new` and be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn local_inference_init(
    handle: *mut LocalInferenceHandle,
    alias: *const c_char,
    hardware: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else {
        return invalid_argument("handle");
    };
    let Some(alias) = str_arg(alias) else {
        return invalid_argument("alias");
    };
    let hardware = match str_arg(hardware).map(str::parse::<HardwareTier>) {
        None => None,
        Some(Ok(tier)) => Some(tier),
        Some(Err(e)) => return respond::<()>(Err(LifecycleError::Config(e))),
    };
    respond(h.rt.block_on(h.manager.init(alias, hardware)))
}

/// # Safety
/// See `local_inference_init`.
#[no_mangle]
pub unsafe extern "C" fn local_inference_download(
    handle: *mut LocalInferenceHandle,
    alias: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else {
        return invalid_argument("handle");
    };
    let Some(alias) = str_arg(alias) else {
        return invalid_argument("alias");
    };
    respond(h.rt.block_on(h.manager.download(alias)))
}

/// # Safety
/// See `local_inference_init`.
#[no_mangle]
pub unsafe extern "C" fn local_inference_load(
    handle: *mut LocalInferenceHandle,
    variant_id: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else {
        return invalid_argument("handle");
    };
    let Some(variant_id) = str_arg(variant_id) else {
        return invalid_argument("variant_id");
    };
    respond(h.rt.block_on(h.manager.load(variant_id)))
}

/// # Safety
/// See `local_inference_init`.
#[no_mangle]
pub unsafe extern "C" fn local_inference_unload(
    handle: *mut LocalInferenceHandle,
    variant_id: *const c_char,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else {
        return invalid_argument("handle");
    };
    let Some(variant_id) = str_arg(variant_id) else {
        return invalid_argument("variant_id");
    };
    respond(h.rt.block_on(h.manager.unload(variant_id)))
}

/// # Safety
/// See `local_inference_init`.
#[no_mangle]
pub unsafe extern "C" fn local_inference_list_loaded(
    handle: *mut LocalInferenceHandle,
) -> *mut c_char {
    let Some(h) = handle_ref(handle) else {
        return invalid_argument("handle");
    };
    respond(Ok(h.manager.list_loaded()))
}

/// # Safety
/// See `local_inference_init`.
#[no_mangle]
pub unsafe extern "C" fn local_inference_shutdown(handle: *mut LocalInferenceHandle) -> *mut c_char {
    let Some(h) = handle_ref(handle) else {
        return invalid_argument("handle");
    };
    respond(h.rt.block_on(h.manager.shutdown()))
}

/// `{"ok": null}` while no service is associated.
///
/// # Safety
/// See `local_inference_init`.
#[no_mangle]
pub unsafe extern "C" fn local_inference_endpoint(handle: *mut LocalInferenceHandle) -> *mut c_char {
    let Some(h) = handle_ref(handle) else {
        return invalid_argument("handle");
    };
    respond(Ok(h.manager.endpoint()))
}

/// Bare api key string, or null when unknown.
///
/// # Safety
/// See `local_inference_init`.
#[no_mangle]
pub unsafe extern "C" fn local_inference_api_key(handle: *mut LocalInferenceHandle) -> *mut c_char {
    match handle_ref(handle).and_then(|h| h.manager.api_key()) {
        Some(key) => into_c_string(key),
        None => ptr::null_mut(),
    }
}

/// # Safety
/// `s` must come from one of the functions above and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn local_inference_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = CString::from_raw(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn take(s: *mut c_char) -> serde_json::Value {
        let text = CStr::from_ptr(s).to_str().unwrap().to_string();
        local_inference_free_string(s);
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_error_envelope_carries_kind() {
        let json = unsafe { take(respond::<()>(Err(LifecycleError::ManagerClosed))) };
        assert_eq!(json["error"]["kind"], "ManagerClosed");
        assert_eq!(json["error"]["retryable"], false);
    }

    #[test]
    fn test_ok_envelope() {
        let json = unsafe { take(respond(Ok(vec!["a", "b"]))) };
        assert_eq!(json["ok"][1], "b");
    }

    #[test]
    fn test_null_handle_is_rejected() {
        let json = unsafe { take(local_inference_list_loaded(ptr::null_mut())) };
        assert_eq!(json["error"]["kind"], "Config");
        assert!(unsafe { local_inference_api_key(ptr::null_mut()) }.is_null());
    }
}
