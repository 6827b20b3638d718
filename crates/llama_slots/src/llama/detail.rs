//! FFI implementation details.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::{Mutex, PoisonError};

#[cfg(not(feature = "sys_verbosity"))]
use tracing::info;
#[cfg(feature = "sys_verbosity")]
use tracing::trace;
use tracing::{debug, error, warn};

use llama_cpp_sys::{ggml_log_level, llama_backend_free, llama_backend_init, llama_log_set};

/// The number of live [`BackendRef`]s. The native backend is initialised while this is
/// nonzero.
static BACKEND_REFS: Mutex<usize> = Mutex::new(0);

/// A reference to the process-wide llama.cpp backend.
///
/// The first reference initialises the backend and routes its logs into `tracing`; dropping
/// the last one frees it.
pub(crate) struct BackendRef {}

impl BackendRef {
    pub(crate) fn new() -> Self {
        let mut refs = BACKEND_REFS.lock().unwrap_or_else(PoisonError::into_inner);

        if *refs == 0 {
            unsafe {
                // SAFETY: No models or contexts exist while the count is zero.
                llama_backend_init();

                // SAFETY: Performs a simple assignment to static variables, before any logs
                // are made.
                llama_log_set(Some(llama_log_callback), ptr::null_mut());
            }
            debug!("Initialised llama.cpp backend");
        }

        *refs += 1;
        Self {}
    }
}

impl Drop for BackendRef {
    fn drop(&mut self) {
        let mut refs = BACKEND_REFS.lock().unwrap_or_else(PoisonError::into_inner);

        match *refs {
            0 => error!("Backend has already been freed, this should never happen"),
            1 => {
                *refs = 0;
                unsafe {
                    // SAFETY: This was the last reference, so no models or contexts exist.
                    llama_backend_free();
                }
                debug!("Freed llama.cpp backend");
            }
            _ => *refs -= 1,
        }
    }
}

#[allow(improper_ctypes_definitions)]
pub(crate) unsafe extern "C" fn llama_log_callback(
    level: ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    let text = unsafe {
        // SAFETY: `text` is a NUL-terminated C String.
        CStr::from_ptr(text)
    };
    let text = String::from_utf8_lossy(text.to_bytes());

    // llama.cpp streams some lines a character at a time.
    if text.len() < 2 {
        return;
    }

    let text = text.strip_suffix('\n').unwrap_or(text.as_ref());

    match level {
        #[cfg(feature = "sys_verbosity")]
        ggml_log_level::GGML_LOG_LEVEL_DEBUG => trace!(target: "llama.cpp", "{text}"),
        #[cfg(feature = "sys_verbosity")]
        ggml_log_level::GGML_LOG_LEVEL_INFO => debug!(target: "llama.cpp", "{text}"),
        #[cfg(not(feature = "sys_verbosity"))]
        ggml_log_level::GGML_LOG_LEVEL_DEBUG => debug!(target: "llama.cpp", "{text}"),
        #[cfg(not(feature = "sys_verbosity"))]
        ggml_log_level::GGML_LOG_LEVEL_INFO => info!(target: "llama.cpp", "{text}"),
        ggml_log_level::GGML_LOG_LEVEL_WARN => warn!(target: "llama.cpp", "{text}"),
        ggml_log_level::GGML_LOG_LEVEL_ERROR => error!(target: "llama.cpp", "{text}"),
        _ => debug!(target: "llama.cpp", "{text}"),
    }
}
