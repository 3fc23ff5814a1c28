//! Native Error Bridge
//!
//! The engine reports failures through a single process-wide last-error
//! slot. Every native call goes through [`invoke`], which holds one global
//! lock across the call and the read-and-clear of that slot, so an error is
//! always attributed to the call that raised it.

use std::ffi::CStr;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::error::{PredictorError, Result};
use crate::ffi;

static NATIVE_CALL: Mutex<()> = Mutex::new(());

/// Run one native call and surface the engine's last error as a typed failure
pub(crate) fn invoke<T>(operation: &'static str, call: impl FnOnce() -> T) -> Result<T> {
    let _guard = NATIVE_CALL.lock().unwrap_or_else(PoisonError::into_inner);

    let value = call();

    match take_last_error() {
        Some(message) => {
            debug!("Native call {} failed: {}", operation, message);
            Err(PredictorError::Native { operation, message })
        }
        None => Ok(value),
    }
}

/// Read and clear the last-error slot. Caller must hold `NATIVE_CALL`.
fn take_last_error() -> Option<String> {
    // SAFETY: the engine keeps the message alive until it is cleared, and
    // nothing else can clear it while we hold the lock
    unsafe {
        let ptr = ffi::ort_get_last_error();
        if ptr.is_null() {
            return None;
        }
        let message = CStr::from_ptr(ptr).to_string_lossy().into_owned();
        ffi::ort_clear_last_error();
        Some(message)
    }
}

#[cfg(all(test, not(feature = "ffi")))]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_surfaces_native_error() {
        let err = invoke("predictor_run", || unsafe {
            ffi::ort_predictor_run(std::ptr::null_mut())
        })
        .unwrap_err();

        match err {
            PredictorError::Native { operation, message } => {
                assert_eq!(operation, "predictor_run");
                assert!(message.contains("Invalid pointer"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_is_cleared_after_read() {
        let _ = invoke("predictor_clear", || unsafe {
            ffi::ort_predictor_clear(std::ptr::null_mut())
        });

        let value = invoke("noop", || 7).unwrap();
        assert_eq!(value, 7);
    }
}
