//! FFI Bindings for the C++ ONNX Runtime shim
//!
//! Raw declarations of the predictor C ABI (`csrc/ort_predictor.h`). Nothing
//! outside this crate calls these directly: every call goes through
//! [`crate::bridge::invoke`], which owns the process-wide last-error slot.
//!
//! Without the `ffi` feature the same functions are provided by an in-process
//! mock engine that echoes its inputs back as outputs and emits an
//! ONNX Runtime shaped profile.

use std::os::raw::{c_char, c_int, c_void};

/// Opaque handle to a native predictor session
pub type PredictorHandle = *mut c_void;

/// Output value handed back by the engine (matches `ORT_Value`)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OrtValue {
    pub otype: c_int,
    pub data_ptr: *mut c_void,
    pub shape_ptr: *const i64,
    pub shape_len: usize,
}

impl Default for OrtValue {
    fn default() -> Self {
        Self {
            otype: 0,
            data_ptr: std::ptr::null_mut(),
            shape_ptr: std::ptr::null(),
            shape_len: 0,
        }
    }
}

/// Device kinds understood by the shim
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CDeviceKind {
    Cpu = 0,
    Cuda = 1,
}

// Extern C functions from the C++ shim
// These are linked at compile time via build.rs
#[cfg(feature = "ffi")]
extern "C" {
    #[link_name = "ORT_NewPredictor"]
    pub fn ort_new_predictor(
        model_file: *const c_char,
        device: c_int,
        enable_trace: bool,
        device_id: c_int,
    ) -> PredictorHandle;
    #[link_name = "ORT_PredictorClear"]
    pub fn ort_predictor_clear(pred: PredictorHandle);
    #[link_name = "ORT_AddInput"]
    pub fn ort_add_input(
        pred: PredictorHandle,
        input: *mut c_void,
        dimensions: *const i64,
        n_dim: c_int,
        dtype: c_int,
    );
    #[link_name = "ORT_PredictorRun"]
    pub fn ort_predictor_run(pred: PredictorHandle);
    #[link_name = "ORT_PredictorConvertOutput"]
    pub fn ort_predictor_convert_output(pred: PredictorHandle);
    #[link_name = "ORT_PredictorNumOutputs"]
    pub fn ort_predictor_num_outputs(pred: PredictorHandle) -> c_int;
    #[link_name = "ORT_PredictorGetOutput"]
    pub fn ort_predictor_get_output(pred: PredictorHandle, index: c_int) -> OrtValue;
    #[link_name = "ORT_EndProfiling"]
    pub fn ort_end_profiling(pred: PredictorHandle);
    #[link_name = "ORT_ProfilingGetStartTime"]
    pub fn ort_profiling_get_start_time(pred: PredictorHandle) -> i64;
    #[link_name = "ORT_ProfilingRead"]
    pub fn ort_profiling_read(pred: PredictorHandle) -> *mut c_char;
    #[link_name = "ORT_PredictorDelete"]
    pub fn ort_predictor_delete(pred: PredictorHandle);
    #[link_name = "ORT_GetLastError"]
    pub fn ort_get_last_error() -> *const c_char;
    #[link_name = "ORT_ClearLastError"]
    pub fn ort_clear_last_error();
}

/// Owned, `malloc`-allocated C string returned by the engine
pub struct NativeString(*mut c_char);

impl NativeString {
    /// Take ownership of a buffer the engine allocated with `malloc`
    ///
    /// # Safety
    /// `ptr` must be null or a NUL-terminated buffer that nobody else frees.
    pub unsafe fn from_raw(ptr: *mut c_char) -> Self {
        Self(ptr)
    }

    /// Copy the contents out, `None` for a null buffer
    pub fn to_string_lossy(&self) -> Option<String> {
        if self.0.is_null() {
            return None;
        }
        // SAFETY: non-null and NUL-terminated per `from_raw`
        let text = unsafe { std::ffi::CStr::from_ptr(self.0) };
        Some(text.to_string_lossy().into_owned())
    }
}

impl Drop for NativeString {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::free(self.0 as *mut c_void) };
        }
    }
}

// Mock engine for when the native shim is not linked
#[cfg(not(feature = "ffi"))]
mod mock_ffi {
    use super::*;
    use crate::tensor::ElementType;
    use crate::trace::now_ns;
    use serde_json::json;
    use std::ffi::{CStr, CString};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Simulated kernel time per run, keeps profiled events strictly inside the call window
    const MOCK_RUN_TIME: Duration = Duration::from_micros(200);

    static LAST_ERROR: Mutex<Option<CString>> = Mutex::new(None);
    static LIVE_SESSIONS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    /// Tensor buffer held by the mock, stored as `u64` words for alignment
    #[derive(Clone)]
    struct MockBuffer {
        otype: c_int,
        shape: Vec<i64>,
        data: Vec<u64>,
    }

    impl MockBuffer {
        fn zeroed(otype: c_int, shape: Vec<i64>, byte_len: usize) -> Self {
            Self {
                otype,
                shape,
                data: vec![0; byte_len.div_ceil(8)],
            }
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            let len = self.data.len() * 8;
            // SAFETY: u64 storage reinterpreted as bytes, same allocation
            unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr() as *mut u8, len) }
        }

        fn as_value(&mut self) -> OrtValue {
            OrtValue {
                otype: self.otype,
                // Unmapped element types carry no data, like the native shim
                data_ptr: match ElementType::from_native(self.otype) {
                    Some(_) => self.data.as_mut_ptr() as *mut c_void,
                    None => std::ptr::null_mut(),
                },
                shape_ptr: self.shape.as_ptr(),
                shape_len: self.shape.len(),
            }
        }
    }

    /// Session state of the mock engine
    ///
    /// The "model" is an identity graph: each run outputs copies of its
    /// inputs. A model file may add constant outputs with lines of the form
    /// `output <type-tag> <dim> <dim> ...`.
    struct MockSession {
        enable_trace: bool,
        profiling: bool,
        profile_start_ns: i64,
        extra_outputs: Vec<(c_int, Vec<i64>)>,
        inputs: Vec<MockBuffer>,
        outputs: Vec<MockBuffer>,
        converted: Vec<MockBuffer>,
        events: Vec<serde_json::Value>,
        /// Calls made against this session after creation
        calls: usize,
    }

    fn set_error(message: impl Into<String>) {
        let message = CString::new(message.into()).unwrap_or_default();
        *LAST_ERROR.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn element_count(shape: &[i64]) -> usize {
        shape.iter().map(|&d| d.max(0) as usize).product()
    }

    fn parse_model(bytes: &[u8]) -> Vec<(c_int, Vec<i64>)> {
        String::from_utf8_lossy(bytes)
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                if fields.next()? != "output" {
                    return None;
                }
                let otype = fields.next()?.parse().ok()?;
                let shape = fields.filter_map(|d| d.parse().ok()).collect();
                Some((otype, shape))
            })
            .collect()
    }

    fn profile_event(
        category: &str,
        name: &str,
        ts: i64,
        dur: i64,
        args: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "cat": category,
            "name": name,
            "ph": "X",
            "ts": ts,
            "dur": dur,
            "pid": std::process::id(),
            "tid": 1,
            "args": args,
        })
    }

    /// Run `f` against a live session, or report an invalid handle
    unsafe fn with_session<R>(
        pred: PredictorHandle,
        operation: &str,
        fallback: R,
        f: impl FnOnce(&mut MockSession) -> R,
    ) -> R {
        let live = LIVE_SESSIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(pred as usize));
        if !live {
            set_error(format!("Invalid pointer to the predictor in {}.", operation));
            return fallback;
        }
        let session = &mut *(pred as *mut MockSession);
        session.calls += 1;
        f(session)
    }

    pub unsafe fn ort_new_predictor(
        model_file: *const c_char,
        _device: c_int,
        enable_trace: bool,
        _device_id: c_int,
    ) -> PredictorHandle {
        let path = CStr::from_ptr(model_file).to_string_lossy().into_owned();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                set_error(format!("Load model from {} failed: model file is empty", path));
                return std::ptr::null_mut();
            }
            Err(e) => {
                set_error(format!("Load model from {} failed: {}", path, e));
                return std::ptr::null_mut();
            }
        };

        let mut session = MockSession {
            enable_trace,
            profiling: enable_trace,
            profile_start_ns: now_ns(),
            extra_outputs: parse_model(&bytes),
            inputs: Vec::new(),
            outputs: Vec::new(),
            converted: Vec::new(),
            events: Vec::new(),
            calls: 0,
        };
        if enable_trace {
            let no_args = json!({});
            session
                .events
                .push(profile_event("Session", "model_loading_from_uri", 0, 1, no_args.clone()));
            session
                .events
                .push(profile_event("Session", "session_initialization", 1, 1, no_args));
        }

        let handle = Box::into_raw(Box::new(session));
        LIVE_SESSIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle as usize);
        handle as PredictorHandle
    }

    pub unsafe fn ort_predictor_clear(pred: PredictorHandle) {
        with_session(pred, "ORT_PredictorClear", (), |session| {
            session.inputs.clear();
            session.converted.clear();
        })
    }

    pub unsafe fn ort_add_input(
        pred: PredictorHandle,
        input: *mut c_void,
        dimensions: *const i64,
        n_dim: c_int,
        dtype: c_int,
    ) {
        with_session(pred, "ORT_AddInput", (), |session| {
            let Some(element) = ElementType::from_native(dtype) else {
                set_error("unsupported data type detected in ORT_AddInput.");
                return;
            };
            let shape = if n_dim > 0 {
                std::slice::from_raw_parts(dimensions, n_dim as usize).to_vec()
            } else {
                Vec::new()
            };
            let byte_len = element_count(&shape) * element.size_of();
            let mut buffer = MockBuffer::zeroed(dtype, shape, byte_len);
            if byte_len > 0 {
                let source = std::slice::from_raw_parts(input as *const u8, byte_len);
                buffer.bytes_mut()[..byte_len].copy_from_slice(source);
            }
            session.inputs.push(buffer);
        })
    }

    pub unsafe fn ort_predictor_run(pred: PredictorHandle) {
        with_session(pred, "ORT_PredictorRun", (), |session| {
            if session.inputs.is_empty() {
                set_error("Invalid number of input tensor in Predictor::Predict.");
                return;
            }

            let began = now_ns();
            std::thread::sleep(MOCK_RUN_TIME);

            session.outputs = session.inputs.clone();
            for (otype, shape) in &session.extra_outputs {
                let size = ElementType::from_native(*otype).map_or(8, |e| e.size_of());
                let byte_len = element_count(shape) * size;
                session
                    .outputs
                    .push(MockBuffer::zeroed(*otype, shape.clone(), byte_len));
            }

            let finished = now_ns();
            if session.profiling {
                let ts = (began - session.profile_start_ns) / 1_000 + 1;
                let dur = ((finished - session.profile_start_ns) / 1_000 - ts).max(0);
                let no_args = json!({});
                session
                    .events
                    .push(profile_event("Session", "model_run", ts, dur, no_args.clone()));
                session.events.push(profile_event(
                    "Session",
                    "SequentialExecutor::Execute",
                    ts,
                    dur,
                    no_args,
                ));
                for index in 0..session.inputs.len() {
                    session.events.push(profile_event(
                        "Node",
                        &format!("identity_{}_kernel_time", index),
                        ts,
                        dur,
                        json!({ "op_name": "Identity", "provider": "CPUExecutionProvider" }),
                    ));
                }
            }
        })
    }

    pub unsafe fn ort_predictor_convert_output(pred: PredictorHandle) {
        with_session(pred, "ORT_PredictorConvertOutput", (), |session| {
            let converted = session.outputs.clone();
            session.converted.extend(converted);
        })
    }

    pub unsafe fn ort_predictor_num_outputs(pred: PredictorHandle) -> c_int {
        with_session(pred, "ORT_PredictorNumOutputs", 0, |session| {
            session.converted.len() as c_int
        })
    }

    pub unsafe fn ort_predictor_get_output(pred: PredictorHandle, index: c_int) -> OrtValue {
        with_session(pred, "ORT_PredictorGetOutput", OrtValue::default(), |session| {
            match session.converted.get_mut(index as usize) {
                Some(buffer) => buffer.as_value(),
                None => {
                    set_error(format!("output index {} out of range", index));
                    OrtValue::default()
                }
            }
        })
    }

    pub unsafe fn ort_end_profiling(pred: PredictorHandle) {
        with_session(pred, "ORT_EndProfiling", (), |session| {
            session.profiling = false;
        })
    }

    pub unsafe fn ort_profiling_get_start_time(pred: PredictorHandle) -> i64 {
        with_session(pred, "ORT_ProfilingGetStartTime", -1, |session| {
            session.profile_start_ns
        })
    }

    pub unsafe fn ort_profiling_read(pred: PredictorHandle) -> *mut c_char {
        with_session(pred, "ORT_ProfilingRead", std::ptr::null_mut(), |session| {
            if !session.enable_trace {
                set_error("profiling is not enabled for this session");
                return std::ptr::null_mut();
            }
            let profile = serde_json::Value::Array(session.events.clone()).to_string();
            let profile = CString::new(profile).unwrap_or_default();
            libc::strdup(profile.as_ptr())
        })
    }

    pub unsafe fn ort_predictor_delete(pred: PredictorHandle) {
        let mut live = LIVE_SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
        match live.iter().position(|&h| h == pred as usize) {
            Some(position) => {
                live.swap_remove(position);
                drop(Box::from_raw(pred as *mut MockSession));
            }
            None => {
                drop(live);
                set_error("Invalid pointer to the predictor in ORT_PredictorDelete.");
            }
        }
    }

    pub unsafe fn ort_get_last_error() -> *const c_char {
        LAST_ERROR
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(std::ptr::null(), |message| message.as_ptr())
    }

    pub unsafe fn ort_clear_last_error() {
        *LAST_ERROR.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of native calls made on a live session, `None` once deleted
    pub fn native_calls(pred: PredictorHandle) -> Option<usize> {
        let live = LIVE_SESSIONS.lock().unwrap_or_else(PoisonError::into_inner);
        if !live.contains(&(pred as usize)) {
            return None;
        }
        // SAFETY: live sessions are only freed under this lock
        Some(unsafe { (*(pred as *const MockSession)).calls })
    }

    /// Whether the mock still holds a session for `pred`
    pub fn is_live(pred: PredictorHandle) -> bool {
        LIVE_SESSIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(pred as usize))
    }
}

#[cfg(not(feature = "ffi"))]
pub use mock_ffi::*;

#[cfg(all(test, not(feature = "ffi")))]
mod tests {
    use super::*;

    #[test]
    fn test_null_native_string() {
        let text = unsafe { NativeString::from_raw(std::ptr::null_mut()) };
        assert!(text.to_string_lossy().is_none());
    }

    #[test]
    fn test_native_string_roundtrip() {
        let source = std::ffi::CString::new("[]").unwrap();
        let text = unsafe { NativeString::from_raw(libc::strdup(source.as_ptr())) };
        assert_eq!(text.to_string_lossy().as_deref(), Some("[]"));
    }

    #[test]
    fn test_device_kind_values() {
        assert_eq!(CDeviceKind::Cpu as i32, 0);
        assert_eq!(CDeviceKind::Cuda as i32, 1);
    }
}
