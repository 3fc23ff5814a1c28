//! Predictor Session Implementation

use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::field::Empty;
use tracing::{debug, info, info_span, warn, Span};

use crate::bridge;
use crate::error::{PredictorError, Result};
use crate::ffi::{self, CDeviceKind, NativeString, PredictorHandle};
use crate::options::{DeviceKind, PredictorOptions};
use crate::publish::{publish_trace, SpanSink, TracingSink};
use crate::tensor::{self, Tensor, TensorView};
use crate::trace::{now_ns, Trace};

/// Where a session is in its predict cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No inputs bound since the last read, or freshly created
    Idle,
    /// Inputs handed to the engine, run not (successfully) finished
    InputsBound,
    /// Run finished, outputs not read yet
    Executed,
    /// Outputs converted and handed out
    OutputsRead,
    /// Native session destroyed
    Closed,
}

impl SessionState {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::InputsBound => "inputs_bound",
            SessionState::Executed => "executed",
            SessionState::OutputsRead => "outputs_read",
            SessionState::Closed => "closed",
        }
    }
}

/// Native session pointer owned by exactly one predictor
#[derive(Debug, Clone, Copy)]
struct SessionHandle(NonNull<c_void>);

impl SessionHandle {
    fn as_ptr(self) -> PredictorHandle {
        self.0.as_ptr()
    }
}

/// Wall-clock window and span of one profiled predict call
struct CallRecord {
    start_ns: i64,
    end_ns: i64,
    span: Span,
}

/// Resolve the requested device to a native execution target
///
/// Only the CPU provider is wired up; accelerator requests fall back to it.
fn resolve_device(device: DeviceKind) -> Result<CDeviceKind> {
    match device {
        DeviceKind::Cpu => Ok(CDeviceKind::Cpu),
        DeviceKind::Cuda => {
            warn!("CUDA execution is not available, falling back to CPU");
            Ok(CDeviceKind::Cpu)
        }
        DeviceKind::Unknown => Err(PredictorError::UnsupportedDevice(
            "unrecognised device kind".to_string(),
        )),
    }
}

/// Inference session over one loaded model
///
/// Calls on one predictor are serialized by `&mut self`. Output views
/// borrow the predictor, so they cannot outlive the next predict or close.
/// Dropping the predictor closes it, but only an explicit [`Predictor::close`]
/// controls when the profiling trace gets published.
pub struct Predictor {
    handle: Option<SessionHandle>,
    options: PredictorOptions,
    state: SessionState,
    calls: Vec<CallRecord>,
    sink: Arc<dyn SpanSink>,
}

// SAFETY: the handle is exclusively owned and every native call is serialized
// by the error bridge, so moving a predictor to another thread is sound
unsafe impl Send for Predictor {}

impl Predictor {
    /// Load the model in `options.graph` and create a native session
    pub fn new(options: PredictorOptions) -> Result<Self> {
        Self::with_sink(options, Arc::new(TracingSink))
    }

    /// Like [`Predictor::new`], publishing profiling spans to `sink`
    pub fn with_sink(options: PredictorOptions, sink: Arc<dyn SpanSink>) -> Result<Self> {
        let span = info_span!("c_new", graph = %options.graph.display());
        let _enter = span.enter();

        if !options.graph.is_file() {
            return Err(PredictorError::ModelNotFound(options.graph.clone()));
        }

        let device = resolve_device(options.device)?;

        let path = options.graph.to_str().ok_or_else(|| {
            PredictorError::InvalidModelPath(options.graph.display().to_string())
        })?;
        let model_file =
            CString::new(path).map_err(|e| PredictorError::InvalidModelPath(e.to_string()))?;

        let profiling = options.profiling_enabled();
        let raw = bridge::invoke("new_predictor", || unsafe {
            ffi::ort_new_predictor(
                model_file.as_ptr(),
                device as c_int,
                profiling,
                options.device_id,
            )
        })?;

        let handle = NonNull::new(raw)
            .map(SessionHandle)
            .ok_or_else(|| PredictorError::Native {
                operation: "new_predictor",
                message: "engine returned a null session".to_string(),
            })?;

        info!(
            "Predictor created: graph={}, device={:?}:{}, batch_size={}, profiling={}",
            options.graph.display(),
            options.device,
            options.device_id,
            options.batch_size,
            profiling
        );

        Ok(Self {
            handle: Some(handle),
            options,
            state: SessionState::Idle,
            calls: Vec::new(),
            sink,
        })
    }

    fn handle(&self) -> Result<PredictorHandle> {
        self.handle
            .map(SessionHandle::as_ptr)
            .ok_or(PredictorError::SessionClosed)
    }

    /// Run the model on `inputs`, replacing whatever the previous call bound
    pub fn predict(&mut self, inputs: &[Tensor]) -> Result<()> {
        let handle = self.handle()?;

        if inputs.is_empty() {
            return Err(PredictorError::EmptyInput);
        }
        if let Some(input) = inputs.iter().find(|input| !input.is_dense()) {
            return Err(PredictorError::UnsupportedTensorKind(format!(
                "expecting a dense tensor, got a strided {} tensor with shape {:?}",
                input.element_type().as_str(),
                input.shape()
            )));
        }

        if self.state == SessionState::Executed {
            debug!("Discarding unread outputs of the previous call");
        }

        bridge::invoke("predictor_clear", || unsafe { ffi::ort_predictor_clear(handle) })?;
        self.state = SessionState::InputsBound;

        for input in inputs {
            tensor::bind_input(handle, input)?;
        }

        // With profiling on, the span lives until close so published events can
        // nest under it; its own timing then ends at close, not here
        let span = info_span!("c_predict", inputs = inputs.len(), start_ns = Empty, end_ns = Empty);
        let (start_ns, end_ns, run) = {
            let _enter = span.enter();
            let start_ns = now_ns();
            let run = bridge::invoke("predictor_run", || unsafe { ffi::ort_predictor_run(handle) });
            (start_ns, now_ns(), run)
        };

        span.record("start_ns", start_ns);
        if self.profiling_enabled() {
            // end_ns is recorded once the trace is published
            self.calls.push(CallRecord {
                start_ns,
                end_ns,
                span,
            });
        } else {
            span.record("end_ns", end_ns);
        }

        run?;
        self.state = SessionState::Executed;
        debug!(
            "Predict finished: {} inputs in {}us",
            inputs.len(),
            (end_ns - start_ns) / 1_000
        );
        Ok(())
    }

    /// Convert and return the outputs of the last predict call
    ///
    /// Views point into engine memory and stay valid while the predictor is borrowed.
    pub fn read_prediction_output(&mut self) -> Result<Vec<TensorView<'_>>> {
        let handle = self.handle()?;

        match self.state {
            SessionState::Executed => {}
            SessionState::Idle | SessionState::InputsBound => return Err(PredictorError::NoOutputs),
            state => {
                return Err(PredictorError::InvalidState {
                    operation: "read_prediction_output",
                    state: state.as_str(),
                })
            }
        }

        let _span = info_span!("c_read_predicted_output").entered();

        bridge::invoke("predictor_convert_output", || unsafe {
            ffi::ort_predictor_convert_output(handle)
        })?;
        // Converting again would append duplicates
        self.state = SessionState::OutputsRead;

        let count = bridge::invoke("predictor_num_outputs", || unsafe {
            ffi::ort_predictor_num_outputs(handle)
        })?;
        if count <= 0 {
            return Err(PredictorError::NoOutputs);
        }

        let mut outputs = Vec::with_capacity(count as usize);
        for index in 0..count {
            let value = bridge::invoke("predictor_get_output", || unsafe {
                ffi::ort_predictor_get_output(handle, index)
            })?;
            // SAFETY: the engine owns the buffer until the next clear or
            // destroy, both of which need `&mut self` while the views borrow it
            outputs.push(unsafe { tensor::view_native_output(&value)? });
        }

        debug!("Read {} prediction outputs", outputs.len());
        Ok(outputs)
    }

    /// Publish the profiling trace (if any) and destroy the native session
    ///
    /// Calling this more than once is a no-op.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let calls = std::mem::take(&mut self.calls);
        if self.profiling_enabled() {
            if let Err(e) = self.publish_profile(handle.as_ptr(), &calls) {
                warn!("Dropping profiling trace: {}", e);
            }
        }
        for call in calls {
            call.span.record("end_ns", call.end_ns);
        }

        match bridge::invoke("predictor_delete", || unsafe {
            ffi::ort_predictor_delete(handle.as_ptr())
        }) {
            Ok(()) => info!("Predictor closed: graph={}", self.options.graph.display()),
            Err(e) => warn!("Failed to release predictor session: {}", e),
        }
        self.state = SessionState::Closed;
    }

    fn publish_profile(&self, handle: PredictorHandle, calls: &[CallRecord]) -> Result<()> {
        bridge::invoke("end_profiling", || unsafe { ffi::ort_end_profiling(handle) })?;
        let start_time = bridge::invoke("profiling_get_start_time", || unsafe {
            ffi::ort_profiling_get_start_time(handle)
        })?;

        let profile = bridge::invoke("profiling_read", || unsafe {
            NativeString::from_raw(ffi::ort_profiling_read(handle))
        })?
        .to_string_lossy()
        .ok_or_else(|| PredictorError::Native {
            operation: "profiling_read",
            message: "failed to read nil profile".to_string(),
        })?;

        let trace = Trace::parse(&profile, start_time)?;
        let starts: Vec<i64> = calls.iter().map(|call| call.start_ns).collect();
        let ends: Vec<i64> = calls.iter().map(|call| call.end_ns).collect();
        let sub_traces = trace.split(&starts, &ends)?;

        let mut published = 0;
        for (index, (call, sub_trace)) in calls.iter().zip(&sub_traces).enumerate() {
            published += publish_trace(self.sink.as_ref(), &call.span, index, sub_trace);
        }

        debug!(
            "Published {} of {} profiling events across {} calls",
            published,
            trace.len(),
            calls.len()
        );
        Ok(())
    }

    /// Construction options
    pub fn options(&self) -> &PredictorOptions {
        &self.options
    }

    /// Batch size the session was created for
    pub fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    /// Whether engine profiling was requested
    pub fn profiling_enabled(&self) -> bool {
        self.options.profiling_enabled()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the native session has been destroyed
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Number of profiled predict calls awaiting publication
    pub fn recorded_calls(&self) -> usize {
        self.calls.len()
    }
}

impl Drop for Predictor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("Predictor dropped without close, releasing session");
        }
        self.close();
    }
}

#[cfg(all(test, not(feature = "ffi")))]
mod tests {
    use super::*;
    use crate::options::TraceLevel;
    use crate::publish::{is_noise, CollectingSink};
    use crate::tensor::ElementType;
    use ndarray::{ArrayD, IxDyn};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn model_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn f32_input(shape: &[usize], fill: f32) -> Tensor {
        Tensor::from(ArrayD::from_elem(IxDyn(shape), fill))
    }

    #[test]
    fn test_model_not_found() {
        let err = Predictor::new(PredictorOptions::new("/does/not/exist.onnx")).err();
        assert!(matches!(err, Some(PredictorError::ModelNotFound(_))));
    }

    #[test]
    fn test_unknown_device() {
        let model = model_file("identity");
        let options = PredictorOptions::new(model.path()).with_device(DeviceKind::Unknown, 0);
        let err = Predictor::new(options).err();
        assert!(matches!(err, Some(PredictorError::UnsupportedDevice(_))));
    }

    #[test]
    fn test_cuda_falls_back_to_cpu() {
        let model = model_file("identity");
        let options = PredictorOptions::new(model.path()).with_device(DeviceKind::Cuda, 0);
        let predictor = Predictor::new(options).unwrap();
        assert_eq!(predictor.state(), SessionState::Idle);
    }

    #[test]
    fn test_engine_load_failure_is_native_error() {
        let model = model_file("");
        let err = Predictor::new(PredictorOptions::new(model.path())).err();
        assert!(matches!(err, Some(PredictorError::Native { operation: "new_predictor", .. })));
    }

    #[test]
    fn test_empty_input() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        let raw = predictor.handle().unwrap();
        assert_eq!(ffi::native_calls(raw), Some(0));

        assert!(matches!(predictor.predict(&[]), Err(PredictorError::EmptyInput)));
        assert_eq!(predictor.state(), SessionState::Idle);
        assert_eq!(ffi::native_calls(raw), Some(0));
    }

    #[test]
    fn test_strided_input_rejected() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        let transposed = Tensor::from(ArrayD::<f32>::zeros(IxDyn(&[2, 3])).reversed_axes());
        let err = predictor.predict(&[f32_input(&[2], 1.0), transposed]).unwrap_err();
        assert!(matches!(err, PredictorError::UnsupportedTensorKind(_)));
        assert_eq!(predictor.state(), SessionState::Idle);
        assert_eq!(ffi::native_calls(predictor.handle().unwrap()), Some(0));
    }

    #[test]
    fn test_predict_and_read_roundtrip() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();

        let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let input = Tensor::from(ArrayD::from_shape_vec(IxDyn(&[1, 3, 2, 2]), data).unwrap());
        predictor.predict(&[input]).unwrap();
        assert_eq!(predictor.state(), SessionState::Executed);

        let outputs = predictor.read_prediction_output().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].element_type(), ElementType::Float32);
        assert_eq!(outputs[0].shape(), &[1, 3, 2, 2]);
        assert_eq!(outputs[0].len(), 12);
        assert_eq!(outputs[0].as_f32().unwrap()[[0, 2, 1, 1]], 11.0);
    }

    #[test]
    fn test_mixed_element_types() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();

        let ids = Tensor::from(ArrayD::from_shape_vec(IxDyn(&[3]), vec![7i64, 8, 9]).unwrap());
        let mask = Tensor::from(ArrayD::from_shape_vec(IxDyn(&[3]), vec![true, false, true]).unwrap());
        predictor.predict(&[ids, mask]).unwrap();

        let outputs = predictor.read_prediction_output().unwrap();
        assert_eq!(outputs[0].as_i64().unwrap().as_slice(), Some(&[7i64, 8, 9][..]));
        assert_eq!(outputs[1].element_type(), ElementType::Bool);
        assert!(!outputs[1].as_bool().unwrap()[[1]]);
    }

    #[test]
    fn test_second_predict_replaces_inputs() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();

        predictor
            .predict(&[f32_input(&[2], 1.0), f32_input(&[4], 2.0)])
            .unwrap();
        assert_eq!(predictor.read_prediction_output().unwrap().len(), 2);

        predictor.predict(&[f32_input(&[3], 5.0)]).unwrap();
        let outputs = predictor.read_prediction_output().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].shape(), &[3]);
        assert!(outputs[0].as_f32().unwrap().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_predict_native_call_sequence() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        let raw = predictor.handle().unwrap();

        // clear, two add-inputs, run
        predictor
            .predict(&[f32_input(&[2], 1.0), f32_input(&[2], 2.0)])
            .unwrap();
        assert_eq!(ffi::native_calls(raw), Some(4));
    }

    #[test]
    fn test_predict_without_reading_outputs() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();

        predictor.predict(&[f32_input(&[2], 1.0)]).unwrap();
        predictor.predict(&[f32_input(&[5], 3.0)]).unwrap();
        let outputs = predictor.read_prediction_output().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].shape(), &[5]);
    }

    #[test]
    fn test_read_before_predict() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        assert!(matches!(
            predictor.read_prediction_output(),
            Err(PredictorError::NoOutputs)
        ));
    }

    #[test]
    fn test_read_twice_fails_fast() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        predictor.predict(&[f32_input(&[2], 1.0)]).unwrap();
        assert_eq!(predictor.read_prediction_output().unwrap().len(), 1);

        let err = predictor.read_prediction_output().unwrap_err();
        assert!(matches!(err, PredictorError::InvalidState { state: "outputs_read", .. }));
    }

    #[test]
    fn test_unmapped_output_type_fails_whole_read() {
        // Second output is a STRING tensor
        let model = model_file("identity\noutput 8 2\n");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        predictor.predict(&[f32_input(&[2], 1.0)]).unwrap();

        let err = predictor.read_prediction_output().unwrap_err();
        assert!(matches!(err, PredictorError::UnsupportedTensorKind(_)));
    }

    #[test]
    fn test_extra_typed_output() {
        let model = model_file("output 6 2 2\n");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        predictor.predict(&[f32_input(&[1], 0.5)]).unwrap();

        let outputs = predictor.read_prediction_output().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].element_type(), ElementType::Int32);
        assert_eq!(outputs[1].shape(), &[2, 2]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let model = model_file("identity");
        let mut predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        let raw = predictor.handle().unwrap();
        assert!(ffi::is_live(raw));

        predictor.close();
        assert!(predictor.is_closed());
        assert!(!ffi::is_live(raw));

        predictor.close();
        assert_eq!(predictor.state(), SessionState::Closed);
        assert!(matches!(
            predictor.predict(&[f32_input(&[1], 1.0)]),
            Err(PredictorError::SessionClosed)
        ));
        assert!(matches!(
            predictor.read_prediction_output(),
            Err(PredictorError::SessionClosed)
        ));
    }

    #[test]
    fn test_drop_releases_session() {
        let model = model_file("identity");
        let predictor = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        let raw = predictor.handle().unwrap();
        drop(predictor);
        assert!(!ffi::is_live(raw));
    }

    #[test]
    fn test_independent_sessions() {
        let model = model_file("identity");
        let mut first = Predictor::new(PredictorOptions::new(model.path())).unwrap();
        let mut second = Predictor::new(PredictorOptions::new(model.path())).unwrap();

        first.predict(&[f32_input(&[2], 1.0)]).unwrap();
        second.predict(&[f32_input(&[3], 2.0)]).unwrap();

        first.close();

        let outputs = second.read_prediction_output().unwrap();
        assert_eq!(outputs[0].shape(), &[3]);
        assert!(outputs[0].as_f32().unwrap().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_profiling_publishes_one_sub_trace_per_call() {
        let model = model_file("identity");
        let sink = CollectingSink::new();
        let options = PredictorOptions::new(model.path()).with_trace_level(TraceLevel::FullTrace);
        let mut predictor = Predictor::with_sink(options, Arc::new(sink.clone())).unwrap();

        predictor.predict(&[f32_input(&[2], 1.0)]).unwrap();
        predictor
            .predict(&[f32_input(&[2], 1.0), f32_input(&[2], 2.0)])
            .unwrap();
        predictor.predict(&[f32_input(&[2], 1.0)]).unwrap();
        assert_eq!(predictor.recorded_calls(), 3);

        predictor.close();
        assert_eq!(predictor.recorded_calls(), 0);

        let spans = sink.spans();
        assert!(spans.iter().all(|span| !is_noise(&span.name)));
        assert!(spans.iter().all(|span| span.start <= span.end));

        let per_call: Vec<usize> = (0..3)
            .map(|call| spans.iter().filter(|span| span.call == call).count())
            .collect();
        assert_eq!(per_call, vec![1, 2, 1]);
        assert!(spans.iter().all(|span| span.category == "Node"));
    }

    #[test]
    fn test_profiling_off_records_nothing() {
        let model = model_file("identity");
        let sink = CollectingSink::new();
        let options = PredictorOptions::new(model.path()).with_trace_level(TraceLevel::ModelTrace);
        let mut predictor = Predictor::with_sink(options, Arc::new(sink.clone())).unwrap();

        predictor.predict(&[f32_input(&[2], 1.0)]).unwrap();
        assert_eq!(predictor.recorded_calls(), 0);

        predictor.close();
        assert!(sink.spans().is_empty());
    }

    #[test]
    fn test_framework_trace_records_calls() {
        let model = model_file("identity");
        let options = PredictorOptions::new(model.path()).with_trace_level(TraceLevel::FrameworkTrace);
        let mut predictor = Predictor::new(options).unwrap();

        predictor.predict(&[f32_input(&[2], 1.0)]).unwrap();
        assert_eq!(predictor.recorded_calls(), 1);
        predictor.close();
        assert!(predictor.is_closed());
    }
}
