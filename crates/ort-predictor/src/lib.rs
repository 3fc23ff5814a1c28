//! ONNX Runtime Predictor
//!
//! This crate wraps a native ONNX Runtime session behind a safe predictor:
//! load a model, feed dense host tensors, borrow the outputs, and publish the
//! engine's profiling trace as per-call tracing spans when the session closes.
//!
//! Without the `ffi` feature the native calls are served by an in-process
//! identity engine, which is what the test suite runs against.

mod bridge;
mod error;
pub mod ffi;
mod options;
mod predictor;
mod publish;
mod tensor;
mod trace;

pub use error::{PredictorError, Result};
pub use options::{DeviceKind, PredictorOptions, TraceLevel, ENV_PREFIX};
pub use predictor::{Predictor, SessionState};
pub use publish::{is_noise, publish_trace, CollectingSink, FinishedSpan, SpanSink, TracingSink};
pub use tensor::{native_tag, ElementType, Tensor, TensorView};
pub use trace::{now_ns, to_system_time, Trace, TraceEvent};
