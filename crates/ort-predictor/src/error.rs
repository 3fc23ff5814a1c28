//! Predictor Error Types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while driving a predictor session
#[derive(Debug, Error)]
pub enum PredictorError {
    /// Model graph path does not reference an existing file
    #[error("Model file {0} not found")]
    ModelNotFound(PathBuf),

    /// Model path cannot be handed to the native engine
    #[error("Invalid model path: {0}")]
    InvalidModelPath(String),

    /// Requested device cannot be resolved to a native execution target
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Predict called with no input tensors
    #[error("Input tensors are empty")]
    EmptyInput,

    /// Tensor layout or element type the native ABI cannot carry
    #[error("Unsupported tensor kind: {0}")]
    UnsupportedTensorKind(String),

    /// Native engine produced no outputs
    #[error("Zero number of output tensors")]
    NoOutputs,

    /// Profiling buffer is not a valid trace event array
    #[error("Trace parse error: {0}")]
    TraceParse(#[from] serde_json::Error),

    /// Recorded call windows are inconsistent
    #[error("Trace split failed: {starts} start times but {ends} end times")]
    TraceSplit { starts: usize, ends: usize },

    /// Error reported by the native engine after a call
    #[error("Native error in {operation}: {message}")]
    Native {
        operation: &'static str,
        message: String,
    },

    /// Operation called out of order
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Session was already destroyed
    #[error("Predictor session is closed")]
    SessionClosed,

    /// Options could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result alias for predictor operations
pub type Result<T> = std::result::Result<T, PredictorError>;
