//! Predictor options

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Prefix for environment overrides, e.g. `ORT_PREDICTOR_TRACE_LEVEL=full_trace`
pub const ENV_PREFIX: &str = "ORT_PREDICTOR";

/// How much tracing a session records
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    #[default]
    NoTrace,
    ApplicationTrace,
    ModelTrace,
    FrameworkTrace,
    LibraryTrace,
    HardwareTrace,
    FullTrace,
}

impl TraceLevel {
    /// Engine profiling is collected from framework level upwards
    pub fn enables_profiling(self) -> bool {
        self >= TraceLevel::FrameworkTrace
    }
}

/// Requested execution device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
    /// Any device name this build does not recognise
    #[serde(other)]
    Unknown,
}

/// Construction options for a [`crate::Predictor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorOptions {
    /// Path to the model graph file
    pub graph: PathBuf,
    /// Execution device kind
    pub device: DeviceKind,
    /// Device ordinal
    pub device_id: i32,
    /// Batch size the caller feeds per predict call
    pub batch_size: usize,
    /// Trace level, profiling is on from `FrameworkTrace`
    pub trace_level: TraceLevel,
}

impl Default for PredictorOptions {
    fn default() -> Self {
        Self {
            graph: PathBuf::new(),
            device: DeviceKind::Cpu,
            device_id: 0,
            batch_size: 1,
            trace_level: TraceLevel::NoTrace,
        }
    }
}

impl PredictorOptions {
    /// Options for a CPU session on `graph`
    pub fn new(graph: impl Into<PathBuf>) -> Self {
        Self {
            graph: graph.into(),
            ..Default::default()
        }
    }

    /// Select the execution device
    pub fn with_device(mut self, device: DeviceKind, device_id: i32) -> Self {
        self.device = device;
        self.device_id = device_id;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the trace level
    pub fn with_trace_level(mut self, trace_level: TraceLevel) -> Self {
        self.trace_level = trace_level;
        self
    }

    /// Whether the engine should collect profiling events
    pub fn profiling_enabled(&self) -> bool {
        self.trace_level.enables_profiling()
    }

    /// Load options from defaults, an optional config file, then `ORT_PREDICTOR_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let options = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        Ok(options)
    }
}
