//! Error types for readout training.

use thiserror::Error;

/// Result type alias for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Invalid encoder or trainer configuration. Always fatal, always raised
/// before any worker thread starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("encoder range is empty or not finite: dmin={dmin}, dmax={dmax}")]
    EmptyRange { dmin: f64, dmax: f64 },

    #[error("encoder {what} must be >= 1")]
    ZeroWidth { what: &'static str },

    #[error("encoder needs {needed} inputs starting at {base} but the simulator has {available}")]
    InputsExhausted {
        base: usize,
        needed: usize,
        available: usize,
    },

    #[error("{features} features but {ranges} encoder ranges")]
    RangeCountMismatch { features: usize, ranges: usize },

    #[error("invalid trainer setting `{field}`: {reason}")]
    Trainer {
        field: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn trainer(field: &'static str, reason: &'static str) -> Self {
        Self::Trainer { field, reason }
    }
}

/// Errors reported by a simulator handle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("topology targets processor `{found}`, expected `{expected}`")]
    ProcessorMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("invalid topology: {reason}")]
    InvalidTopology { reason: String },

    #[error("stimulus targets input {target} but only {inputs} inputs exist")]
    InputOutOfRange { target: usize, inputs: usize },
}

/// Errors while loading or validating observations.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("line {line}: cannot parse `{token}` as a number")]
    BadNumber { line: usize, token: String },

    #[error("line {line}: expected {expected} features, found {found}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("row {row} has no matching label")]
    MissingLabel { row: usize },

    #[error("row {row}: label {label} is outside 0..{num_classes} after normalization")]
    LabelOutOfRange {
        row: usize,
        label: i64,
        num_classes: usize,
    },

    #[error("dataset is empty")]
    Empty,
}

/// Errors surfaced by the batch barrier.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BarrierError {
    #[error("batch {batch_index} is still in flight")]
    Busy { batch_index: u64 },

    #[error("no batch has been dispatched")]
    NotDispatched,

    #[error("barrier has been shut down")]
    ShutDown,

    #[error("worker fault during batch {batch_index}: {message}")]
    WorkerFault { batch_index: u64, message: String },
}

/// Top-level error for a training or grading run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Barrier(#[from] BarrierError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}
