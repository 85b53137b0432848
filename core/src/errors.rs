//! Error types for the factor smoother.
//!
//! All failures are reported through [`SmootherError`]. The variants fall into three groups:
//! - configuration errors: the factor setting, coefficient records, or array shapes do not fit
//!   together (`FactorSettingMismatch`, `NonPositiveFactorValue`, `ShapeMismatch`,
//!   `InvalidParameter`, `DrawCountMismatch`);
//! - data errors: a table or array holds the wrong number of records, the measurement tables
//!   cannot serve a requested period, or the particle weights collapse (`RecordCountMismatch`,
//!   `MeasurementDimensionMismatch`, `MissingMeasurement`, `DegenerateWeights`, `InvalidRecord`);
//! - I/O errors raised while loading or writing tables and configuration files.
//!
//! Errors raised inside the smoothing loop are wrapped in [`SmootherError::Stage`] so that the
//! caller can report which period and which model failed.
use std::fmt::{self, Display};
use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SmootherError>;

/// Unified error type for the smoother and its supporting I/O.
#[derive(Error, Debug)]
pub enum SmootherError {
    #[error("input does not fit the factor setting: expected {expected} {what}, found {found}")]
    FactorSettingMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "factor type {factor} has non-positive value {value} (observation {observation}, particle {particle})"
    )]
    NonPositiveFactorValue {
        factor: usize,
        observation: usize,
        particle: usize,
        value: f64,
    },

    #[error("{what} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("invalid parameter `{name}` = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("draw counts for observation {observation} sum to {found}, expected {expected}")]
    DrawCountMismatch {
        observation: usize,
        expected: usize,
        found: usize,
    },

    #[error("wrong number of {what}: expected {expected}, found {found}")]
    RecordCountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "measurements are not available for period {period}: expected {expected} observations, found {found}"
    )]
    MeasurementDimensionMismatch {
        period: usize,
        expected: usize,
        found: usize,
    },

    #[error("measurement column {column} is missing for observation {observation}, period {period}")]
    MissingMeasurement {
        column: usize,
        observation: u64,
        period: usize,
    },

    #[error("invalid record at line {line}: {reason}")]
    InvalidRecord { line: u64, reason: String },

    #[error("all particles of observation {observation} have zero likelihood")]
    DegenerateWeights { observation: usize },

    #[error("{stage} ({model}): {source}")]
    Stage {
        stage: Stage,
        model: ModelKind,
        #[source]
        source: Box<SmootherError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SmootherError {
    /// Wrap the error with the smoother stage and model that raised it.
    pub fn at(self, stage: Stage, model: ModelKind) -> Self {
        SmootherError::Stage {
            stage,
            model,
            source: Box::new(self),
        }
    }
    /// The innermost error, with any stage wrappers removed.
    pub fn root(&self) -> &SmootherError {
        match self {
            SmootherError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Position of the smoother's state machine at which an error was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Forward { period: usize },
    Backward { period: usize },
}
impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Forward { period } => write!(f, "forward pass, period {}", period),
            Stage::Backward { period } => write!(f, "backward pass, period {}", period),
        }
    }
}

/// Model component that raised an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Transition,
    Measurement { factor: usize },
    Weighting,
    Resampler,
}
impl Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Transition => write!(f, "transition model"),
            ModelKind::Measurement { factor } => {
                write!(f, "measurement model of factor type {}", factor)
            }
            ModelKind::Weighting => write!(f, "particle weighting"),
            ModelKind::Resampler => write!(f, "particle resampler"),
        }
    }
}
