//! Error taxonomy for the weighting and optimization engine.
//!
//! Each subsystem raises its own enum; [`EngineError`] is the umbrella the
//! facade and the CLI deal in.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed or out-of-range caller input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("at least one component is required")]
    EmptyComponents,
    #[error("duplicate component id: {id}")]
    DuplicateComponentId { id: String },
    #[error("component {component_id}: invalid {field}: {message}")]
    InvalidField {
        component_id: String,
        field: String,
        message: String,
    },
    #[error("component {component_id}: unknown category {category:?}")]
    UnknownCategory {
        component_id: String,
        category: String,
    },
    #[error("unknown weighting method {name:?}; available: {available}")]
    UnknownMethod { name: String, available: String },
    #[error("unknown scenario {name:?}; available: {available}")]
    UnknownScenario { name: String, available: String },
    #[error("budget must be positive and finite, got {budget}")]
    InvalidBudget { budget: f64 },
    #[error("total allocation {total:.4} exceeds budget {budget:.4} (tolerance {tolerance})")]
    AllocationExceedsBudget {
        total: f64,
        budget: f64,
        tolerance: f64,
    },
    #[error("total allocation must be positive")]
    ZeroAllocation,
    #[error("invalid constraint: {message}")]
    InvalidConstraint { message: String },
    #[error("weights sum to {sum} and could not be renormalized")]
    WeightSum { sum: f64 },
    #[error("invalid calibration evidence for {category}: {message}")]
    InvalidEvidence { category: String, message: String },
}

/// A weighting method failed after its own repair attempts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WeightingError {
    #[error("no categories to weight")]
    NoCategories,
    #[error("judgment matrix rejected: {message}")]
    JudgmentMatrix {
        message: String,
        consistency_ratio: Option<f64>,
    },
    #[error("eigen-decomposition failed: {message}")]
    Eigen { message: String },
    #[error("centrality analysis failed: {message}")]
    Centrality { message: String },
    #[error("{method} produced degenerate weights")]
    DegenerateWeights { method: String },
    #[error("every weighting strategy failed: {attempts:?}")]
    AllStrategiesFailed { attempts: Vec<String> },
}

impl WeightingError {
    /// Attach the consistency ratio measured before a judgment matrix was rejected.
    pub fn with_consistency_ratio(self, cr: f64) -> Self {
        match self {
            WeightingError::JudgmentMatrix { message, .. } => WeightingError::JudgmentMatrix {
                message,
                consistency_ratio: Some(cr),
            },
            other => other,
        }
    }
}

/// Invalid numeric input to the vulnerability math.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalculationError {
    #[error("financial allocation must be non-negative, got {value}")]
    NegativeAllocation { value: f64 },
    #[error("sensitivity parameter must be non-negative, got {value}")]
    NegativeSensitivity { value: f64 },
    #[error("weight must lie in [0, 1], got {weight}")]
    WeightOutOfRange { weight: f64 },
    #[error("{quantity} is not finite: {value}")]
    NonFinite { quantity: String, value: f64 },
    #[error("length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("no component results to aggregate")]
    NoResults,
}

/// Both the gradient search and the fallback solver failed, or the problem
/// was infeasible to begin with.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("allocation bounds are infeasible: sum(min) {min_total:.4}, sum(max) {max_total:.4}, budget {budget:.4}")]
    InfeasibleBounds {
        min_total: f64,
        max_total: f64,
        budget: f64,
    },
    #[error("{solver} failed: {message}")]
    SolverFailed { solver: String, message: String },
}

/// Registry, matrix shape or engine configuration problems.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown category: {name}")]
    UnknownCategory { name: String },
    #[error("matrix shape mismatch: expected {expected}x{expected}, got {rows}x{cols}")]
    ShapeMismatch {
        expected: usize,
        rows: usize,
        cols: usize,
    },
    #[error("invalid configuration value {field}: {message}")]
    Invalid { field: String, message: String },
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigurationError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("weighting error: {0}")]
    Weighting(#[from] WeightingError),
    #[error("calculation error: {0}")]
    Calculation(#[from] CalculationError),
    #[error("optimization error: {0}")]
    Optimization(#[from] OptimizationError),
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl EngineError {
    /// Stable short code for logs and structured failure results.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Weighting(_) => "weighting_error",
            EngineError::Calculation(_) => "calculation_error",
            EngineError::Optimization(_) => "optimization_error",
            EngineError::Configuration(_) => "configuration_error",
        }
    }
}
