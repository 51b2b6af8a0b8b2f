#![forbid(unsafe_code)]

//! # fsfvi-engine
//!
//! Food System Financial Vulnerability Index: weighting, vulnerability and
//! budget optimization for a portfolio of food-system components.
//!
//! Each component carries an observed value, a benchmark and a financial
//! allocation. Its vulnerability is `gap / (1 + sensitivity * allocation)`.
//! Category weights come from one of several methods: scenario expert
//! tables, dependency-network centrality with cascade effects, financial
//! shares, context adjustments, a hybrid blend of these, or AHP pairwise
//! judgment. Empirical evidence can calibrate the weights. The FSFVI is the
//! weighted sum of component vulnerabilities, and the optimizer
//! redistributes a fixed budget to minimize it.
//!
//! Weighting never fails silently: the requested method degrades to the
//! judgment baseline and then to equal weights, and every fallback is
//! recorded on the result.

pub mod calibration;
pub mod centrality;
pub mod component;
pub mod config;
pub mod engine;
pub mod error;
pub mod integrator;
pub mod judgment;
pub mod optimizer;
pub mod registry;
pub mod synthetic;
pub mod vulnerability;
pub mod weights;

pub use calibration::{CalibrationRecord, CalibrationStore, SurveyRecord};
pub use component::{Component, ComponentType};
pub use config::{EngineConfig, RiskPreset, RiskThresholds};
pub use engine::{
    AnalysisRequest, FsfviEngine, MethodComparison, OptimizationReport, VulnerabilityReport,
    WeightSensitivity,
};
pub use error::{
    CalculationError, ConfigurationError, EngineError, OptimizationError, ValidationError,
    WeightingError,
};
pub use integrator::{IntegratedWeights, WeightingMethod, WeightingRequest};
pub use judgment::Scenario;
pub use optimizer::{AllocationConstraints, OptimizationOutcome, StopReason};
pub use registry::{CategoryMetadata, ComponentRegistry};
pub use vulnerability::{RiskLevel, SystemSummary};
pub use weights::WeightVector;
