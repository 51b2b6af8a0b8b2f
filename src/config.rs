//! Engine configuration.
//!
//! Loaded once at process start and shared as `Arc<EngineConfig>`; nothing in
//! the engine mutates it afterwards. Every section has serde defaults so a
//! partial JSON file only overrides what it names.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::weights::DEFAULT_SUM_TOLERANCE;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "FSFVI_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk: RiskThresholds,
    pub judgment: JudgmentConfig,
    pub centrality: CentralityConfig,
    pub weighting: WeightingConfig,
    pub calibration: CalibrationConfig,
    pub optimizer: OptimizerConfig,
    pub validation: ValidationConfig,
}

impl EngineConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: EngineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `FSFVI_CONFIG` when set, otherwise defaults.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => Self::load(PathBuf::from(path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.risk.validate()?;

        let j = &self.judgment;
        positive("judgment.consistency_threshold", j.consistency_threshold)?;
        positive("judgment.hierarchy_step", j.hierarchy_step)?;
        positive("judgment.weight_epsilon", j.weight_epsilon)?;

        let c = &self.centrality;
        if !(c.damping > 0.0 && c.damping < 1.0) {
            return Err(ConfigurationError::invalid(
                "centrality.damping",
                format!("must lie in (0, 1), got {}", c.damping),
            ));
        }
        positive("centrality.tolerance", c.tolerance)?;
        if c.max_iterations == 0 {
            return Err(ConfigurationError::invalid(
                "centrality.max_iterations",
                "must be at least 1",
            ));
        }
        non_negative("centrality.centrality_share", c.centrality_share)?;
        non_negative("centrality.cascade_share", c.cascade_share)?;
        non_negative("centrality.cascade_damping", c.cascade_damping)?;
        unit_interval("centrality.uncertainty_discount", c.uncertainty_discount)?;
        if !(0.1..=1.0).contains(&c.repair_default) {
            return Err(ConfigurationError::invalid(
                "centrality.repair_default",
                "must lie in [0.1, 1.0]",
            ));
        }

        let w = &self.weighting;
        for (field, value) in [
            ("weighting.hybrid.expert", w.hybrid.expert),
            ("weighting.hybrid.centrality", w.hybrid.centrality),
            ("weighting.hybrid.cascade", w.hybrid.cascade),
            ("weighting.hybrid.financial", w.hybrid.financial),
        ] {
            non_negative(field, value)?;
        }
        if w.hybrid.total() <= 0.0 {
            return Err(ConfigurationError::invalid(
                "weighting.hybrid",
                "coefficients must not all be zero",
            ));
        }
        positive("weighting.adjustment_min", w.adjustment_min)?;
        if w.adjustment_max < w.adjustment_min {
            return Err(ConfigurationError::invalid(
                "weighting.adjustment_max",
                "must not be below adjustment_min",
            ));
        }
        positive("weighting.sum_tolerance", w.sum_tolerance)?;

        let cal = &self.calibration;
        unit_interval("calibration.confidence_cap", cal.confidence_cap)?;
        positive("calibration.saturation_count", cal.saturation_count)?;
        non_negative("calibration.survey_equivalence", cal.survey_equivalence)?;
        positive("calibration.prior_concentration", cal.prior_concentration)?;
        if !(cal.interval_level > 0.0 && cal.interval_level < 1.0) {
            return Err(ConfigurationError::invalid(
                "calibration.interval_level",
                "must lie in (0, 1)",
            ));
        }

        let o = &self.optimizer;
        positive("optimizer.learning_rate", o.learning_rate)?;
        non_negative("optimizer.min_improvement", o.min_improvement)?;
        non_negative("optimizer.gradient_tolerance", o.gradient_tolerance)?;
        unit_interval("optimizer.learning_rate_decay", o.learning_rate_decay)?;
        non_negative("optimizer.min_allocation_floor", o.min_allocation_floor)?;
        unit_interval("optimizer.min_fraction_of_current", o.min_fraction_of_current)?;
        positive("optimizer.max_multiple_of_current", o.max_multiple_of_current)?;
        unit_interval("optimizer.max_budget_fraction", o.max_budget_fraction)?;
        positive("optimizer.budget_tolerance", o.budget_tolerance)?;

        let v = &self.validation;
        positive("validation.min_sensitivity", v.min_sensitivity)?;
        if v.max_sensitivity < v.min_sensitivity {
            return Err(ConfigurationError::invalid(
                "validation.max_sensitivity",
                "must not be below min_sensitivity",
            ));
        }
        Ok(())
    }
}

fn positive(field: &str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            field,
            format!("must be positive and finite, got {value}"),
        ))
    }
}

fn non_negative(field: &str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            field,
            format!("must be non-negative and finite, got {value}"),
        ))
    }
}

fn unit_interval(field: &str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            field,
            format!("must lie in [0, 1], got {value}"),
        ))
    }
}

// =============================================================================
// Risk thresholds
// =============================================================================

/// Upper bounds on the system score for each risk band; anything above
/// `high` is critical. `critical` marks the top of the scale for presets
/// that distinguish extreme scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 0.05,
            medium: 0.15,
            high: 0.30,
            critical: 0.50,
        }
    }
}

impl RiskThresholds {
    pub fn preset(preset: RiskPreset) -> Self {
        let (low, medium, high, critical) = match preset {
            RiskPreset::Default => return Self::default(),
            RiskPreset::Original => (0.15, 0.30, 0.50, 0.70),
            RiskPreset::FineGrained => (0.010, 0.025, 0.075, 0.200),
            RiskPreset::Logarithmic => (0.005, 0.025, 0.100, 0.400),
            RiskPreset::CrisisMode => (0.10, 0.25, 0.50, 0.75),
        };
        Self {
            low,
            medium,
            high,
            critical,
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let ordered = [self.low, self.medium, self.high, self.critical];
        if ordered.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigurationError::invalid(
                "risk",
                "thresholds must be non-negative and finite",
            ));
        }
        if ordered.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigurationError::invalid(
                "risk",
                "thresholds must be ordered low <= medium <= high <= critical",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskPreset {
    Default,
    Original,
    FineGrained,
    Logarithmic,
    CrisisMode,
}

impl RiskPreset {
    pub const ALL: [RiskPreset; 5] = [
        RiskPreset::Default,
        RiskPreset::Original,
        RiskPreset::FineGrained,
        RiskPreset::Logarithmic,
        RiskPreset::CrisisMode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskPreset::Default => "default",
            RiskPreset::Original => "original",
            RiskPreset::FineGrained => "fine_grained",
            RiskPreset::Logarithmic => "logarithmic",
            RiskPreset::CrisisMode => "crisis_mode",
        }
    }
}

impl FromStr for RiskPreset {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ConfigurationError::invalid("risk_preset", format!("unknown preset {s:?}")))
    }
}

// =============================================================================
// Subsystem sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgmentConfig {
    /// Matrices with a consistency ratio above this are repaired.
    pub consistency_threshold: f64,
    /// Geometric-mean repair passes before falling back to the weight-ratio matrix.
    pub max_repair_passes: usize,
    /// Category-hierarchy factor: each tier of separation multiplies the
    /// ratio by this step. 1.0 leaves registry ratios untouched.
    pub hierarchy_step: f64,
    /// Floor applied to eigenvector magnitudes before normalization.
    pub weight_epsilon: f64,
    /// Schur iteration cap (0 means unbounded).
    pub eigen_max_iterations: usize,
}

impl Default for JudgmentConfig {
    fn default() -> Self {
        Self {
            consistency_threshold: 0.1,
            max_repair_passes: 10,
            hierarchy_step: 1.0,
            weight_epsilon: 1e-6,
            eigen_max_iterations: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralityConfig {
    pub damping: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Network method blend: `centrality_share * centrality + cascade_share * cascade`.
    pub centrality_share: f64,
    pub cascade_share: f64,
    /// Weight of second-order exposure in the cascade multiplier.
    pub cascade_damping: f64,
    /// Cascade impact is scaled by `1 - uncertainty_discount * mean_uncertainty`.
    pub uncertainty_discount: f64,
    /// Value substituted for non-finite dependency entries.
    pub repair_default: f64,
}

impl Default for CentralityConfig {
    fn default() -> Self {
        Self {
            damping: 0.85,
            tolerance: 1e-8,
            max_iterations: 1000,
            centrality_share: 0.7,
            cascade_share: 0.3,
            cascade_damping: 0.5,
            uncertainty_discount: 0.5,
            repair_default: 0.3,
        }
    }
}

/// Linear blend used by the hybrid method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridCoefficients {
    pub expert: f64,
    pub centrality: f64,
    pub cascade: f64,
    pub financial: f64,
}

impl Default for HybridCoefficients {
    fn default() -> Self {
        Self {
            expert: 0.35,
            centrality: 0.30,
            cascade: 0.25,
            financial: 0.10,
        }
    }
}

impl HybridCoefficients {
    pub fn total(&self) -> f64 {
        self.expert + self.centrality + self.cascade + self.financial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    #[default]
    WeightedAverage,
    Bayesian,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingConfig {
    pub hybrid: HybridCoefficients,
    /// Clamp range of the per-category performance multiplier.
    pub adjustment_min: f64,
    pub adjustment_max: f64,
    /// Weight vectors whose sum drifts further than this are logged before renormalizing.
    pub sum_tolerance: f64,
    /// A single category above this share triggers a concentration warning.
    pub max_weight_concentration: f64,
    pub calibration_method: CalibrationMethod,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            hybrid: HybridCoefficients::default(),
            adjustment_min: 0.5,
            adjustment_max: 2.0,
            sum_tolerance: DEFAULT_SUM_TOLERANCE,
            max_weight_concentration: 0.7,
            calibration_method: CalibrationMethod::WeightedAverage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Hard cap on the blend confidence.
    pub confidence_cap: f64,
    /// Observation count at which confidence would reach 1.0 before the cap.
    pub saturation_count: f64,
    /// Observations one survey entry counts for.
    pub survey_equivalence: f64,
    /// Pseudo-count of the Beta prior centred on the base weight.
    pub prior_concentration: f64,
    /// Two-sided confidence level for sample intervals.
    pub interval_level: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            confidence_cap: 0.8,
            saturation_count: 100.0,
            survey_equivalence: 5.0,
            prior_concentration: 20.0,
            interval_level: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub min_improvement: f64,
    pub gradient_tolerance: f64,
    pub max_iterations: usize,
    pub learning_rate_decay: f64,
    /// Absolute lower bound on any component's allocation.
    pub min_allocation_floor: f64,
    pub min_fraction_of_current: f64,
    pub max_multiple_of_current: f64,
    pub max_budget_fraction: f64,
    /// Relative tolerance on `sum(allocation) == budget`.
    pub budget_tolerance: f64,
    pub fallback_max_iterations: usize,
    pub fallback_tolerance: f64,
    /// Wall-clock budget for one run; `None` means iteration caps only.
    pub time_budget_ms: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            min_improvement: 1e-6,
            gradient_tolerance: 1e-6,
            max_iterations: 200,
            learning_rate_decay: 0.9,
            min_allocation_floor: 0.1,
            min_fraction_of_current: 0.01,
            max_multiple_of_current: 2.0,
            max_budget_fraction: 0.4,
            budget_tolerance: 1e-3,
            fallback_max_iterations: 1000,
            fallback_tolerance: 1e-9,
            time_budget_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_sensitivity: f64,
    pub max_sensitivity: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_sensitivity: 0.0005,
            max_sensitivity: 0.005,
        }
    }
}
