//! Pairwise-comparison (AHP) weighting.
//!
//! A judgment matrix holds relative-importance ratios between categories.
//! Matrices are built from registry default weights (optionally overridden by
//! explicit pairwise judgments), checked for consistency, repaired with a
//! geometric-mean projection when needed, and reduced to a weight vector via
//! the principal eigenvector.
//!
//! Also hosts the fixed scenario weight table used by the expert method.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use nalgebra::linalg::Schur;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::ComponentType;
use crate::config::JudgmentConfig;
use crate::error::{ValidationError, WeightingError};
use crate::registry::{CategoryMetadata, ComponentRegistry};
use crate::weights::{WeightVector, DEFAULT_SUM_TOLERANCE};

/// Saaty's scale bounds.
pub const MIN_RATIO: f64 = 1.0 / 9.0;
pub const MAX_RATIO: f64 = 9.0;

const RECIPROCAL_TOLERANCE: f64 = 1e-9;

/// Random consistency index for matrices of size `n`.
pub fn random_index(n: usize) -> f64 {
    match n {
        0..=2 => 0.0,
        3 => 0.58,
        4 => 0.90,
        5 => 1.12,
        6 => 1.24,
        7 => 1.32,
        8 => 1.41,
        9 => 1.45,
        _ => 1.49,
    }
}

/// One explicit comparison: `a` is `ratio` times as important as `b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseJudgment {
    pub a: String,
    pub b: String,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgmentMatrix {
    names: Vec<String>,
    values: DMatrix<f64>,
}

impl JudgmentMatrix {
    /// Build from raw weights: `M[i,j] = clamp(w_i / w_j * step^(tier_j - tier_i))`,
    /// with the lower triangle set to exact reciprocals.
    pub fn from_weights(
        names: Vec<String>,
        weights: &[f64],
        tiers: &[u8],
        hierarchy_step: f64,
    ) -> Result<Self, WeightingError> {
        let n = names.len();
        if n == 0 {
            return Err(WeightingError::NoCategories);
        }
        if weights.len() != n || tiers.len() != n {
            return Err(WeightingError::JudgmentMatrix {
                message: format!(
                    "expected {n} weights and tiers, got {} and {}",
                    weights.len(),
                    tiers.len()
                ),
                consistency_ratio: None,
            });
        }
        if let Some(bad) = weights.iter().find(|w| !(w.is_finite() && **w > 0.0)) {
            return Err(WeightingError::JudgmentMatrix {
                message: format!("weights must be positive, got {bad}"),
                consistency_ratio: None,
            });
        }
        let mut values = DMatrix::from_element(n, n, 1.0);
        for i in 0..n {
            for j in (i + 1)..n {
                let factor = hierarchy_step.powi(i32::from(tiers[j]) - i32::from(tiers[i]));
                let ratio = (weights[i] / weights[j] * factor).clamp(MIN_RATIO, MAX_RATIO);
                values[(i, j)] = ratio;
                values[(j, i)] = 1.0 / ratio;
            }
        }
        Ok(Self { names, values })
    }

    /// Build from registry defaults and hierarchy tiers over `names`.
    pub fn from_registry(
        registry: &ComponentRegistry,
        names: &[String],
        cfg: &JudgmentConfig,
    ) -> Result<Self, WeightingError> {
        let metas = registry
            .snapshot(names)
            .map_err(|e| WeightingError::JudgmentMatrix {
                message: e.to_string(),
                consistency_ratio: None,
            })?;
        let weights: Vec<f64> = metas.iter().map(|m| m.default_weight).collect();
        let tiers: Vec<u8> = metas.iter().map(|m: &CategoryMetadata| m.hierarchy_tier).collect();
        Self::from_weights(names.to_vec(), &weights, &tiers, cfg.hierarchy_step)
    }

    /// Overwrite cells with explicit judgments, keeping the reciprocal exact.
    pub fn with_judgments(mut self, judgments: &[PairwiseJudgment]) -> Result<Self, WeightingError> {
        for j in judgments {
            let ia = self.index_of(&j.a)?;
            let ib = self.index_of(&j.b)?;
            if ia == ib {
                continue;
            }
            if !(j.ratio.is_finite() && j.ratio > 0.0) {
                return Err(WeightingError::JudgmentMatrix {
                    message: format!("ratio for {}/{} must be positive, got {}", j.a, j.b, j.ratio),
                    consistency_ratio: None,
                });
            }
            self.set(ia, ib, j.ratio);
        }
        Ok(self)
    }

    fn index_of(&self, name: &str) -> Result<usize, WeightingError> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| WeightingError::JudgmentMatrix {
                message: format!("judgment references unknown category {name}"),
                consistency_ratio: None,
            })
    }

    /// Set `(i, j)` clamped to the scale and `(j, i)` to its exact reciprocal.
    fn set(&mut self, i: usize, j: usize, ratio: f64) {
        let r = ratio.clamp(MIN_RATIO, MAX_RATIO);
        self.values[(i, j)] = r;
        self.values[(j, i)] = 1.0 / r;
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Check shape, unit diagonal, reciprocity and scale bounds.
    pub fn validate(&self) -> Result<(), WeightingError> {
        let n = self.names.len();
        let invalid = |message: String| WeightingError::JudgmentMatrix {
            message,
            consistency_ratio: None,
        };
        if self.values.nrows() != n || self.values.ncols() != n {
            return Err(invalid(format!(
                "matrix is {}x{} for {n} categories",
                self.values.nrows(),
                self.values.ncols()
            )));
        }
        for i in 0..n {
            if self.values[(i, i)] != 1.0 {
                return Err(invalid(format!("diagonal entry {i} is {}", self.values[(i, i)])));
            }
            for j in (i + 1)..n {
                let (a, b) = (self.values[(i, j)], self.values[(j, i)]);
                if !(MIN_RATIO - 1e-12..=MAX_RATIO + 1e-12).contains(&a) {
                    return Err(invalid(format!("entry ({i},{j}) = {a} outside [1/9, 9]")));
                }
                if (a * b - 1.0).abs() > RECIPROCAL_TOLERANCE {
                    return Err(invalid(format!("entries ({i},{j}) and ({j},{i}) are not reciprocal")));
                }
            }
        }
        Ok(())
    }

    /// Geometric-mean repair: each upper cell becomes `(prod_k M[i,k] M[k,j])^(1/n)`.
    pub fn repaired(&self) -> Self {
        let n = self.len();
        let mut out = self.clone();
        for i in 0..n {
            for j in (i + 1)..n {
                let log_sum: f64 = (0..n)
                    .map(|k| (self.values[(i, k)] * self.values[(k, j)]).ln())
                    .sum();
                out.set(i, j, (log_sum / n as f64).exp());
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // Eigen analysis
    // -------------------------------------------------------------------------

    /// Eigenvalue with the largest real part.
    pub fn principal_eigenvalue(&self, cfg: &JudgmentConfig) -> Result<f64, WeightingError> {
        let schur = Schur::try_new(self.values.clone(), f64::EPSILON, cfg.eigen_max_iterations)
            .ok_or_else(|| WeightingError::Eigen {
                message: "Schur decomposition did not converge".to_string(),
            })?;
        schur
            .complex_eigenvalues()
            .iter()
            .map(|c| c.re)
            .filter(|re| re.is_finite())
            .max_by(|a, b| a.total_cmp(b))
            .ok_or_else(|| WeightingError::Eigen {
                message: "no finite eigenvalues".to_string(),
            })
    }

    /// Eigenvector for `lambda`: the right singular vector of `M - lambda I`
    /// with the smallest singular value.
    fn eigenvector(&self, lambda: f64, cfg: &JudgmentConfig) -> Result<DVector<f64>, WeightingError> {
        let n = self.len();
        let shifted = &self.values - DMatrix::<f64>::identity(n, n) * lambda;
        let svd = shifted
            .try_svd(false, true, f64::EPSILON, cfg.eigen_max_iterations)
            .ok_or_else(|| WeightingError::Eigen {
                message: "SVD did not converge".to_string(),
            })?;
        let v_t = svd.v_t.ok_or_else(|| WeightingError::Eigen {
            message: "SVD returned no right singular vectors".to_string(),
        })?;
        let (idx, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .ok_or_else(|| WeightingError::Eigen {
                message: "empty singular value set".to_string(),
            })?;
        Ok(v_t.row(idx).transpose())
    }

    /// `(lambda_max - n) / (n - 1) / RI(n)`; zero for `n <= 2`.
    pub fn consistency_ratio(&self, cfg: &JudgmentConfig) -> Result<f64, WeightingError> {
        let n = self.len();
        if n <= 2 {
            return Ok(0.0);
        }
        let lambda = self.principal_eigenvalue(cfg)?;
        let ci = (lambda - n as f64) / (n as f64 - 1.0);
        Ok((ci / random_index(n)).max(0.0))
    }

    /// Principal eigenvector as a weight vector: magnitudes, floored at
    /// `weight_epsilon`, normalized.
    pub fn principal_weights(&self, cfg: &JudgmentConfig) -> Result<(WeightVector, f64), WeightingError> {
        if self.is_empty() {
            return Err(WeightingError::NoCategories);
        }
        let lambda = self.principal_eigenvalue(cfg)?;
        let vector = self.eigenvector(lambda, cfg)?;
        let raw: BTreeMap<String, f64> = self
            .names
            .iter()
            .zip(vector.iter())
            .map(|(name, x)| (name.clone(), x.abs().max(cfg.weight_epsilon)))
            .collect();
        let weights = WeightVector::from_raw(raw).map_err(|_| WeightingError::DegenerateWeights {
            method: "judgment".to_string(),
        })?;
        Ok((weights, lambda))
    }
}

// =============================================================================
// Acceptance pipeline
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct JudgmentWeights {
    pub weights: WeightVector,
    pub lambda_max: f64,
    pub consistency_ratio: f64,
    pub repair_passes: usize,
    /// The weight-ratio fallback matrix replaced the input.
    pub fallback_used: bool,
}

/// Validate, repair if inconsistent, and extract weights.
///
/// `fallback_weights` seeds the consistent-by-construction matrix used when
/// repair does not bring the ratio under the threshold.
pub fn accept_and_weigh(
    matrix: JudgmentMatrix,
    fallback_weights: &[f64],
    cfg: &JudgmentConfig,
) -> Result<JudgmentWeights, WeightingError> {
    matrix.validate()?;
    let mut current = matrix;
    let mut cr = current.consistency_ratio(cfg)?;
    let mut passes = 0;
    while cr > cfg.consistency_threshold && passes < cfg.max_repair_passes {
        current = current.repaired();
        passes += 1;
        cr = current.consistency_ratio(cfg)?;
        debug!(pass = passes, consistency_ratio = cr, "judgment matrix repair pass");
    }

    let mut fallback_used = false;
    if cr > cfg.consistency_threshold {
        warn!(
            consistency_ratio = cr,
            threshold = cfg.consistency_threshold,
            passes,
            "judgment matrix still inconsistent after repair; using weight-ratio matrix"
        );
        let n = current.len();
        current = JudgmentMatrix::from_weights(current.names.clone(), fallback_weights, &vec![0u8; n], 1.0)
            .map_err(|e| e.with_consistency_ratio(cr))?;
        cr = current.consistency_ratio(cfg)?;
        fallback_used = true;
    } else if passes > 0 {
        warn!(consistency_ratio = cr, passes, "judgment matrix repaired");
    }
    current.validate().map_err(|e| e.with_consistency_ratio(cr))?;

    let (weights, lambda_max) = current.principal_weights(cfg)?;
    Ok(JudgmentWeights {
        weights,
        lambda_max,
        consistency_ratio: cr,
        repair_passes: passes,
        fallback_used,
    })
}

// =============================================================================
// Scenario table
// =============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    #[default]
    NormalOperations,
    ClimateShock,
    FinancialCrisis,
    PandemicDisruption,
    SupplyChainDisruption,
    CyberThreats,
    PoliticalInstability,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::NormalOperations,
        Scenario::ClimateShock,
        Scenario::FinancialCrisis,
        Scenario::PandemicDisruption,
        Scenario::SupplyChainDisruption,
        Scenario::CyberThreats,
        Scenario::PoliticalInstability,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::NormalOperations => "normal_operations",
            Scenario::ClimateShock => "climate_shock",
            Scenario::FinancialCrisis => "financial_crisis",
            Scenario::PandemicDisruption => "pandemic_disruption",
            Scenario::SupplyChainDisruption => "supply_chain_disruption",
            Scenario::CyberThreats => "cyber_threats",
            Scenario::PoliticalInstability => "political_instability",
        }
    }

    pub fn available() -> String {
        Self::ALL.map(Scenario::as_str).join(", ")
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sc| sc.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownScenario {
                name: s.to_string(),
                available: Self::available(),
            })
    }
}

/// Named, pre-normalized scenario weight vectors over the seeded categories.
#[derive(Debug, Clone)]
pub struct ScenarioTable {
    table: BTreeMap<Scenario, WeightVector>,
}

impl Default for ScenarioTable {
    fn default() -> Self {
        use ComponentType::*;
        // agri, infra, nutrition, climate, social, governance
        let rows: [(Scenario, [f64; 6]); 7] = [
            (Scenario::NormalOperations, [0.25, 0.18, 0.22, 0.15, 0.15, 0.05]),
            (Scenario::ClimateShock, [0.20, 0.25, 0.15, 0.30, 0.08, 0.02]),
            (Scenario::FinancialCrisis, [0.30, 0.15, 0.25, 0.10, 0.18, 0.02]),
            (Scenario::PandemicDisruption, [0.28, 0.22, 0.30, 0.08, 0.10, 0.02]),
            (Scenario::SupplyChainDisruption, [0.25, 0.35, 0.20, 0.10, 0.08, 0.02]),
            (Scenario::CyberThreats, [0.20, 0.30, 0.15, 0.10, 0.15, 0.10]),
            (Scenario::PoliticalInstability, [0.22, 0.20, 0.18, 0.12, 0.20, 0.08]),
        ];
        let order = [
            AgriculturalDevelopment,
            Infrastructure,
            NutritionHealth,
            ClimateNaturalResources,
            SocialProtectionEquity,
            GovernanceInstitutions,
        ];
        let mut table = BTreeMap::new();
        for (scenario, values) in rows {
            let raw = order
                .iter()
                .zip(values)
                .map(|(ct, w)| (ct.as_str().to_string(), w))
                .collect();
            if let Ok(vector) = WeightVector::from_raw(raw) {
                table.insert(scenario, vector);
            }
        }
        Self { table }
    }
}

impl ScenarioTable {
    pub fn scenarios(&self) -> impl Iterator<Item = Scenario> + '_ {
        self.table.keys().copied()
    }

    /// The named entry, or the probability-weighted average of all listed
    /// scenarios when `shock_probabilities` has positive mass.
    pub fn get_scenario_weights(
        &self,
        scenario: Scenario,
        shock_probabilities: Option<&BTreeMap<Scenario, f64>>,
    ) -> Result<WeightVector, WeightingError> {
        if let Some(probs) = shock_probabilities {
            let total: f64 = probs
                .values()
                .filter(|p| p.is_finite() && **p > 0.0)
                .sum();
            if total > 0.0 {
                let terms: Vec<(f64, &WeightVector)> = probs
                    .iter()
                    .filter(|(_, p)| p.is_finite() && **p > 0.0)
                    .filter_map(|(sc, p)| self.table.get(sc).map(|v| (p / total, v)))
                    .collect();
                return WeightVector::blend(&terms, DEFAULT_SUM_TOLERANCE, "scenario_mix").map_err(
                    |_| WeightingError::DegenerateWeights {
                        method: "scenario_mix".to_string(),
                    },
                );
            }
            warn!(scenario = %scenario, "shock probabilities carry no mass; using named scenario");
        }
        self.table
            .get(&scenario)
            .cloned()
            .ok_or_else(|| WeightingError::DegenerateWeights {
                method: format!("scenario {scenario}"),
            })
    }
}
