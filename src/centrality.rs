//! Dependency-graph analysis: damped centrality and cascade multipliers.
//!
//! `D[i][j]` is how strongly category `i` depends on category `j`; `U[i][j]`
//! is the noise of that estimate. Both are repaired into their admissible
//! ranges before use.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::warn;

use crate::config::CentralityConfig;
use crate::error::{ConfigurationError, WeightingError};
use crate::registry::ComponentRegistry;
use crate::weights::WeightVector;

pub const MIN_DEPENDENCY: f64 = 0.1;
pub const MAX_DEPENDENCY: f64 = 1.0;
pub const MAX_UNCERTAINTY: f64 = 0.5;

const ROW_SUM_FLOOR: f64 = 1e-12;

/// Counts of entries changed while bringing matrices into range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub clamped: usize,
    /// Non-finite entries replaced with the configured default.
    pub defaulted: usize,
}

impl RepairReport {
    pub fn total(&self) -> usize {
        self.clamped + self.defaulted
    }
}

#[derive(Debug, Clone)]
pub struct DependencyNetwork {
    names: Vec<String>,
    dependency: DMatrix<f64>,
    uncertainty: DMatrix<f64>,
    repairs: RepairReport,
}

impl DependencyNetwork {
    /// Validate shapes and repair out-of-range entries.
    pub fn new(
        names: Vec<String>,
        mut dependency: DMatrix<f64>,
        mut uncertainty: DMatrix<f64>,
        cfg: &CentralityConfig,
    ) -> Result<Self, ConfigurationError> {
        let n = names.len();
        for m in [&dependency, &uncertainty] {
            if m.nrows() != n || m.ncols() != n {
                return Err(ConfigurationError::ShapeMismatch {
                    expected: n,
                    rows: m.nrows(),
                    cols: m.ncols(),
                });
            }
        }

        let mut repairs = RepairReport::default();
        let dependency_rule = EntryRule {
            matrix: "dependency",
            diagonal: 1.0,
            lo: MIN_DEPENDENCY,
            hi: MAX_DEPENDENCY,
            default: cfg.repair_default,
        };
        let uncertainty_rule = EntryRule {
            matrix: "uncertainty",
            diagonal: 0.0,
            lo: 0.0,
            hi: MAX_UNCERTAINTY,
            default: cfg.repair_default.min(MAX_UNCERTAINTY),
        };
        for i in 0..n {
            for j in 0..n {
                let edge = (names[i].as_str(), names[j].as_str());
                dependency_rule.apply(&mut dependency[(i, j)], i == j, edge, &mut repairs);
                uncertainty_rule.apply(&mut uncertainty[(i, j)], i == j, edge, &mut repairs);
            }
        }
        if repairs.total() > 0 {
            warn!(
                clamped = repairs.clamped,
                defaulted = repairs.defaulted,
                "repaired dependency network entries"
            );
        }
        Ok(Self {
            names,
            dependency,
            uncertainty,
            repairs,
        })
    }

    pub fn from_registry(
        registry: &ComponentRegistry,
        names: &[String],
        cfg: &CentralityConfig,
    ) -> Result<Self, ConfigurationError> {
        let dependency = registry.dependency_matrix(names)?;
        let uncertainty = registry.uncertainty_matrix(names)?;
        Self::new(names.to_vec(), dependency, uncertainty, cfg)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn dependency(&self) -> &DMatrix<f64> {
        &self.dependency
    }

    pub fn uncertainty(&self) -> &DMatrix<f64> {
        &self.uncertainty
    }

    pub fn repairs(&self) -> RepairReport {
        self.repairs
    }

    /// Row-stochastic transition matrix; zero rows stay zero.
    pub fn transition(&self) -> DMatrix<f64> {
        let mut t = self.dependency.clone();
        for i in 0..t.nrows() {
            let sum = t.row(i).sum().max(ROW_SUM_FLOOR);
            for j in 0..t.ncols() {
                t[(i, j)] /= sum;
            }
        }
        t
    }
}

struct EntryRule {
    matrix: &'static str,
    diagonal: f64,
    lo: f64,
    hi: f64,
    default: f64,
}

impl EntryRule {
    fn apply(&self, value: &mut f64, on_diagonal: bool, (from, to): (&str, &str), repairs: &mut RepairReport) {
        if on_diagonal {
            if *value != self.diagonal {
                *value = self.diagonal;
                repairs.clamped += 1;
            }
            return;
        }
        if !value.is_finite() {
            warn!(
                matrix = self.matrix,
                from,
                to,
                value = *value,
                default = self.default,
                "non-finite entry replaced"
            );
            *value = self.default;
            repairs.defaulted += 1;
        } else if *value < self.lo || *value > self.hi {
            *value = value.clamp(self.lo, self.hi);
            repairs.clamped += 1;
        }
    }
}

// =============================================================================
// Damped centrality
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CentralityResult {
    pub distribution: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
    pub l1_delta: f64,
}

/// `rank <- (1 - d)/n + d * T^T * rank`, renormalized each step, until the
/// L1 change drops below the tolerance or the iteration cap is reached.
/// The final vector is returned either way.
pub fn damped_centrality(
    network: &DependencyNetwork,
    cfg: &CentralityConfig,
) -> Result<CentralityResult, WeightingError> {
    let n = network.names.len();
    if n == 0 {
        return Err(WeightingError::NoCategories);
    }
    if !(0.0 < cfg.damping && cfg.damping < 1.0) {
        return Err(WeightingError::Centrality {
            message: format!("damping must lie in (0, 1), got {}", cfg.damping),
        });
    }

    let transition_t = network.transition().transpose();
    let teleport = (1.0 - cfg.damping) / n as f64;
    let mut rank = DVector::from_element(n, 1.0 / n as f64);

    let mut l1_delta = f64::INFINITY;
    for iter in 1..=cfg.max_iterations {
        let mut next = &transition_t * &rank;
        next *= cfg.damping;
        next.add_scalar_mut(teleport);
        let sum = next.sum();
        if sum <= 0.0 || !sum.is_finite() {
            return Err(WeightingError::Centrality {
                message: format!("rank vector degenerated at iteration {iter}"),
            });
        }
        next /= sum;

        l1_delta = (&next - &rank).abs().sum();
        rank = next;
        if l1_delta < cfg.tolerance {
            return Ok(CentralityResult {
                distribution: rank.iter().copied().collect(),
                iterations: iter,
                converged: true,
                l1_delta,
            });
        }
    }

    warn!(
        iterations = cfg.max_iterations,
        l1_delta, "centrality iteration hit cap before converging"
    );
    Ok(CentralityResult {
        distribution: rank.iter().copied().collect(),
        iterations: cfg.max_iterations,
        converged: false,
        l1_delta,
    })
}

// =============================================================================
// Cascade multipliers
// =============================================================================

fn column_sum_excluding_self(d: &DMatrix<f64>, col: usize) -> f64 {
    (0..d.nrows()).filter(|&r| r != col).map(|r| d[(r, col)]).sum()
}

/// Downstream impact of each category's failure, normalized to sum 1.
///
/// Primary impact is the column sum excluding self; secondary impact adds
/// every dependant's own downstream exposure, damped. The total is discounted
/// by the column's mean uncertainty.
pub fn cascade_multipliers(network: &DependencyNetwork, cfg: &CentralityConfig) -> Vec<f64> {
    let d = &network.dependency;
    let u = &network.uncertainty;
    let n = d.nrows();
    if n == 0 {
        return Vec::new();
    }
    let downstream: Vec<f64> = (0..n).map(|j| column_sum_excluding_self(d, j)).collect();

    let impacts: Vec<f64> = (0..n)
        .map(|i| {
            let primary = downstream[i];
            let secondary: f64 = (0..n)
                .filter(|&j| j != i)
                .map(|j| d[(j, i)] * downstream[j] * cfg.cascade_damping)
                .sum();
            let mean_uncertainty = u.column(i).sum() / n as f64;
            ((primary + secondary) * (1.0 - cfg.uncertainty_discount * mean_uncertainty)).max(0.0)
        })
        .collect();

    let max = impacts.iter().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return vec![1.0 / n as f64; n];
    }
    let scaled: Vec<f64> = impacts.iter().map(|v| v / max).collect();
    let total: f64 = scaled.iter().sum();
    scaled.iter().map(|v| v / total).collect()
}

/// Mean outgoing uncertainty per category.
pub fn uncertainty_scores(network: &DependencyNetwork) -> Vec<f64> {
    let u = &network.uncertainty;
    let n = u.nrows().max(1) as f64;
    (0..u.nrows()).map(|i| u.row(i).sum() / n).collect()
}

// =============================================================================
// Analysis bundle
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct NetworkAnalysis {
    pub centrality: WeightVector,
    pub cascade: WeightVector,
    pub uncertainty: BTreeMap<String, f64>,
    pub converged: bool,
    pub iterations: usize,
    pub l1_delta: f64,
    pub repairs: RepairReport,
}

impl NetworkAnalysis {
    /// `centrality_share * centrality + cascade_share * cascade`.
    pub fn network_weights(
        &self,
        cfg: &CentralityConfig,
        sum_tolerance: f64,
    ) -> Result<WeightVector, WeightingError> {
        WeightVector::blend(
            &[
                (cfg.centrality_share, &self.centrality),
                (cfg.cascade_share, &self.cascade),
            ],
            sum_tolerance,
            "network",
        )
        .map_err(|_| WeightingError::DegenerateWeights {
            method: "network".to_string(),
        })
    }
}

pub fn analyze(
    network: &DependencyNetwork,
    cfg: &CentralityConfig,
) -> Result<NetworkAnalysis, WeightingError> {
    let centrality = damped_centrality(network, cfg)?;
    let cascade = cascade_multipliers(network, cfg);
    let to_vector = |values: &[f64], method: &str| {
        WeightVector::from_raw(network.names.iter().cloned().zip(values.iter().copied()).collect())
            .map_err(|_| WeightingError::DegenerateWeights {
                method: method.to_string(),
            })
    };
    Ok(NetworkAnalysis {
        centrality: to_vector(&centrality.distribution, "centrality")?,
        cascade: to_vector(&cascade, "cascade")?,
        uncertainty: network
            .names
            .iter()
            .cloned()
            .zip(uncertainty_scores(network))
            .collect(),
        converged: centrality.converged,
        iterations: centrality.iterations,
        l1_delta: centrality.l1_delta,
        repairs: network.repairs,
    })
}
