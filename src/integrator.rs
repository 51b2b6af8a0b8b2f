//! Hybrid integrator: turns a portfolio plus a weighting request into one
//! normalized category weight vector and its per-component split.
//!
//! Weighting runs as an explicit strategy chain. The requested method is
//! tried first, then the registry judgment matrix, then equal weights across
//! the categories present. Failures along the way are logged and recorded on
//! the result, never raised, unless the whole chain is exhausted.
//!
//! Everything that does not depend on allocations (scenario table, network
//! analysis, judgment matrix, context weights, calibration evidence) is
//! resolved once in [`WeightingPlan::prepare`]. [`WeightingPlan::weights_at`]
//! then only redoes the allocation-dependent parts, which keeps the
//! optimizer's per-iteration cost to a few vector operations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calibration::{CalibrationStore, FrozenCalibration};
use crate::centrality::{self, DependencyNetwork};
use crate::component::Component;
use crate::config::{CalibrationMethod, EngineConfig, HybridCoefficients};
use crate::error::{CalculationError, EngineError, WeightingError};
use crate::judgment::{accept_and_weigh, JudgmentMatrix, Scenario, ScenarioTable};
use crate::registry::ComponentRegistry;
use crate::vulnerability::vulnerability;
use crate::weights::WeightVector;

// =============================================================================
// Methods and requests
// =============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    /// Scenario table only.
    Expert,
    /// Centrality and cascade blend over the dependency network.
    Network,
    /// Allocation share per category.
    Financial,
    /// Registry context adjustments.
    Context,
    #[default]
    Hybrid,
    /// Registry judgment matrix.
    Judgment,
}

impl WeightingMethod {
    pub const ALL: [WeightingMethod; 6] = [
        WeightingMethod::Expert,
        WeightingMethod::Network,
        WeightingMethod::Financial,
        WeightingMethod::Context,
        WeightingMethod::Hybrid,
        WeightingMethod::Judgment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WeightingMethod::Expert => "expert",
            WeightingMethod::Network => "network",
            WeightingMethod::Financial => "financial",
            WeightingMethod::Context => "context",
            WeightingMethod::Hybrid => "hybrid",
            WeightingMethod::Judgment => "judgment",
        }
    }

    pub fn available() -> String {
        Self::ALL.map(WeightingMethod::as_str).join(", ")
    }
}

impl fmt::Display for WeightingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightingMethod {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == needle)
            .ok_or_else(|| crate::error::ValidationError::UnknownMethod {
                name: s.to_string(),
                available: Self::available(),
            })
    }
}

/// How to weight a portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingRequest {
    pub method: WeightingMethod,
    pub scenario: Scenario,
    /// When present with positive mass, replaces `scenario` by the
    /// probability-weighted mix of scenario vectors.
    pub shock_probabilities: Option<BTreeMap<Scenario, f64>>,
    /// Registry context keys in effect, e.g. `climate_vulnerable`.
    pub context: BTreeSet<String>,
    pub performance_adjust: bool,
}

impl WeightingRequest {
    pub fn new(method: WeightingMethod, scenario: Scenario) -> Self {
        Self {
            method,
            scenario,
            ..Self::default()
        }
    }

    pub fn with_performance_adjust(mut self) -> Self {
        self.performance_adjust = true;
        self
    }
}

/// Read-only collaborators the integrator draws on.
#[derive(Clone, Copy)]
pub struct WeightingSources<'a> {
    pub config: &'a EngineConfig,
    pub registry: &'a ComponentRegistry,
    pub scenarios: &'a ScenarioTable,
    pub calibration: &'a CalibrationStore,
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentWeight {
    pub id: String,
    pub category: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegratedWeights {
    pub requested: WeightingMethod,
    /// Strategy that produced the weights: a method name or `equal`.
    pub strategy_used: String,
    /// True when the requested method did not produce the weights.
    pub degraded: bool,
    pub calibrated: bool,
    pub weights: WeightVector,
    /// Category weight split evenly across the category's components, in
    /// input order.
    pub component_weights: Vec<ComponentWeight>,
    /// `strategy: error` for every strategy that failed.
    pub failures: Vec<String>,
}

impl IntegratedWeights {
    pub fn component_vector(&self) -> Vec<f64> {
        self.component_weights.iter().map(|c| c.weight).collect()
    }
}

// =============================================================================
// Strategy chain
// =============================================================================

const EQUAL: &str = "equal";

#[derive(Debug, Clone)]
enum BaseWeights {
    /// Allocation-independent vector.
    Fixed(WeightVector),
    Financial,
    /// Unnormalized static terms plus the financial coefficient.
    Hybrid {
        fixed: BTreeMap<String, f64>,
        financial: f64,
    },
}

#[derive(Debug, Clone)]
struct Strategy {
    name: &'static str,
    base: BaseWeights,
}

/// Allocation-independent state for repeated weighting of one portfolio.
#[derive(Debug, Clone)]
pub struct WeightingPlan {
    requested: WeightingMethod,
    categories: Vec<String>,
    /// Category index of each component.
    membership: Vec<usize>,
    members: Vec<usize>,
    ids: Vec<String>,
    gaps: Vec<f64>,
    sensitivities: Vec<f64>,
    chain: Vec<Strategy>,
    failures: Vec<String>,
    calibration: Option<FrozenCalibration>,
    calibration_method: CalibrationMethod,
    performance_adjust: Option<(f64, f64)>,
    sum_tolerance: f64,
}

impl WeightingPlan {
    /// Resolve the strategy chain for `components`, which must already have
    /// been through [`prepare_components`](crate::component::prepare_components).
    pub fn prepare(
        components: &[Component],
        request: &WeightingRequest,
        sources: WeightingSources<'_>,
    ) -> Result<Self, WeightingError> {
        let mut categories: Vec<String> = Vec::new();
        let mut membership = Vec::with_capacity(components.len());
        for c in components {
            let idx = match categories.iter().position(|cat| *cat == c.category) {
                Some(idx) => idx,
                None => {
                    categories.push(c.category.clone());
                    categories.len() - 1
                }
            };
            membership.push(idx);
        }
        if categories.is_empty() {
            return Err(WeightingError::NoCategories);
        }
        let mut members = vec![0usize; categories.len()];
        for &idx in &membership {
            members[idx] += 1;
        }

        let mut chain = Vec::new();
        let mut failures = Vec::new();
        let mut tiers = vec![request.method];
        if request.method != WeightingMethod::Judgment {
            tiers.push(WeightingMethod::Judgment);
        }
        for method in tiers {
            match build_base(method, &categories, request, sources) {
                Ok(base) => chain.push(Strategy {
                    name: method.as_str(),
                    base,
                }),
                Err(err) => {
                    warn!(method = method.as_str(), error = %err, "weighting strategy unavailable");
                    failures.push(format!("{method}: {err}"));
                }
            }
        }
        if let Ok(equal) = WeightVector::equal(categories.iter().cloned()) {
            chain.push(Strategy {
                name: EQUAL,
                base: BaseWeights::Fixed(equal),
            });
        }

        let weighting = &sources.config.weighting;
        Ok(Self {
            requested: request.method,
            categories,
            membership,
            members,
            ids: components.iter().map(|c| c.id.clone()).collect(),
            gaps: components.iter().map(Component::gap).collect(),
            sensitivities: components.iter().map(Component::sensitivity).collect(),
            chain,
            failures,
            calibration: sources.calibration.freeze(),
            calibration_method: weighting.calibration_method,
            performance_adjust: request
                .performance_adjust
                .then_some((weighting.adjustment_min, weighting.adjustment_max)),
            sum_tolerance: weighting.sum_tolerance,
        })
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn requested(&self) -> WeightingMethod {
        self.requested
    }

    /// Weights for the portfolio at `allocations` (one per component, input order).
    ///
    /// An unfunded portfolio has no allocation shares, so a failed financial
    /// strategy skips the judgment tier and lands on equal weights.
    pub fn weights_at(&self, allocations: &[f64]) -> Result<IntegratedWeights, EngineError> {
        if allocations.len() != self.ids.len() {
            return Err(CalculationError::LengthMismatch {
                expected: self.ids.len(),
                got: allocations.len(),
            }
            .into());
        }

        let mut failures = self.failures.clone();
        let mut chosen = None;
        let mut equal_only = false;
        for strategy in &self.chain {
            if equal_only && strategy.name != EQUAL {
                continue;
            }
            match self.evaluate(&strategy.base, allocations) {
                Ok(weights) => {
                    chosen = Some((strategy.name, weights));
                    break;
                }
                Err(err) => {
                    warn!(method = strategy.name, error = %err, "weighting strategy failed");
                    failures.push(format!("{}: {err}", strategy.name));
                    equal_only = matches!(strategy.base, BaseWeights::Financial);
                }
            }
        }
        let Some((strategy_used, base)) = chosen else {
            return Err(WeightingError::AllStrategiesFailed { attempts: failures }.into());
        };

        let mut calibrated = false;
        let base = match &self.calibration {
            Some(frozen) => match frozen.calibrate(&base, self.calibration_method) {
                Ok(w) => {
                    calibrated = true;
                    w
                }
                Err(err) => {
                    warn!(error = %err, "calibration failed; using uncalibrated weights");
                    base
                }
            },
            None => base,
        };

        let weights = match self.performance_adjust {
            Some(range) => self.adjust_for_performance(&base, allocations, range)?,
            None => base,
        };

        let component_weights = self.split(&weights);
        Ok(IntegratedWeights {
            requested: self.requested,
            strategy_used: strategy_used.to_string(),
            degraded: strategy_used != self.requested.as_str(),
            calibrated,
            weights,
            component_weights,
            failures,
        })
    }

    fn evaluate(&self, base: &BaseWeights, allocations: &[f64]) -> Result<WeightVector, WeightingError> {
        match base {
            BaseWeights::Fixed(w) => Ok(w.clone()),
            BaseWeights::Financial => WeightVector::renormalized(
                self.financial_share(allocations),
                self.sum_tolerance,
                WeightingMethod::Financial.as_str(),
            )
            .map_err(|_| WeightingError::DegenerateWeights {
                method: WeightingMethod::Financial.to_string(),
            }),
            BaseWeights::Hybrid { fixed, financial } => {
                let share = self.financial_share(allocations);
                let raw = fixed
                    .iter()
                    .map(|(cat, w)| {
                        let f = share.get(cat).copied().unwrap_or(0.0);
                        (cat.clone(), w + financial * f)
                    })
                    .collect();
                WeightVector::renormalized(raw, self.sum_tolerance, WeightingMethod::Hybrid.as_str())
                    .map_err(|_| WeightingError::DegenerateWeights {
                        method: WeightingMethod::Hybrid.to_string(),
                    })
            }
        }
    }

    /// Allocation share per category; all zero when nothing is allocated.
    fn financial_share(&self, allocations: &[f64]) -> BTreeMap<String, f64> {
        let total: f64 = allocations.iter().sum();
        let mut share: BTreeMap<String, f64> =
            self.categories.iter().map(|c| (c.clone(), 0.0)).collect();
        if total > 0.0 && total.is_finite() {
            for (&idx, a) in self.membership.iter().zip(allocations) {
                if let Some(s) = share.get_mut(&self.categories[idx]) {
                    *s += a / total;
                }
            }
        }
        share
    }

    /// Scale each category by `1 + mean component vulnerability`, clamped.
    fn adjust_for_performance(
        &self,
        base: &WeightVector,
        allocations: &[f64],
        (lo, hi): (f64, f64),
    ) -> Result<WeightVector, EngineError> {
        let mut totals = vec![0.0; self.categories.len()];
        for (i, &idx) in self.membership.iter().enumerate() {
            totals[idx] += vulnerability(self.gaps[i], allocations[i], self.sensitivities[i])?;
        }
        let raw: BTreeMap<String, f64> = self
            .categories
            .iter()
            .zip(totals.iter().zip(&self.members))
            .map(|(cat, (total, &count))| {
                let mean = total / count.max(1) as f64;
                let factor = (1.0 + mean).clamp(lo, hi);
                (cat.clone(), base.get(cat).unwrap_or(0.0) * factor)
            })
            .collect();
        Ok(WeightVector::from_raw(raw)?)
    }

    fn split(&self, weights: &WeightVector) -> Vec<ComponentWeight> {
        self.ids
            .iter()
            .zip(&self.membership)
            .map(|(id, &idx)| {
                let category = &self.categories[idx];
                ComponentWeight {
                    id: id.clone(),
                    category: category.clone(),
                    weight: weights.get(category).unwrap_or(0.0) / self.members[idx] as f64,
                }
            })
            .collect()
    }
}

fn build_base(
    method: WeightingMethod,
    categories: &[String],
    request: &WeightingRequest,
    sources: WeightingSources<'_>,
) -> Result<BaseWeights, WeightingError> {
    let cfg = sources.config;
    match method {
        WeightingMethod::Expert => expert_weights(categories, request, sources).map(BaseWeights::Fixed),
        WeightingMethod::Network => {
            let analysis = network_analysis(categories, sources)?;
            analysis
                .network_weights(&cfg.centrality, cfg.weighting.sum_tolerance)
                .map(BaseWeights::Fixed)
        }
        WeightingMethod::Financial => Ok(BaseWeights::Financial),
        WeightingMethod::Context => {
            let all = sources
                .registry
                .context_weights(&request.context)
                .map_err(|e| degenerate("context", e))?;
            all.restrict_to(categories.iter().map(String::as_str))
                .map(BaseWeights::Fixed)
                .map_err(|e| degenerate("context", e))
        }
        WeightingMethod::Judgment => {
            let matrix = JudgmentMatrix::from_registry(sources.registry, categories, &cfg.judgment)?;
            let fallback: Vec<f64> = sources
                .registry
                .snapshot(categories)
                .map_err(|e| degenerate("judgment", e))?
                .iter()
                .map(|m| m.default_weight)
                .collect();
            let result = accept_and_weigh(matrix, &fallback, &cfg.judgment)?;
            debug!(
                lambda_max = result.lambda_max,
                consistency_ratio = result.consistency_ratio,
                fallback_used = result.fallback_used,
                "judgment weights"
            );
            Ok(BaseWeights::Fixed(result.weights))
        }
        WeightingMethod::Hybrid => {
            let coef: HybridCoefficients = cfg.weighting.hybrid;
            let expert = expert_weights(categories, request, sources)?;
            let analysis = network_analysis(categories, sources)?;
            let fixed = categories
                .iter()
                .map(|cat| {
                    let term = |w: &WeightVector| w.get(cat).unwrap_or(0.0);
                    let value = coef.expert * term(&expert)
                        + coef.centrality * term(&analysis.centrality)
                        + coef.cascade * term(&analysis.cascade);
                    (cat.clone(), value)
                })
                .collect();
            Ok(BaseWeights::Hybrid {
                fixed,
                financial: coef.financial,
            })
        }
    }
}

/// Scenario weights over `categories`. Categories the table does not cover
/// enter at their registry default weight.
fn expert_weights(
    categories: &[String],
    request: &WeightingRequest,
    sources: WeightingSources<'_>,
) -> Result<WeightVector, WeightingError> {
    let table = sources
        .scenarios
        .get_scenario_weights(request.scenario, request.shock_probabilities.as_ref())?;
    let raw = categories
        .iter()
        .map(|cat| {
            let w = table
                .get(cat)
                .or_else(|| sources.registry.get(cat).map(|m| m.default_weight))
                .unwrap_or(0.0);
            (cat.clone(), w)
        })
        .collect();
    WeightVector::from_raw(raw).map_err(|e| degenerate("expert", e))
}

fn network_analysis(
    categories: &[String],
    sources: WeightingSources<'_>,
) -> Result<centrality::NetworkAnalysis, WeightingError> {
    let cfg = &sources.config.centrality;
    let network = DependencyNetwork::from_registry(sources.registry, categories, cfg).map_err(|e| {
        WeightingError::Centrality {
            message: e.to_string(),
        }
    })?;
    let analysis = centrality::analyze(&network, cfg)?;
    if !analysis.converged {
        debug!(
            iterations = analysis.iterations,
            l1_delta = analysis.l1_delta,
            "centrality did not converge; using last iterate"
        );
    }
    Ok(analysis)
}

fn degenerate(method: &str, err: impl fmt::Display) -> WeightingError {
    debug!(method, error = %err, "degenerate weights");
    WeightingError::DegenerateWeights {
        method: method.to_string(),
    }
}

/// One-shot weighting at the components' current allocations.
pub fn integrate(
    components: &[Component],
    request: &WeightingRequest,
    sources: WeightingSources<'_>,
) -> Result<IntegratedWeights, EngineError> {
    let plan = WeightingPlan::prepare(components, request, sources)?;
    let allocations: Vec<f64> = components.iter().map(|c| c.financial_allocation).collect();
    plan.weights_at(&allocations)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::component::{prepare_components, ComponentType};
    use crate::registry::CategoryMetadata;

    struct Fixture {
        config: EngineConfig,
        registry: ComponentRegistry,
        scenarios: ScenarioTable,
        calibration: CalibrationStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: EngineConfig::default(),
                registry: ComponentRegistry::default(),
                scenarios: ScenarioTable::default(),
                calibration: CalibrationStore::default(),
            }
        }

        fn sources(&self) -> WeightingSources<'_> {
            WeightingSources {
                config: &self.config,
                registry: &self.registry,
                scenarios: &self.scenarios,
                calibration: &self.calibration,
            }
        }

        fn portfolio(&self) -> Vec<Component> {
            let raw = vec![
                Component::new("maize", "agriculture", 60.0, 100.0, 120.0),
                Component::new("roads", "infrastructure", 70.0, 100.0, 200.0),
                Component::new("clinics", "nutrition", 40.0, 100.0, 80.0),
                Component::new("school_meals", "nutrition", 90.0, 100.0, 40.0),
                Component::new("cash", "social protection", 50.0, 100.0, 60.0),
            ];
            prepare_components(&raw, &self.registry, &self.config.validation).unwrap()
        }
    }

    fn assert_normalized(w: &IntegratedWeights) {
        assert!((w.weights.sum() - 1.0).abs() < 1e-9);
        let split: f64 = w.component_weights.iter().map(|c| c.weight).sum();
        assert!((split - 1.0).abs() < 1e-9);
    }

    #[test]
    fn every_method_yields_normalized_weights() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        for method in WeightingMethod::ALL {
            let request = WeightingRequest::new(method, Scenario::ClimateShock);
            let result = integrate(&components, &request, fx.sources()).unwrap();
            assert_normalized(&result);
            assert_eq!(result.strategy_used, method.as_str());
            assert!(!result.degraded);
            assert_eq!(result.weights.len(), 4);
        }
    }

    #[test]
    fn category_weight_is_split_across_members() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let request = WeightingRequest::new(WeightingMethod::Expert, Scenario::NormalOperations);
        let result = integrate(&components, &request, fx.sources()).unwrap();
        let nutrition = result
            .weights
            .get(ComponentType::NutritionHealth.as_str())
            .unwrap();
        assert!((result.component_weights[2].weight - nutrition / 2.0).abs() < 1e-12);
        assert_eq!(result.component_weights[2].weight, result.component_weights[3].weight);
    }

    #[test]
    fn financial_method_tracks_allocations() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let plan = WeightingPlan::prepare(
            &components,
            &WeightingRequest::new(WeightingMethod::Financial, Scenario::NormalOperations),
            fx.sources(),
        )
        .unwrap();
        let result = plan.weights_at(&[100.0, 100.0, 100.0, 100.0, 100.0]).unwrap();
        assert!((result.weights.get("nutrition_health").unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn zero_allocations_degrade_to_equal_weights() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let plan = WeightingPlan::prepare(
            &components,
            &WeightingRequest::new(WeightingMethod::Financial, Scenario::NormalOperations),
            fx.sources(),
        )
        .unwrap();
        let result = plan.weights_at(&[0.0; 5]).unwrap();
        assert!(result.degraded);
        assert_eq!(result.strategy_used, "equal");
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].starts_with("financial"));
        for (_, w) in result.weights.iter() {
            assert!((w - 0.25).abs() < 1e-12);
        }
        assert_normalized(&result);
    }

    #[test]
    #[traced_test]
    fn unfunded_hybrid_is_renormalized() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let plan = WeightingPlan::prepare(
            &components,
            &WeightingRequest::new(WeightingMethod::Hybrid, Scenario::NormalOperations),
            fx.sources(),
        )
        .unwrap();
        let BaseWeights::Hybrid { fixed, financial } = &plan.chain[0].base else {
            panic!("hybrid plan without a hybrid base");
        };
        // Static terms alone miss the financial coefficient.
        let drift = crate::weights::sum_drift(fixed, plan.sum_tolerance).unwrap();
        assert!((drift - (1.0 - financial)).abs() < 1e-9);

        let result = plan.weights_at(&[0.0; 5]).unwrap();
        assert_eq!(result.strategy_used, "hybrid");
        assert_normalized(&result);
        assert!(logs_contain("weight sum drifted"));
    }

    #[test]
    fn single_custom_category_takes_full_weight() {
        let fx = Fixture::new();
        let mut meta = CategoryMetadata::new("Fisheries", 0.1, 0.01, 0.3);
        meta.hierarchy_tier = 2;
        fx.registry.register("fisheries", meta).unwrap();
        let raw = vec![
            Component::new("nets", "fisheries", 50.0, 100.0, 10.0),
            Component::new("ponds", "fisheries", 50.0, 100.0, 10.0),
        ];
        let components = prepare_components(&raw, &fx.registry, &fx.config.validation).unwrap();
        for method in WeightingMethod::ALL {
            let result = integrate(
                &components,
                &WeightingRequest::new(method, Scenario::NormalOperations),
                fx.sources(),
            )
            .unwrap();
            assert_eq!(result.weights.get("fisheries"), Some(1.0));
            assert_normalized(&result);
        }
    }

    #[test]
    fn performance_adjust_favours_vulnerable_categories() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let plain = WeightingRequest::new(WeightingMethod::Expert, Scenario::NormalOperations);
        let adjusted = plain.clone().with_performance_adjust();
        let a = integrate(&components, &plain, fx.sources()).unwrap();
        let b = integrate(&components, &adjusted, fx.sources()).unwrap();
        assert_normalized(&b);
        // clinics carry the largest gap; roads the smallest relative to funding
        let ratio = |w: &IntegratedWeights, cat: &str| w.weights.get(cat).unwrap();
        assert!(
            ratio(&b, "nutrition_health") / ratio(&b, "infrastructure")
                > ratio(&a, "nutrition_health") / ratio(&a, "infrastructure")
        );
    }

    #[test]
    fn calibration_evidence_is_applied_and_frozen() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let request = WeightingRequest::new(WeightingMethod::Expert, Scenario::NormalOperations);
        let before = integrate(&components, &request, fx.sources()).unwrap();
        assert!(!before.calibrated);

        fx.calibration
            .add_sample("infrastructure", &[0.9; 80], "audit")
            .unwrap();
        let plan = WeightingPlan::prepare(&components, &request, fx.sources()).unwrap();
        let allocations: Vec<f64> = components.iter().map(|c| c.financial_allocation).collect();
        let first = plan.weights_at(&allocations).unwrap();
        assert!(first.calibrated);
        assert!(first.weights.get("infrastructure") > before.weights.get("infrastructure"));

        fx.calibration
            .add_sample("infrastructure", &[0.0; 80], "revision")
            .unwrap();
        assert_eq!(plan.weights_at(&allocations).unwrap(), first);
    }

    #[test]
    fn weighting_is_idempotent() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let request = WeightingRequest::new(WeightingMethod::Hybrid, Scenario::FinancialCrisis)
            .with_performance_adjust();
        let a = integrate(&components, &request, fx.sources()).unwrap();
        let b = integrate(&components, &request, fx.sources()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_mismatched_allocation_length() {
        let fx = Fixture::new();
        let components = fx.portfolio();
        let plan = WeightingPlan::prepare(&components, &WeightingRequest::default(), fx.sources())
            .unwrap();
        let err = plan.weights_at(&[1.0, 2.0]).unwrap_err();
        assert_eq!(err.code(), "calculation_error");
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("Hybrid".parse::<WeightingMethod>().unwrap(), WeightingMethod::Hybrid);
        let err = "pagerank".parse::<WeightingMethod>().unwrap_err();
        assert!(err.to_string().contains("expert, network"));
    }
}
