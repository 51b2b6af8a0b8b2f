//! Engine facade: one object per process that owns configuration, registry,
//! scenario table and calibration store, and runs analysis requests against
//! them.
//!
//! Requests are independent and the engine is `Send + Sync`; share it behind
//! an `Arc` across worker threads.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibration::{CalibrationStore, SurveyRecord};
use crate::component::{prepare_components, resolve_category, validate_budget, Component};
use crate::config::EngineConfig;
use crate::error::{ConfigurationError, EngineError, ValidationError};
use crate::integrator::{
    ComponentWeight, IntegratedWeights, WeightingMethod, WeightingPlan, WeightingRequest,
    WeightingSources,
};
use crate::judgment::{Scenario, ScenarioTable};
use crate::optimizer::{
    optimize_allocations, AllocationConstraints, OptimizationOutcome, OptimizationRun,
    PortfolioObjective,
};
use crate::registry::ComponentRegistry;
use crate::vulnerability::{
    evaluate_component, system_vulnerability, ComponentResult, RiskLevel, SystemSummary,
};
use crate::weights::WeightVector;

// =============================================================================
// Request document
// =============================================================================

/// One analysis request as exchanged with collaborators (CLI, services).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisRequest {
    pub components: Vec<Component>,
    /// Defaults to the portfolio's total allocation.
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub weighting: WeightingRequest,
    #[serde(default)]
    pub constraints: AllocationConstraints,
    #[serde(default)]
    pub calibration: CalibrationInput,
    /// Scenario subset for weight sensitivity analysis.
    #[serde(default)]
    pub scenarios: Option<Vec<Scenario>>,
    /// Method subset for method comparison.
    #[serde(default)]
    pub methods: Option<Vec<WeightingMethod>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalibrationInput {
    #[serde(default)]
    pub samples: Vec<SampleInput>,
    #[serde(default)]
    pub surveys: Vec<SurveyRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleInput {
    pub category: String,
    pub values: Vec<f64>,
    #[serde(default = "default_sample_source")]
    pub source: String,
}

fn default_sample_source() -> String {
    "request".to_string()
}

impl AnalysisRequest {
    pub fn budget_or_total(&self) -> f64 {
        self.budget
            .unwrap_or_else(|| self.components.iter().map(|c| c.financial_allocation).sum())
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VulnerabilityReport {
    pub weighting: IntegratedWeights,
    pub components: Vec<ComponentResult>,
    pub summary: SystemSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationChange {
    pub id: String,
    pub category: String,
    pub original: f64,
    pub optimal: f64,
    pub change: f64,
    /// Relative change in percent; `None` for unfunded components.
    pub change_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub method: WeightingMethod,
    pub scenario: Scenario,
    pub outcome: OptimizationOutcome,
    pub allocations: Vec<AllocationChange>,
    pub original_risk_level: RiskLevel,
    pub optimal_risk_level: RiskLevel,
    /// Component results at the optimal allocation.
    pub optimal_components: Vec<ComponentResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioWeights {
    pub scenario: Scenario,
    pub strategy_used: String,
    pub weights: WeightVector,
    pub component_weights: Vec<ComponentWeight>,
}

/// Hybrid weights recomputed under each scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightSensitivity {
    pub scenarios: Vec<ScenarioWeights>,
    /// `max - min` weight per category across the scenarios.
    pub spread: BTreeMap<String, f64>,
    /// Category whose weight moves most across scenarios.
    pub most_sensitive: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodScore {
    pub method: WeightingMethod,
    pub strategy_used: String,
    pub degraded: bool,
    pub fsfvi: f64,
    pub risk_level: RiskLevel,
    pub weights: WeightVector,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodComparison {
    pub scores: Vec<MethodScore>,
    /// Method with the highest FSFVI.
    pub most_conservative: WeightingMethod,
    /// `max - min` FSFVI across methods.
    pub fsfvi_range: f64,
}

// =============================================================================
// Engine
// =============================================================================

pub struct FsfviEngine {
    config: Arc<EngineConfig>,
    registry: Arc<ComponentRegistry>,
    scenarios: ScenarioTable,
    calibration: Arc<CalibrationStore>,
}

impl FsfviEngine {
    /// Validate `config` and seed the registry and scenario table.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let calibration = CalibrationStore::new(config.calibration.clone())
            .with_sum_tolerance(config.weighting.sum_tolerance);
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(ComponentRegistry::default()),
            scenarios: ScenarioTable::default(),
            calibration: Arc::new(calibration),
        })
    }

    /// Share an existing registry, e.g. one extended at runtime.
    pub fn with_registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_calibration(mut self, calibration: Arc<CalibrationStore>) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn calibration(&self) -> &Arc<CalibrationStore> {
        &self.calibration
    }

    pub fn scenarios(&self) -> &ScenarioTable {
        &self.scenarios
    }

    fn sources(&self) -> WeightingSources<'_> {
        WeightingSources {
            config: &self.config,
            registry: &self.registry,
            scenarios: &self.scenarios,
            calibration: &self.calibration,
        }
    }

    /// Validate, normalize categories and resolve sensitivities.
    pub fn prepare(&self, components: &[Component]) -> Result<Vec<Component>, ValidationError> {
        prepare_components(components, &self.registry, &self.config.validation)
    }

    /// Append calibration evidence, resolving category names the same way
    /// component categories are resolved.
    pub fn add_calibration(&self, input: &CalibrationInput) -> Result<(), ValidationError> {
        let resolve = |raw: &str| {
            resolve_category(raw, &self.registry).ok_or_else(|| ValidationError::InvalidEvidence {
                category: raw.to_string(),
                message: "unknown category".to_string(),
            })
        };
        for sample in &input.samples {
            self.calibration
                .add_sample(&resolve(sample.category.as_str())?, &sample.values, &sample.source)?;
        }
        for survey in &input.surveys {
            let weights: BTreeMap<String, f64> = survey
                .weights
                .iter()
                .map(|(category, w)| Ok((resolve(category.as_str())?, *w)))
                .collect::<Result<_, ValidationError>>()?;
            self.calibration.add_survey(SurveyRecord {
                weights,
                ..survey.clone()
            })?;
        }
        Ok(())
    }

    pub fn calculate_weights(
        &self,
        components: &[Component],
        request: &WeightingRequest,
    ) -> Result<IntegratedWeights, EngineError> {
        let prepared = self.prepare(components)?;
        let weights = self.weights_for(&prepared, request)?;
        if let Some((category, weight)) = weights.weights.max_entry() {
            if weight > self.config.weighting.max_weight_concentration {
                warn!(category, weight, "weight concentrated on a single category");
            }
        }
        Ok(weights)
    }

    fn weights_for(
        &self,
        prepared: &[Component],
        request: &WeightingRequest,
    ) -> Result<IntegratedWeights, EngineError> {
        let plan = WeightingPlan::prepare(prepared, request, self.sources())?;
        let allocations: Vec<f64> = prepared.iter().map(|c| c.financial_allocation).collect();
        plan.weights_at(&allocations)
    }

    pub fn calculate_vulnerability(
        &self,
        components: &[Component],
        request: &WeightingRequest,
    ) -> Result<VulnerabilityReport, EngineError> {
        let prepared = self.prepare(components)?;
        let report = self.vulnerability_for(&prepared, request)?;
        info!(
            method = %request.method,
            strategy = %report.weighting.strategy_used,
            fsfvi = report.summary.fsfvi,
            risk_level = ?report.summary.risk_level,
            components = prepared.len(),
            "vulnerability calculated"
        );
        Ok(report)
    }

    fn vulnerability_for(
        &self,
        prepared: &[Component],
        request: &WeightingRequest,
    ) -> Result<VulnerabilityReport, EngineError> {
        let weighting = self.weights_for(prepared, request)?;
        let components = evaluate_all(prepared, None, &weighting)?;
        let summary = system_vulnerability(&components, &self.config.risk)?;
        Ok(VulnerabilityReport {
            weighting,
            components,
            summary,
        })
    }

    /// Reallocate `budget` to minimize FSFVI under `request`'s weighting.
    pub fn optimize(
        &self,
        components: &[Component],
        budget: f64,
        request: &WeightingRequest,
        constraints: &AllocationConstraints,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<OptimizationReport, EngineError> {
        let prepared = self.prepare(components)?;
        validate_budget(&prepared, budget, self.config.optimizer.budget_tolerance)?;
        let priority = self.priority_mask(&prepared, &constraints.priority_categories)?;

        let plan = WeightingPlan::prepare(&prepared, request, self.sources())?;
        let objective = PortfolioObjective::new(&plan, &prepared);
        let current: Vec<f64> = prepared.iter().map(|c| c.financial_allocation).collect();
        let outcome = optimize_allocations(
            &objective,
            &current,
            OptimizationRun {
                budget,
                constraints,
                priority: &priority,
                cancel_flag,
            },
            &self.config.optimizer,
        )?;

        let original = plan.weights_at(&current)?;
        let original_results = evaluate_all(&prepared, Some(&current), &original)?;
        let original_summary = system_vulnerability(&original_results, &self.config.risk)?;
        let optimal = plan.weights_at(&outcome.optimal_allocations)?;
        let optimal_components = evaluate_all(&prepared, Some(&outcome.optimal_allocations), &optimal)?;
        let optimal_summary = system_vulnerability(&optimal_components, &self.config.risk)?;

        let allocations = prepared
            .iter()
            .zip(&outcome.optimal_allocations)
            .map(|(c, &optimal)| {
                let change = optimal - c.financial_allocation;
                AllocationChange {
                    id: c.id.clone(),
                    category: c.category.clone(),
                    original: c.financial_allocation,
                    optimal,
                    change,
                    change_pct: (c.financial_allocation > 0.0)
                        .then(|| change / c.financial_allocation * 100.0),
                }
            })
            .collect();

        info!(
            method = %request.method,
            solver = outcome.solver.as_str(),
            status = %outcome.solver_status,
            success = outcome.success,
            iterations = outcome.iterations,
            original_fsfvi = outcome.original_fsfvi,
            optimal_fsfvi = outcome.optimal_fsfvi,
            "optimization completed"
        );
        Ok(OptimizationReport {
            method: request.method,
            scenario: request.scenario,
            original_risk_level: original_summary.risk_level,
            optimal_risk_level: optimal_summary.risk_level,
            outcome,
            allocations,
            optimal_components,
        })
    }

    fn priority_mask(
        &self,
        prepared: &[Component],
        priority_categories: &[String],
    ) -> Result<Vec<bool>, ValidationError> {
        let mut resolved = Vec::with_capacity(priority_categories.len());
        for raw in priority_categories {
            let category = resolve_category(raw, &self.registry).ok_or_else(|| {
                ValidationError::InvalidConstraint {
                    message: format!("unknown priority category {raw:?}"),
                }
            })?;
            resolved.push(category);
        }
        Ok(prepared
            .iter()
            .map(|c| resolved.iter().any(|p| *p == c.category))
            .collect())
    }

    /// Hybrid weights under each of `scenarios` (all scenarios when `None`).
    pub fn weight_sensitivity(
        &self,
        components: &[Component],
        scenarios: Option<&[Scenario]>,
        base: &WeightingRequest,
    ) -> Result<WeightSensitivity, EngineError> {
        let prepared = self.prepare(components)?;
        let selected: Vec<Scenario> = match scenarios {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => self.scenarios.scenarios().collect(),
        };

        let mut rows = Vec::with_capacity(selected.len());
        for scenario in selected {
            let request = WeightingRequest {
                method: WeightingMethod::Hybrid,
                scenario,
                shock_probabilities: None,
                ..base.clone()
            };
            let weighting = self.weights_for(&prepared, &request)?;
            rows.push(ScenarioWeights {
                scenario,
                strategy_used: weighting.strategy_used,
                weights: weighting.weights,
                component_weights: weighting.component_weights,
            });
        }

        let mut spread: BTreeMap<String, f64> = BTreeMap::new();
        if let Some(first) = rows.first() {
            for category in first.weights.categories() {
                let values = rows.iter().filter_map(|r| r.weights.get(category));
                let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
                spread.insert(category.to_string(), hi - lo);
            }
        }
        let most_sensitive = spread
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k.clone());
        Ok(WeightSensitivity {
            scenarios: rows,
            spread,
            most_sensitive,
        })
    }

    /// FSFVI of the same portfolio under each weighting method.
    pub fn compare_methods(
        &self,
        components: &[Component],
        base: &WeightingRequest,
        methods: Option<&[WeightingMethod]>,
    ) -> Result<MethodComparison, EngineError> {
        let prepared = self.prepare(components)?;
        let selected: Vec<WeightingMethod> = match methods {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => WeightingMethod::ALL.to_vec(),
        };

        let mut scores = Vec::with_capacity(selected.len());
        for method in selected {
            let request = WeightingRequest {
                method,
                ..base.clone()
            };
            let report = self.vulnerability_for(&prepared, &request)?;
            scores.push(MethodScore {
                method,
                strategy_used: report.weighting.strategy_used,
                degraded: report.weighting.degraded,
                fsfvi: report.summary.fsfvi,
                risk_level: report.summary.risk_level,
                weights: report.weighting.weights,
            });
        }

        let most_conservative = scores
            .iter()
            .max_by(|a, b| a.fsfvi.total_cmp(&b.fsfvi))
            .map(|s| s.method)
            .unwrap_or(base.method);
        let (lo, hi) = scores
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s.fsfvi), hi.max(s.fsfvi))
            });
        Ok(MethodComparison {
            scores,
            most_conservative,
            fsfvi_range: if hi >= lo { hi - lo } else { 0.0 },
        })
    }
}

impl Default for FsfviEngine {
    fn default() -> Self {
        Self {
            config: Arc::new(EngineConfig::default()),
            registry: Arc::new(ComponentRegistry::default()),
            scenarios: ScenarioTable::default(),
            calibration: Arc::new(CalibrationStore::default()),
        }
    }
}

/// Component results at `allocations` (current allocations when `None`).
fn evaluate_all(
    prepared: &[Component],
    allocations: Option<&[f64]>,
    weighting: &IntegratedWeights,
) -> Result<Vec<ComponentResult>, EngineError> {
    prepared
        .iter()
        .zip(&weighting.component_weights)
        .enumerate()
        .map(|(i, (c, w))| {
            let allocation = allocations.map_or(c.financial_allocation, |a| a[i]);
            Ok(evaluate_component(c, allocation, w.weight)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portfolio() -> Vec<Component> {
        vec![
            Component::new("seed", "Agricultural Development", 55.0, 100.0, 150.0),
            Component::new("storage", "storage and logistics", 80.0, 100.0, 250.0),
            Component::new("stunting", "nutrition", 30.0, 40.0, 120.0).prefer_lower(),
            Component::new("irrigation", "climate", 45.0, 100.0, 100.0),
            Component::new("transfers", "social_assistance", 60.0, 100.0, 80.0),
            Component::new("audit", "governance", 90.0, 100.0, 50.0),
        ]
    }

    #[test]
    fn engine_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FsfviEngine>();
    }

    #[test]
    fn vulnerability_report_is_consistent() {
        let engine = FsfviEngine::default();
        let report = engine
            .calculate_vulnerability(&portfolio(), &WeightingRequest::default())
            .unwrap();
        let total: f64 = report.components.iter().map(|c| c.weighted_vulnerability).sum();
        assert!((report.summary.fsfvi - total).abs() < 1e-12);
        let weight_sum: f64 = report.components.iter().map(|c| c.weight).sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
        assert_eq!(report.components[2].performance_gap, 0.0);
    }

    #[test]
    fn optimization_report_maps_back_to_components() {
        let engine = FsfviEngine::default();
        let request = WeightingRequest::new(WeightingMethod::Expert, Scenario::NormalOperations);
        let report = engine
            .optimize(&portfolio(), 750.0, &request, &AllocationConstraints::default(), None)
            .unwrap();
        assert!(report.outcome.success);
        assert_eq!(report.allocations.len(), 6);
        let total: f64 = report.allocations.iter().map(|a| a.optimal).sum();
        assert!((total - 750.0).abs() < 0.75);
        assert!(report.outcome.optimal_fsfvi <= report.outcome.original_fsfvi);
    }

    #[test]
    fn priority_categories_keep_their_funding() {
        let engine = FsfviEngine::default();
        let request = WeightingRequest::new(WeightingMethod::Expert, Scenario::NormalOperations);
        let constraints = AllocationConstraints {
            priority_categories: vec!["governance".to_string()],
            ..Default::default()
        };
        let report = engine
            .optimize(&portfolio(), 750.0, &request, &constraints, None)
            .unwrap();
        let audit = report.allocations.iter().find(|a| a.id == "audit").unwrap();
        assert!(audit.optimal >= 50.0 - 1e-9);

        let bad = AllocationConstraints {
            priority_categories: vec!["space_program".to_string()],
            ..Default::default()
        };
        let err = engine
            .optimize(&portfolio(), 750.0, &request, &bad, None)
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn budget_below_allocations_is_rejected() {
        let engine = FsfviEngine::default();
        let err = engine
            .optimize(
                &portfolio(),
                500.0,
                &WeightingRequest::default(),
                &AllocationConstraints::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::AllocationExceedsBudget { .. })
        ));
    }

    #[test]
    fn sensitivity_and_comparison_cover_requested_sets() {
        let engine = FsfviEngine::default();
        let sensitivity = engine
            .weight_sensitivity(
                &portfolio(),
                Some(&[Scenario::ClimateShock, Scenario::FinancialCrisis]),
                &WeightingRequest::default(),
            )
            .unwrap();
        assert_eq!(sensitivity.scenarios.len(), 2);
        assert_eq!(sensitivity.spread.len(), 6);
        assert!(sensitivity.most_sensitive.is_some());

        let comparison = engine
            .compare_methods(&portfolio(), &WeightingRequest::default(), None)
            .unwrap();
        assert_eq!(comparison.scores.len(), WeightingMethod::ALL.len());
        let max = comparison
            .scores
            .iter()
            .map(|s| s.fsfvi)
            .fold(f64::NEG_INFINITY, f64::max);
        let top = comparison
            .scores
            .iter()
            .find(|s| s.method == comparison.most_conservative)
            .unwrap();
        assert_eq!(top.fsfvi, max);
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = EngineConfig::default();
        config.centrality.damping = 1.5;
        assert!(FsfviEngine::new(config).is_err());
    }
}
