//! Budget reallocation that minimizes system vulnerability.
//!
//! The primary solver is a normalized gradient descent over the budget
//! simplex: each step moves funds toward components with the steepest
//! vulnerability reduction, then rescales the trial vector back onto
//! `sum = budget` inside the per-component bounds. If that search errors, a
//! projected-gradient solver with finite differences and Armijo backtracking
//! takes over on the same objective and constraints.
//!
//! Both solvers check an optional cancel flag and wall-clock budget between
//! iterations and return the best allocation seen so far when interrupted.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::Component;
use crate::config::OptimizerConfig;
use crate::error::{CalculationError, EngineError, OptimizationError, ValidationError};
use crate::integrator::WeightingPlan;
use crate::vulnerability::{
    vulnerability, vulnerability_gradient, weighted_vulnerability, EfficiencyMetrics,
};

// =============================================================================
// Objective
// =============================================================================

/// Objective value at a trial allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectivePoint {
    pub fsfvi: f64,
    /// Analytic gradient, one entry per component, when the objective has one.
    pub gradient: Option<Vec<f64>>,
}

pub trait AllocationObjective {
    fn evaluate(&self, allocations: &[f64]) -> Result<ObjectivePoint, EngineError>;
}

impl<F> AllocationObjective for F
where
    F: Fn(&[f64]) -> Result<ObjectivePoint, EngineError>,
{
    fn evaluate(&self, allocations: &[f64]) -> Result<ObjectivePoint, EngineError> {
        self(allocations)
    }
}

/// FSFVI of a prepared portfolio, reweighted at every trial allocation.
///
/// The gradient holds the weights fixed at the trial point.
pub struct PortfolioObjective<'a> {
    plan: &'a WeightingPlan,
    gaps: Vec<f64>,
    sensitivities: Vec<f64>,
}

impl<'a> PortfolioObjective<'a> {
    pub fn new(plan: &'a WeightingPlan, components: &[Component]) -> Self {
        Self {
            plan,
            gaps: components.iter().map(Component::gap).collect(),
            sensitivities: components.iter().map(Component::sensitivity).collect(),
        }
    }
}

impl AllocationObjective for PortfolioObjective<'_> {
    fn evaluate(&self, allocations: &[f64]) -> Result<ObjectivePoint, EngineError> {
        let weights = self.plan.weights_at(allocations)?.component_vector();
        let mut fsfvi = 0.0;
        let mut gradient = Vec::with_capacity(allocations.len());
        for (i, &a) in allocations.iter().enumerate() {
            let (gap, alpha, w) = (self.gaps[i], self.sensitivities[i], weights[i]);
            fsfvi += weighted_vulnerability(w, vulnerability(gap, a, alpha)?)?;
            gradient.push(vulnerability_gradient(gap, alpha, a, w));
        }
        if !fsfvi.is_finite() {
            return Err(CalculationError::NonFinite {
                quantity: "fsfvi".to_string(),
                value: fsfvi,
            }
            .into());
        }
        Ok(ObjectivePoint {
            fsfvi,
            gradient: Some(gradient),
        })
    }
}

// =============================================================================
// Constraints and bounds
// =============================================================================

/// Caller overrides on per-component bounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConstraints {
    pub min_allocation_per_component: Option<f64>,
    pub max_allocation_per_component: Option<f64>,
    /// Categories whose components may not be cut below current funding.
    pub priority_categories: Vec<String>,
}

impl AllocationConstraints {
    pub fn validate(&self, components: usize, budget: f64) -> Result<(), ValidationError> {
        let invalid = |message: String| ValidationError::InvalidConstraint { message };
        for (name, value) in [
            ("min_allocation_per_component", self.min_allocation_per_component),
            ("max_allocation_per_component", self.max_allocation_per_component),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(invalid(format!("{name} must be non-negative, got {v}")));
                }
            }
        }
        if let Some(min) = self.min_allocation_per_component {
            if min * components as f64 > budget {
                return Err(invalid(format!(
                    "min_allocation_per_component {min} x {components} components exceeds budget {budget}"
                )));
            }
        }
        if let Some(max) = self.max_allocation_per_component {
            if max > budget {
                return Err(invalid(format!(
                    "max_allocation_per_component {max} exceeds budget {budget}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (
            self.min_allocation_per_component,
            self.max_allocation_per_component,
        ) {
            if min > max {
                return Err(invalid(format!(
                    "min_allocation_per_component {min} exceeds max_allocation_per_component {max}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationBounds {
    pub min: f64,
    pub max: f64,
}

impl AllocationBounds {
    pub fn contains(&self, value: f64, tolerance: f64) -> bool {
        value >= self.min - tolerance && value <= self.max + tolerance
    }
}

/// Per-component bounds.
///
/// `min = max(min_fraction * current, floor, override)`, raised to `current`
/// for priority components; `max = min(max_multiple * current,
/// max_budget_fraction * budget, override)`. A max below its min collapses
/// onto the min.
pub fn compute_bounds(
    current: &[f64],
    priority: &[bool],
    budget: f64,
    constraints: &AllocationConstraints,
    cfg: &OptimizerConfig,
) -> Vec<AllocationBounds> {
    current
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let mut min = (cfg.min_fraction_of_current * c).max(cfg.min_allocation_floor);
            if let Some(floor) = constraints.min_allocation_per_component {
                min = min.max(floor);
            }
            if priority.get(i).copied().unwrap_or(false) {
                min = min.max(c);
            }
            let mut max = (cfg.max_multiple_of_current * c).min(cfg.max_budget_fraction * budget);
            if let Some(cap) = constraints.max_allocation_per_component {
                max = max.min(cap);
            }
            AllocationBounds {
                min,
                max: max.max(min),
            }
        })
        .collect()
}

fn check_feasible(bounds: &[AllocationBounds], budget: f64) -> Result<(), OptimizationError> {
    let min_total: f64 = bounds.iter().map(|b| b.min).sum();
    let max_total: f64 = bounds.iter().map(|b| b.max).sum();
    if min_total > budget || max_total < budget {
        return Err(OptimizationError::InfeasibleBounds {
            min_total,
            max_total,
            budget,
        });
    }
    Ok(())
}

// =============================================================================
// Projection onto {sum = budget, min <= x <= max}
// =============================================================================

const PROJECTION_STEPS: usize = 200;

fn clamp_to(bounds: &AllocationBounds, value: f64) -> f64 {
    value.clamp(bounds.min, bounds.max)
}

/// Find the scale `s` with `sum(clamp(s * x)) = budget`. Falls back to the
/// shift projection when scaling cannot reach the budget (all-zero input).
fn project_scaled(x: &[f64], bounds: &[AllocationBounds], budget: f64) -> Vec<f64> {
    let total_at = |s: f64| -> f64 {
        x.iter()
            .zip(bounds)
            .map(|(v, b)| clamp_to(b, s * v.max(0.0)))
            .sum()
    };
    let mut hi = 1.0;
    while total_at(hi) < budget && hi < 1e12 {
        hi *= 2.0;
    }
    let mut lo = 0.0;
    for _ in 0..PROJECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if total_at(mid) < budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let out: Vec<f64> = x
        .iter()
        .zip(bounds)
        .map(|(v, b)| clamp_to(b, hi * v.max(0.0)))
        .collect();
    let total: f64 = out.iter().sum();
    if (total - budget).abs() > 1e-9 * budget.max(1.0) {
        return project_shifted(x, bounds, budget);
    }
    out
}

/// Euclidean projection: `clamp(x - tau)` with `tau` found by bisection.
fn project_shifted(x: &[f64], bounds: &[AllocationBounds], budget: f64) -> Vec<f64> {
    let total_at = |tau: f64| -> f64 { x.iter().zip(bounds).map(|(v, b)| clamp_to(b, v - tau)).sum() };
    let mut lo = x
        .iter()
        .zip(bounds)
        .map(|(v, b)| v - b.max)
        .fold(f64::INFINITY, f64::min);
    let mut hi = x
        .iter()
        .zip(bounds)
        .map(|(v, b)| v - b.min)
        .fold(f64::NEG_INFINITY, f64::max);
    for _ in 0..PROJECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if total_at(mid) > budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let tau = 0.5 * (lo + hi);
    x.iter().zip(bounds).map(|(v, b)| clamp_to(b, v - tau)).collect()
}

// =============================================================================
// Outcome
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    GradientDescent,
    FallbackSolver,
}

impl SolverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SolverKind::GradientDescent => "gradient_descent",
            SolverKind::FallbackSolver => "fallback_solver",
        }
    }
}

/// Why a solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Accepted step improved by less than `min_improvement`.
    MinImprovement,
    /// Largest gradient magnitude at or under `gradient_tolerance`; a flat
    /// gradient always stops here.
    GradientTolerance,
    MaxIterations,
    /// Backtracking found no decreasing step.
    NoDescentDirection,
    Cancelled,
    DeadlineExceeded,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::MinImprovement => "min_improvement",
            StopReason::GradientTolerance => "gradient_tolerance",
            StopReason::MaxIterations => "max_iterations",
            StopReason::NoDescentDirection => "no_descent_direction",
            StopReason::Cancelled => "cancelled",
            StopReason::DeadlineExceeded => "deadline_exceeded",
        }
    }

    fn converged(self) -> bool {
        matches!(
            self,
            StopReason::MinImprovement | StopReason::GradientTolerance | StopReason::NoDescentDirection
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub fsfvi: f64,
    pub improvement: f64,
    pub learning_rate: f64,
}

/// Structured failure: the caller keeps its original allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationFailure {
    pub solver: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationOutcome {
    pub success: bool,
    pub solver: SolverKind,
    /// Solver-specific status, e.g. `converged` or `max_iterations`.
    pub solver_status: String,
    pub stop_reason: Option<StopReason>,
    pub iterations: usize,
    pub budget: f64,
    pub bounds: Vec<AllocationBounds>,
    pub original_allocations: Vec<f64>,
    pub optimal_allocations: Vec<f64>,
    pub original_fsfvi: f64,
    pub optimal_fsfvi: f64,
    pub convergence_history: Vec<IterationRecord>,
    pub efficiency: Option<EfficiencyMetrics>,
    pub failure: Option<OptimizationFailure>,
}

// =============================================================================
// Run control
// =============================================================================

/// Per-run inputs beyond the objective.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationRun<'a> {
    pub budget: f64,
    pub constraints: &'a AllocationConstraints,
    /// Parallel to the allocations; true marks a priority component.
    pub priority: &'a [bool],
    pub cancel_flag: Option<&'a AtomicBool>,
}

struct RunClock<'a> {
    cancel_flag: Option<&'a AtomicBool>,
    deadline: Option<Instant>,
}

impl RunClock<'_> {
    fn interrupted(&self) -> Option<StopReason> {
        if let Some(flag) = self.cancel_flag {
            if flag.load(AtomicOrdering::Relaxed) {
                return Some(StopReason::Cancelled);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::DeadlineExceeded),
            _ => None,
        }
    }
}

struct SearchResult {
    best: Vec<f64>,
    best_fsfvi: f64,
    iterations: usize,
    stop_reason: StopReason,
    history: Vec<IterationRecord>,
}

// =============================================================================
// Entry point
// =============================================================================

/// Reallocate `run.budget` across components to minimize the objective.
///
/// Returns `Err` only for caller contract violations (mismatched lengths,
/// invalid constraints, an objective that cannot be evaluated at the current
/// allocation). Infeasible bounds and solver failures come back as an
/// outcome with `success = false` and the original allocation.
pub fn optimize_allocations<O: AllocationObjective>(
    objective: &O,
    current: &[f64],
    run: OptimizationRun<'_>,
    cfg: &OptimizerConfig,
) -> Result<OptimizationOutcome, EngineError> {
    if !run.budget.is_finite() || run.budget <= 0.0 {
        return Err(ValidationError::InvalidBudget { budget: run.budget }.into());
    }
    if !run.priority.is_empty() && run.priority.len() != current.len() {
        return Err(CalculationError::LengthMismatch {
            expected: current.len(),
            got: run.priority.len(),
        }
        .into());
    }
    run.constraints.validate(current.len(), run.budget)?;

    let original_fsfvi = objective.evaluate(current)?.fsfvi;
    let bounds = compute_bounds(current, run.priority, run.budget, run.constraints, cfg);
    let clock = RunClock {
        cancel_flag: run.cancel_flag,
        deadline: cfg
            .time_budget_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms)),
    };

    let failed = |solver: SolverKind, status: &str, err: &EngineError| OptimizationOutcome {
        success: false,
        solver,
        solver_status: status.to_string(),
        stop_reason: None,
        iterations: 0,
        budget: run.budget,
        bounds: bounds.clone(),
        original_allocations: current.to_vec(),
        optimal_allocations: current.to_vec(),
        original_fsfvi,
        optimal_fsfvi: original_fsfvi,
        convergence_history: Vec::new(),
        efficiency: None,
        failure: Some(OptimizationFailure {
            solver: solver.as_str().to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    };

    if let Err(err) = check_feasible(&bounds, run.budget) {
        let err = EngineError::from(err);
        warn!(error = %err, "allocation bounds are infeasible");
        return Ok(failed(SolverKind::GradientDescent, "infeasible_bounds", &err));
    }

    let (solver, search) = match gradient_search(objective, current, &bounds, run.budget, &clock, cfg) {
        Ok(search) => (SolverKind::GradientDescent, search),
        Err(primary) => {
            warn!(error = %primary, "gradient search failed; switching to fallback solver");
            match projected_gradient(objective, current, &bounds, run.budget, &clock, cfg) {
                Ok(search) => (SolverKind::FallbackSolver, search),
                Err(fallback) => {
                    let err = EngineError::from(OptimizationError::SolverFailed {
                        solver: SolverKind::FallbackSolver.as_str().to_string(),
                        message: format!("{fallback} (after gradient search: {primary})"),
                    });
                    warn!(error = %err, "fallback solver failed; keeping original allocation");
                    return Ok(failed(SolverKind::FallbackSolver, "failed", &err));
                }
            }
        }
    };

    let status = if search.stop_reason.converged() {
        "converged"
    } else {
        search.stop_reason.as_str()
    };
    debug!(
        solver = solver.as_str(),
        iterations = search.iterations,
        stop_reason = search.stop_reason.as_str(),
        fsfvi = search.best_fsfvi,
        "optimization finished"
    );
    let efficiency = EfficiencyMetrics::compute(
        original_fsfvi,
        search.best_fsfvi,
        current,
        &search.best,
        run.budget,
    );
    Ok(OptimizationOutcome {
        success: true,
        solver,
        solver_status: status.to_string(),
        stop_reason: Some(search.stop_reason),
        iterations: search.iterations,
        budget: run.budget,
        bounds,
        original_allocations: current.to_vec(),
        optimal_allocations: search.best,
        original_fsfvi,
        optimal_fsfvi: search.best_fsfvi,
        convergence_history: search.history,
        efficiency: Some(efficiency),
        failure: None,
    })
}

// =============================================================================
// Gradient descent
// =============================================================================

fn gradient_search<O: AllocationObjective>(
    objective: &O,
    current: &[f64],
    bounds: &[AllocationBounds],
    budget: f64,
    clock: &RunClock<'_>,
    cfg: &OptimizerConfig,
) -> Result<SearchResult, EngineError> {
    let mut x = project_scaled(current, bounds, budget);
    let mut point = objective.evaluate(&x)?;
    let mut learning_rate = cfg.learning_rate;
    let mut last_improvement = f64::INFINITY;
    let mut iterations = 0;
    let mut history = vec![IterationRecord {
        iteration: 0,
        fsfvi: point.fsfvi,
        improvement: 0.0,
        learning_rate,
    }];

    let stop_reason = 'optimize: loop {
        if let Some(reason) = clock.interrupted() {
            break 'optimize reason;
        }
        if iterations >= cfg.max_iterations {
            break 'optimize StopReason::MaxIterations;
        }

        let gradient = match point.gradient.take() {
            Some(g) => g,
            None => finite_difference(objective, &x)?,
        };
        if let Some(bad) = gradient.iter().find(|g| !g.is_finite()) {
            return Err(CalculationError::NonFinite {
                quantity: "gradient".to_string(),
                value: *bad,
            }
            .into());
        }
        let magnitude: f64 = gradient.iter().map(|g| g.abs()).sum();
        let largest = gradient.iter().fold(0.0_f64, |m, g| m.max(g.abs()));
        if largest <= cfg.gradient_tolerance {
            break 'optimize StopReason::GradientTolerance;
        }

        let trial: Vec<f64> = x
            .iter()
            .zip(&gradient)
            .map(|(xi, gi)| xi - learning_rate * gi / magnitude * budget)
            .collect();
        let candidate = project_scaled(&trial, bounds, budget);
        let next = objective.evaluate(&candidate)?;
        iterations += 1;

        let improvement = point.fsfvi - next.fsfvi;
        history.push(IterationRecord {
            iteration: iterations,
            fsfvi: next.fsfvi,
            improvement,
            learning_rate,
        });
        debug!(iteration = iterations, fsfvi = next.fsfvi, improvement, learning_rate, "gradient step");

        if improvement < 0.0 {
            // Overshot: keep the current point and retry with a smaller step.
            learning_rate *= cfg.learning_rate_decay;
            point.gradient = Some(gradient);
            continue;
        }
        x = candidate;
        point = next;
        if improvement < cfg.min_improvement {
            break 'optimize StopReason::MinImprovement;
        }
        if improvement < last_improvement {
            learning_rate *= cfg.learning_rate_decay;
        }
        last_improvement = improvement;
    };

    Ok(SearchResult {
        best: x,
        best_fsfvi: point.fsfvi,
        iterations,
        stop_reason,
        history,
    })
}

/// Central differences, step scaled to the allocation.
fn finite_difference<O: AllocationObjective>(objective: &O, x: &[f64]) -> Result<Vec<f64>, EngineError> {
    let mut probe = x.to_vec();
    let mut gradient = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        let h = 1e-6 * x[i].abs().max(1.0);
        let down = h.min(x[i]);
        probe[i] = x[i] + h;
        let f_up = objective.evaluate(&probe)?.fsfvi;
        probe[i] = x[i] - down;
        let f_down = objective.evaluate(&probe)?.fsfvi;
        probe[i] = x[i];
        gradient.push((f_up - f_down) / (h + down));
    }
    Ok(gradient)
}

// =============================================================================
// Fallback: projected gradient with Armijo backtracking
// =============================================================================

const ARMIJO_SLOPE: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;

fn projected_gradient<O: AllocationObjective>(
    objective: &O,
    current: &[f64],
    bounds: &[AllocationBounds],
    budget: f64,
    clock: &RunClock<'_>,
    cfg: &OptimizerConfig,
) -> Result<SearchResult, EngineError> {
    let mut x = project_shifted(current, bounds, budget);
    let mut f = finite_value(objective.evaluate(&x)?.fsfvi, "fsfvi")?;
    let mut iterations = 0;
    let mut history = vec![IterationRecord {
        iteration: 0,
        fsfvi: f,
        improvement: 0.0,
        learning_rate: 1.0,
    }];

    let stop_reason = 'optimize: loop {
        if let Some(reason) = clock.interrupted() {
            break 'optimize reason;
        }
        if iterations >= cfg.fallback_max_iterations {
            break 'optimize StopReason::MaxIterations;
        }

        let gradient = finite_difference(objective, &x)?;
        for g in &gradient {
            finite_value(*g, "gradient")?;
        }
        let largest = gradient.iter().fold(0.0_f64, |m, g| m.max(g.abs()));
        if largest <= cfg.gradient_tolerance {
            break 'optimize StopReason::GradientTolerance;
        }

        let mut step = budget / largest;
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let trial: Vec<f64> = x.iter().zip(&gradient).map(|(xi, gi)| xi - step * gi).collect();
            let candidate = project_shifted(&trial, bounds, budget);
            let decrease: f64 = gradient
                .iter()
                .zip(x.iter().zip(&candidate))
                .map(|(g, (a, b))| g * (a - b))
                .sum();
            let value = objective.evaluate(&candidate)?.fsfvi;
            if value.is_finite() && value <= f - ARMIJO_SLOPE * decrease && decrease > 0.0 {
                accepted = Some((candidate, value, step));
                break;
            }
            step *= 0.5;
        }
        let Some((candidate, value, step)) = accepted else {
            break 'optimize StopReason::NoDescentDirection;
        };

        iterations += 1;
        let improvement = f - value;
        history.push(IterationRecord {
            iteration: iterations,
            fsfvi: value,
            improvement,
            learning_rate: step,
        });
        debug!(iteration = iterations, fsfvi = value, improvement, step, "fallback step");
        x = candidate;
        f = value;
        if improvement < cfg.fallback_tolerance {
            break 'optimize StopReason::MinImprovement;
        }
    };

    Ok(SearchResult {
        best: x,
        best_fsfvi: f,
        iterations,
        stop_reason,
        history,
    })
}

fn finite_value(value: f64, quantity: &str) -> Result<f64, EngineError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalculationError::NonFinite {
            quantity: quantity.to_string(),
            value,
        }
        .into())
    }
}
