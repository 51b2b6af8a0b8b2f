use std::sync::atomic::AtomicBool;

use fsfvi_engine::engine::FsfviEngine;
use fsfvi_engine::optimizer::SolverKind;
use fsfvi_engine::{
    AllocationConstraints, Component, EngineConfig, Scenario, StopReason, WeightingMethod,
    WeightingRequest,
};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

/// One component already beats its benchmark; the other two are far short.
fn zero_gap_portfolio() -> Vec<Component> {
    vec![
        Component::new("grain_reserve", "agricultural_development", 120.0, 100.0, 200.0),
        Component::new("feeder_roads", "infrastructure", 50.0, 100.0, 200.0),
        Component::new("school_meals", "nutrition_health", 40.0, 100.0, 200.0),
    ]
}

fn expert_request() -> WeightingRequest {
    WeightingRequest::new(WeightingMethod::Expert, Scenario::NormalOperations)
}

#[test]
fn zero_gap_component_releases_budget_within_bounds() {
    let engine = FsfviEngine::default();
    let components = zero_gap_portfolio();
    let report = engine
        .optimize(
            &components,
            600.0,
            &expert_request(),
            &AllocationConstraints::default(),
            None,
        )
        .unwrap();
    let outcome = &report.outcome;

    assert!(outcome.success, "{:?}", outcome.failure);
    assert_eq!(outcome.solver, SolverKind::GradientDescent);
    let total: f64 = outcome.optimal_allocations.iter().sum();
    assert!(approx_eq(total, 600.0, 600.0 * 1e-6), "total {total}");
    for (x, b) in outcome.optimal_allocations.iter().zip(&outcome.bounds) {
        assert!(b.contains(*x, 1e-6), "{x} outside [{}, {}]", b.min, b.max);
    }

    let released = &report.allocations[0];
    assert_eq!(released.id, "grain_reserve");
    assert!(released.change < -1.0, "zero-gap component kept {}", released.optimal);
    assert!(released.optimal >= EngineConfig::default().optimizer.min_allocation_floor);
    assert!(report.allocations[1].change > 0.0);
    assert!(report.allocations[2].change > 0.0);

    assert!(outcome.optimal_fsfvi < outcome.original_fsfvi);
    let efficiency = outcome.efficiency.unwrap();
    assert!(efficiency.improvement_potential > 0.0);
    assert!(efficiency.reallocation_intensity > 0.0);
}

#[test]
fn best_history_entry_is_the_reported_optimum() {
    let engine = FsfviEngine::default();
    let report = engine
        .optimize(
            &zero_gap_portfolio(),
            600.0,
            &expert_request(),
            &AllocationConstraints::default(),
            None,
        )
        .unwrap();
    let history = &report.outcome.convergence_history;
    assert!(!history.is_empty());
    assert_eq!(history[0].iteration, 0);
    let best = history.iter().map(|h| h.fsfvi).fold(f64::INFINITY, f64::min);
    assert!(approx_eq(best, report.outcome.optimal_fsfvi, 1e-12));
}

#[test]
fn headroom_is_fully_deployed() {
    let engine = FsfviEngine::default();
    let report = engine
        .optimize(
            &zero_gap_portfolio(),
            660.0,
            &expert_request(),
            &AllocationConstraints::default(),
            None,
        )
        .unwrap();
    let total: f64 = report.outcome.optimal_allocations.iter().sum();
    assert!(approx_eq(total, 660.0, 660.0 * 1e-6), "total {total}");
    assert_eq!(report.outcome.budget, 660.0);
}

#[test]
fn explicit_minimum_is_honoured() {
    let engine = FsfviEngine::default();
    let constraints = AllocationConstraints {
        min_allocation_per_component: Some(150.0),
        ..AllocationConstraints::default()
    };
    let report = engine
        .optimize(&zero_gap_portfolio(), 600.0, &expert_request(), &constraints, None)
        .unwrap();
    assert!(report.outcome.success);
    for x in &report.outcome.optimal_allocations {
        assert!(*x >= 150.0 - 1e-6, "{x}");
    }
}

#[test]
fn impossible_minimum_is_rejected_before_solving() {
    let engine = FsfviEngine::default();
    let constraints = AllocationConstraints {
        min_allocation_per_component: Some(250.0),
        ..AllocationConstraints::default()
    };
    let err = engine
        .optimize(&zero_gap_portfolio(), 600.0, &expert_request(), &constraints, None)
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

#[test]
fn raised_cancel_flag_stops_immediately() {
    let engine = FsfviEngine::default();
    let cancel = AtomicBool::new(true);
    let report = engine
        .optimize(
            &zero_gap_portfolio(),
            600.0,
            &expert_request(),
            &AllocationConstraints::default(),
            Some(&cancel),
        )
        .unwrap();
    assert_eq!(report.outcome.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(report.outcome.iterations, 0);
    let total: f64 = report.outcome.optimal_allocations.iter().sum();
    assert!(approx_eq(total, 600.0, 1e-6));
}
