use std::collections::BTreeMap;
use std::sync::Arc;

use fsfvi_engine::config::{EngineConfig, JudgmentConfig};
use fsfvi_engine::engine::{AnalysisRequest, FsfviEngine};
use fsfvi_engine::judgment::{accept_and_weigh, JudgmentMatrix};
use fsfvi_engine::vulnerability::{evaluate_component, system_vulnerability};
use fsfvi_engine::{
    Component, EngineError, RiskLevel, Scenario, ValidationError, WeightingMethod,
    WeightingRequest,
};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

fn portfolio() -> Vec<Component> {
    vec![
        Component::new("seed_subsidy", "agriculture", 60.0, 100.0, 220.0),
        Component::new("cold_chain", "storage and logistics", 45.0, 90.0, 180.0),
        Component::new("school_meals", "nutrition", 70.0, 95.0, 140.0),
        Component::new("irrigation", "climate", 30.0, 80.0, 110.0),
        Component::new("cash_transfers", "social_assistance", 55.0, 60.0, 90.0),
        Component::new("land_registry", "governance", 20.0, 40.0, 60.0),
    ]
}

#[test]
fn two_component_fsfvi_matches_hand_calculation() {
    // gaps 0.2 and 0.5, allocations 100 and 500, sensitivity 0.001.
    let a = Component::new("a", "agricultural_development", 100.0, 120.0, 100.0).with_sensitivity(0.001);
    let b = Component::new("b", "infrastructure", 100.0, 150.0, 500.0).with_sensitivity(0.001);

    let results = vec![
        evaluate_component(&a, a.financial_allocation, 0.5).unwrap(),
        evaluate_component(&b, b.financial_allocation, 0.5).unwrap(),
    ];
    assert!(approx_eq(results[0].vulnerability, 0.2 / 1.1, 1e-12));
    assert!(approx_eq(results[1].vulnerability, 0.5 / 1.5, 1e-12));

    let summary = system_vulnerability(&results, &EngineConfig::default().risk).unwrap();
    assert!(approx_eq(summary.fsfvi, 0.2576, 1e-4), "fsfvi {}", summary.fsfvi);
    assert_eq!(summary.risk_level, RiskLevel::High);
    assert_eq!(summary.contributions[0].id, "b");
}

#[test]
fn two_category_judgment_recovers_default_weights() {
    let cfg = JudgmentConfig::default();
    let names = vec!["first".to_string(), "second".to_string()];
    let matrix = JudgmentMatrix::from_weights(names, &[0.6, 0.4], &[1, 1], cfg.hierarchy_step).unwrap();
    assert!(approx_eq(matrix.values()[(0, 1)], 1.5, 1e-12));
    assert!(approx_eq(matrix.values()[(1, 0)], 1.0 / 1.5, 1e-12));

    let accepted = accept_and_weigh(matrix, &[0.6, 0.4], &cfg).unwrap();
    assert!(!accepted.fallback_used);
    assert!(accepted.consistency_ratio.abs() < 1e-9);
    assert!(approx_eq(accepted.weights.get("first").unwrap(), 0.6, 1e-6));
    assert!(approx_eq(accepted.weights.get("second").unwrap(), 0.4, 1e-6));
}

#[test]
fn every_method_normalizes_and_is_idempotent() {
    let engine = FsfviEngine::default();
    let components = portfolio();
    for method in WeightingMethod::ALL {
        let request = WeightingRequest::new(method, Scenario::ClimateShock);
        let first = engine.calculate_weights(&components, &request).unwrap();
        let second = engine.calculate_weights(&components, &request).unwrap();

        assert!(approx_eq(first.weights.sum(), 1.0, 1e-9), "{method}");
        assert!(first.weights.iter().all(|(_, w)| (0.0..=1.0).contains(&w)));
        let component_total: f64 = first.component_weights.iter().map(|c| c.weight).sum();
        assert!(approx_eq(component_total, 1.0, 1e-9), "{method}");
        assert_eq!(first, second, "{method}");
    }
}

#[test]
fn vulnerability_report_is_bounded_and_explains_fallbacks() {
    let engine = FsfviEngine::default();
    let request = WeightingRequest::new(WeightingMethod::Hybrid, Scenario::NormalOperations);
    let report = engine.calculate_vulnerability(&portfolio(), &request).unwrap();

    assert_eq!(report.components.len(), 6);
    assert!((0.0..=1.0).contains(&report.summary.fsfvi));
    for result in &report.components {
        assert!((0.0..=1.0).contains(&result.vulnerability));
        assert!(result.weighted_vulnerability <= result.vulnerability + 1e-12);
    }
    let sum: f64 = report.components.iter().map(|r| r.weighted_vulnerability).sum();
    assert!(approx_eq(sum, report.summary.fsfvi, 1e-12));
    if report.weighting.degraded {
        assert!(!report.weighting.failures.is_empty());
    } else {
        assert_eq!(report.weighting.strategy_used, "hybrid");
    }
}

#[test]
fn unknown_category_is_a_validation_error() {
    let engine = FsfviEngine::default();
    let mut components = portfolio();
    components.push(Component::new("space_program", "astronautics", 10.0, 20.0, 5.0));
    let err = engine
        .calculate_weights(&components, &WeightingRequest::default())
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::UnknownCategory { .. })
    ));
}

#[test]
fn request_document_drives_calibration_and_optimization() {
    let raw = serde_json::json!({
        "components": [
            {"id": "maize", "category": "agriculture", "observed_value": 60.0, "benchmark_value": 100.0, "financial_allocation": 200.0},
            {"id": "roads", "category": "infrastructure", "observed_value": 50.0, "benchmark_value": 100.0, "financial_allocation": 200.0},
            {"id": "clinics", "category": "nutrition", "observed_value": 120.0, "benchmark_value": 100.0, "financial_allocation": 200.0}
        ],
        "budget": 600.0,
        "weighting": {"method": "expert", "scenario": "normal_operations"},
        "calibration": {
            "samples": [{"category": "agriculture", "values": [0.4, 0.45, 0.5]}],
            "surveys": [{"respondent": "ministry", "weights": {"nutrition": 0.3}}]
        }
    });
    let request: AnalysisRequest = serde_json::from_value(raw).unwrap();
    assert_eq!(request.budget_or_total(), 600.0);

    let engine = FsfviEngine::default();
    engine.add_calibration(&request.calibration).unwrap();
    let agri = engine.calibration().record("agricultural_development").unwrap();
    assert_eq!(agri.sample_size, 3);
    let nutrition = engine.calibration().record("nutrition_health").unwrap();
    assert_eq!(nutrition.survey_weights, vec![0.3]);

    let weights = engine.calculate_weights(&request.components, &request.weighting).unwrap();
    assert!(weights.calibrated);

    let report = engine
        .optimize(
            &request.components,
            request.budget_or_total(),
            &request.weighting,
            &request.constraints,
            None,
        )
        .unwrap();
    let total: f64 = report.outcome.optimal_allocations.iter().sum();
    assert!(approx_eq(total, 600.0, 1e-6));
    assert!(report.outcome.optimal_fsfvi <= report.outcome.original_fsfvi + 1e-12);
}

#[test]
fn calibration_with_unknown_category_is_rejected() {
    let engine = FsfviEngine::default();
    let raw = serde_json::json!({
        "samples": [{"category": "astronautics", "values": [0.2]}]
    });
    let input = serde_json::from_value(raw).unwrap();
    let err = engine.add_calibration(&input).unwrap_err();
    assert!(matches!(err, ValidationError::InvalidEvidence { .. }));
    assert!(engine.calibration().is_empty());
}

#[test]
fn engine_serves_concurrent_requests() {
    let engine = Arc::new(FsfviEngine::default());
    let handles: Vec<_> = Scenario::ALL
        .into_iter()
        .map(|scenario| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let request = WeightingRequest::new(WeightingMethod::Expert, scenario);
                engine.calculate_vulnerability(&portfolio(), &request).map(|r| r.summary.fsfvi)
            })
        })
        .collect();
    let mut scores = BTreeMap::new();
    for (scenario, handle) in Scenario::ALL.into_iter().zip(handles) {
        scores.insert(scenario, handle.join().unwrap().unwrap());
    }
    assert_eq!(scores.len(), Scenario::ALL.len());
    assert!(scores.values().all(|s| (0.0..=1.0).contains(s)));
}
