use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct EvalResult {
    case_name: String,
    success: bool,
    optimal_fsfvi: f64,
    original_fsfvi: f64,
    budget_error: f64,
    bounds_respected: bool,
    iterations: usize,
}

fn request_json() -> serde_json::Value {
    serde_json::json!({
        "components": [
            {"id": "maize_inputs", "category": "agriculture", "observed_value": 55.0, "benchmark_value": 100.0, "financial_allocation": 240.0},
            {"id": "grain_storage", "category": "storage", "observed_value": 70.0, "benchmark_value": 90.0, "financial_allocation": 160.0},
            {"id": "school_meals", "category": "nutrition", "observed_value": 110.0, "benchmark_value": 100.0, "financial_allocation": 150.0},
            {"id": "watershed", "category": "climate", "observed_value": 35.0, "benchmark_value": 80.0, "financial_allocation": 90.0}
        ],
        "budget": 640.0,
        "weighting": {"method": "hybrid", "scenario": "climate_shock"},
        "calibration": {
            "samples": [{"category": "climate", "values": [0.3, 0.35]}]
        }
    })
}

fn run(args: &[&str], input: Option<&Path>, out: &Path) {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fsfvi"));
    cmd.args(args);
    if let Some(input) = input {
        cmd.arg("--input").arg(input);
    }
    let status = cmd.arg("--out").arg(out).status().unwrap();
    assert!(status.success(), "fsfvi {args:?} failed");
}

fn read_value(path: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn cli_analyze_and_optimize_round_trip_through_files() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("request.json");
    std::fs::write(&input, serde_json::to_string_pretty(&request_json()).unwrap()).unwrap();

    let analysis = dir.path().join("analysis.json");
    run(&["analyze"], Some(&input), &analysis);
    let v = read_value(&analysis);
    let fsfvi = v.pointer("/summary/fsfvi").and_then(|x| x.as_f64()).unwrap();
    assert!((0.0..=1.0).contains(&fsfvi));
    assert_eq!(v.pointer("/components").and_then(|c| c.as_array()).unwrap().len(), 4);
    assert_eq!(v.pointer("/weighting/calibrated").and_then(|c| c.as_bool()), Some(true));

    let optimized = dir.path().join("optimized.json");
    run(&["optimize"], Some(&input), &optimized);
    let v = read_value(&optimized);
    let allocations = v
        .pointer("/outcome/optimal_allocations")
        .and_then(|a| a.as_array())
        .unwrap();
    let total: f64 = allocations.iter().filter_map(|a| a.as_f64()).sum();
    assert!((total - 640.0).abs() < 1e-3, "total {total}");
    assert_eq!(v.pointer("/outcome/success").and_then(|s| s.as_bool()), Some(true));
    assert_eq!(
        v.pointer("/allocations/2/id").and_then(|s| s.as_str()),
        Some("school_meals")
    );
}

#[test]
fn cli_compare_and_sensitivity_cover_every_option() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("request.json");
    std::fs::write(&input, serde_json::to_string(&request_json()).unwrap()).unwrap();

    let compare = dir.path().join("compare.json");
    run(&["compare"], Some(&input), &compare);
    let v = read_value(&compare);
    assert_eq!(v.pointer("/scores").and_then(|s| s.as_array()).unwrap().len(), 6);

    let sensitivity = dir.path().join("sensitivity.json");
    run(&["sensitivity"], Some(&input), &sensitivity);
    let v = read_value(&sensitivity);
    assert_eq!(v.pointer("/scenarios").and_then(|s| s.as_array()).unwrap().len(), 7);
}

#[test]
fn cli_eval_smoke_and_determinism() {
    let dir = tempdir().unwrap();
    let mut runs = Vec::new();
    for name in ["a.jsonl", "b.jsonl"] {
        let out = dir.path().join(name);
        let status = Command::new(env!("CARGO_BIN_EXE_fsfvi"))
            .args(["eval", "--case", "balanced_6"])
            .arg("--out")
            .arg(&out)
            .status()
            .unwrap();
        assert!(status.success());
        let raw = std::fs::read_to_string(&out).unwrap();
        let first_line = raw.lines().next().unwrap();
        let result: EvalResult = serde_json::from_str(first_line).unwrap();
        runs.push(result);
    }

    let (a, b) = (&runs[0], &runs[1]);
    assert_eq!(a.case_name, "balanced_6");
    assert!(a.success);
    assert!(a.bounds_respected);
    assert!(a.budget_error <= 1e-3);
    assert!(a.optimal_fsfvi <= a.original_fsfvi + 1e-9);

    // Latency differs between processes; everything else must not.
    assert_eq!(a.iterations, b.iterations);
    assert_eq!(a.optimal_fsfvi.to_bits(), b.optimal_fsfvi.to_bits());
    assert_eq!(a.original_fsfvi.to_bits(), b.original_fsfvi.to_bits());
}

#[test]
fn cli_writes_a_loadable_config() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("config.json");
    let status = Command::new(env!("CARGO_BIN_EXE_fsfvi"))
        .args(["--risk-preset", "crisis_mode", "config"])
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let config = fsfvi_engine::EngineConfig::load(&out).unwrap();
    assert_eq!(config.risk.high, 0.50);
    assert_eq!(config.risk.low, 0.10);
}

#[test]
fn cli_rejects_unknown_method() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("request.json");
    let mut req = request_json();
    req["weighting"]["method"] = serde_json::json!("astrology");
    std::fs::write(&input, serde_json::to_string(&req).unwrap()).unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_fsfvi"))
        .arg("weights")
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(dir.path().join("weights.json"))
        .status()
        .unwrap();
    assert!(!status.success());
}
