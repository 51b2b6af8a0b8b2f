#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use fsfvi_engine::config::{EngineConfig, RiskPreset};
use fsfvi_engine::engine::{AnalysisRequest, FsfviEngine};
use fsfvi_engine::integrator::WeightingMethod;
use fsfvi_engine::judgment::Scenario;
use fsfvi_engine::synthetic::run_synthetic_suite;

const LOG_ENV: &str = "FSFVI_LOG";

#[derive(Parser)]
#[command(name = "fsfvi", version, about = "FSFVI weighting and budget optimization")]
struct Cli {
    /// Engine configuration JSON (defaults to $FSFVI_CONFIG, then built-ins)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Apply a named risk-threshold preset
    #[arg(long, global = true)]
    risk_preset: Option<RiskPreset>,
    /// Debug-level logs on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Category and component weights for a portfolio
    Weights {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Per-component vulnerability and system summary
    Analyze {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Reallocate the budget to minimize FSFVI
    Optimize {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Wall-clock budget for the solver in milliseconds
        #[arg(long)]
        time_budget_ms: Option<u64>,
    },
    /// Hybrid weights across scenarios
    Sensitivity {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// FSFVI under each weighting method
    Compare {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// List scenario names
    Scenarios,
    /// List weighting method names
    Methods,
    /// Run the synthetic optimization suite (JSONL output)
    Eval {
        #[arg(long)]
        case: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Write the effective configuration as JSON
    Config {
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    if let Some(preset) = cli.risk_preset {
        config.risk = fsfvi_engine::config::RiskThresholds::preset(preset);
    }
    if let Commands::Optimize {
        time_budget_ms: Some(ms),
        ..
    } = &cli.command
    {
        config.optimizer.time_budget_ms = Some(*ms);
    }

    match cli.command {
        Commands::Weights { input, out } => {
            let (engine, request) = load_request(config, &input)?;
            let weights = engine.calculate_weights(&request.components, &request.weighting)?;
            write_json(&out, &weights)?;
        }
        Commands::Analyze { input, out } => {
            let (engine, request) = load_request(config, &input)?;
            let report = engine.calculate_vulnerability(&request.components, &request.weighting)?;
            println!(
                "fsfvi {:.4} ({:?})",
                report.summary.fsfvi, report.summary.risk_level
            );
            write_json(&out, &report)?;
        }
        Commands::Optimize { input, out, .. } => {
            let (engine, request) = load_request(config, &input)?;
            let report = engine.optimize(
                &request.components,
                request.budget_or_total(),
                &request.weighting,
                &request.constraints,
                None,
            )?;
            let outcome = &report.outcome;
            println!(
                "{} {}: fsfvi {:.4} -> {:.4} in {} iterations",
                outcome.solver.as_str(),
                outcome.solver_status,
                outcome.original_fsfvi,
                outcome.optimal_fsfvi,
                outcome.iterations
            );
            write_json(&out, &report)?;
        }
        Commands::Sensitivity { input, out } => {
            let (engine, request) = load_request(config, &input)?;
            let report = engine.weight_sensitivity(
                &request.components,
                request.scenarios.as_deref(),
                &request.weighting,
            )?;
            write_json(&out, &report)?;
        }
        Commands::Compare { input, out } => {
            let (engine, request) = load_request(config, &input)?;
            let report = engine.compare_methods(
                &request.components,
                &request.weighting,
                request.methods.as_deref(),
            )?;
            println!("most conservative: {}", report.most_conservative);
            write_json(&out, &report)?;
        }
        Commands::Scenarios => {
            for scenario in Scenario::ALL {
                println!("{scenario}");
            }
        }
        Commands::Methods => {
            for method in WeightingMethod::ALL {
                println!("{method}");
            }
        }
        Commands::Eval { case, out } => {
            let engine = FsfviEngine::new(config)?;
            let results = run_synthetic_suite(&engine, case.as_deref());
            let mut file = File::create(out)?;
            for result in &results {
                let line = serde_json::to_string(result)?;
                writeln!(file, "{line}")?;
            }
            let failed = results.iter().filter(|r| !r.success).count();
            println!("{} cases, {failed} failed", results.len());
        }
        Commands::Config { out } => {
            config.validate()?;
            write_json(&out, &config)?;
        }
    }
    Ok(())
}

fn load_request(
    config: EngineConfig,
    path: &Path,
) -> Result<(FsfviEngine, AnalysisRequest), Box<dyn std::error::Error>> {
    let engine = FsfviEngine::new(config)?;
    let request: AnalysisRequest = read_json(path)?;
    engine.add_calibration(&request.calibration)?;
    Ok((engine, request))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}

/// `FSFVI_LOG`, then `RUST_LOG`, then the verbosity flags; stderr only.
fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(verbose)
        .without_time()
        .compact();
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}
