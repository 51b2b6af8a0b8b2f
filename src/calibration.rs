//! Empirical calibration of weight vectors.
//!
//! Historical data points and expert-survey weights accumulate per category.
//! `calibrate` nudges a base vector toward the empirical estimate with a
//! confidence that grows with evidence but is capped, so a handful of
//! observations can never dominate the base weights.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::debug;

use crate::config::{CalibrationConfig, CalibrationMethod};
use crate::error::ValidationError;
use crate::weights::{WeightVector, DEFAULT_SUM_TOLERANCE};

/// One batch of observed weight shares for a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub values: Vec<f64>,
    pub source: String,
    pub recorded_at: DateTime<Utc>,
}

impl SampleBatch {
    fn mean(&self) -> f64 {
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// One respondent's category weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub respondent: String,
    pub weights: BTreeMap<String, f64>,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// Accumulated evidence for a single category.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalibrationRecord {
    pub samples: Vec<SampleBatch>,
    pub survey_weights: Vec<f64>,
    pub sample_size: usize,
    pub sample_mean: Option<f64>,
    /// Two-sided interval on the sample mean; present from two data points on.
    pub confidence_interval: Option<(f64, f64)>,
}

impl CalibrationRecord {
    fn has_evidence(&self) -> bool {
        self.sample_size > 0 || !self.survey_weights.is_empty()
    }

    fn all_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().flat_map(|b| b.values.iter().copied())
    }

    fn refresh_statistics(&mut self, level: f64) {
        let n = self.sample_size;
        if n == 0 {
            self.sample_mean = None;
            self.confidence_interval = None;
            return;
        }
        let mean = self.all_values().sum::<f64>() / n as f64;
        self.sample_mean = Some(mean);
        if n < 2 {
            self.confidence_interval = None;
            return;
        }
        let var = self.all_values().map(|x| (x - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
        let se = (var / n as f64).sqrt();
        let t = StudentsT::new(0.0, 1.0, n as f64 - 1.0)
            .ok()
            .map(|dist| dist.inverse_cdf(0.5 + level / 2.0));
        self.confidence_interval = t
            .filter(|t| t.is_finite())
            .map(|t| ((mean - t * se).max(0.0), (mean + t * se).min(1.0)));
    }
}

pub struct CalibrationStore {
    cfg: CalibrationConfig,
    sum_tolerance: f64,
    records: RwLock<BTreeMap<String, CalibrationRecord>>,
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

impl CalibrationStore {
    pub fn new(cfg: CalibrationConfig) -> Self {
        Self {
            cfg,
            sum_tolerance: DEFAULT_SUM_TOLERANCE,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Drift allowed in a calibrated vector before its renormalization is logged.
    pub fn with_sum_tolerance(mut self, tolerance: f64) -> Self {
        self.sum_tolerance = tolerance;
        self
    }

    /// Append observed weight shares (each in `[0, 1]`) for `category`.
    pub fn add_sample(
        &self,
        category: &str,
        values: &[f64],
        source: &str,
    ) -> Result<(), ValidationError> {
        if values.is_empty() {
            return Err(ValidationError::InvalidEvidence {
                category: category.to_string(),
                message: "sample has no values".to_string(),
            });
        }
        check_shares(category, values.iter().copied())?;

        let mut records = self.records.write();
        let record = records.entry(category.to_string()).or_default();
        record.samples.push(SampleBatch {
            values: values.to_vec(),
            source: source.to_string(),
            recorded_at: Utc::now(),
        });
        record.sample_size += values.len();
        record.refresh_statistics(self.cfg.interval_level);
        debug!(category, count = values.len(), source, "added calibration sample");
        Ok(())
    }

    /// Append one respondent's weights. Validated as a whole before any
    /// category is touched.
    pub fn add_survey(&self, survey: SurveyRecord) -> Result<(), ValidationError> {
        for (category, w) in &survey.weights {
            check_shares(category, std::iter::once(*w))?;
        }
        let mut records = self.records.write();
        for (category, w) in survey.weights {
            records.entry(category).or_default().survey_weights.push(w);
        }
        debug!(respondent = %survey.respondent, "added calibration survey");
        Ok(())
    }

    pub fn record(&self, category: &str) -> Option<CalibrationRecord> {
        self.records.read().get(category).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CalibrationRecord> {
        self.records.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().values().all(|r| !r.has_evidence())
    }

    /// Blend confidence for a record, capped at `confidence_cap`.
    pub fn confidence(&self, record: &CalibrationRecord) -> f64 {
        confidence(&self.cfg, record)
    }

    /// `confidence * empirical + (1 - confidence) * base` for each category
    /// with evidence, then renormalized. Categories without evidence pass
    /// through unchanged.
    pub fn calibrate(
        &self,
        base: &WeightVector,
        method: CalibrationMethod,
    ) -> Result<WeightVector, ValidationError> {
        calibrate_records(&self.cfg, &self.records.read(), base, method, self.sum_tolerance)
    }

    /// Point-in-time copy of the evidence, detached from later writes.
    /// `None` when there is nothing to calibrate with.
    pub fn freeze(&self) -> Option<FrozenCalibration> {
        let records: BTreeMap<String, CalibrationRecord> = self
            .records
            .read()
            .iter()
            .filter(|(_, r)| r.has_evidence())
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        (!records.is_empty()).then(|| FrozenCalibration {
            cfg: self.cfg.clone(),
            sum_tolerance: self.sum_tolerance,
            records,
        })
    }
}

/// Immutable calibration evidence held by a weighting plan for the duration
/// of one optimization run.
#[derive(Debug, Clone)]
pub struct FrozenCalibration {
    cfg: CalibrationConfig,
    sum_tolerance: f64,
    records: BTreeMap<String, CalibrationRecord>,
}

impl FrozenCalibration {
    pub fn calibrate(
        &self,
        base: &WeightVector,
        method: CalibrationMethod,
    ) -> Result<WeightVector, ValidationError> {
        calibrate_records(&self.cfg, &self.records, base, method, self.sum_tolerance)
    }
}

fn confidence(cfg: &CalibrationConfig, record: &CalibrationRecord) -> f64 {
    let effective =
        record.sample_size as f64 + record.survey_weights.len() as f64 * cfg.survey_equivalence;
    (effective / cfg.saturation_count).min(cfg.confidence_cap)
}

fn empirical_estimate(
    cfg: &CalibrationConfig,
    record: &CalibrationRecord,
    base: f64,
    method: CalibrationMethod,
) -> f64 {
    let survey_n = record.survey_weights.len() as f64 * cfg.survey_equivalence;
    let survey_sum: f64 = record.survey_weights.iter().sum::<f64>() * cfg.survey_equivalence;
    let sample_n = record.sample_size as f64;
    let sample_sum: f64 = record
        .samples
        .iter()
        .map(|b| b.mean() * b.values.len() as f64)
        .sum();
    match method {
        CalibrationMethod::WeightedAverage => (sample_sum + survey_sum) / (sample_n + survey_n),
        CalibrationMethod::Bayesian => {
            let kappa = cfg.prior_concentration;
            let alpha = kappa * base + sample_sum + survey_sum;
            let beta = kappa * (1.0 - base) + (sample_n - sample_sum) + (survey_n - survey_sum);
            alpha / (alpha + beta)
        }
    }
}

fn calibrate_records(
    cfg: &CalibrationConfig,
    records: &BTreeMap<String, CalibrationRecord>,
    base: &WeightVector,
    method: CalibrationMethod,
    sum_tolerance: f64,
) -> Result<WeightVector, ValidationError> {
    match blended_evidence(cfg, records, base, method) {
        Some(raw) => WeightVector::renormalized(raw, sum_tolerance, "calibration"),
        None => Ok(base.clone()),
    }
}

/// Per-category evidence blend before renormalization; `None` when no
/// category in `base` has evidence.
fn blended_evidence(
    cfg: &CalibrationConfig,
    records: &BTreeMap<String, CalibrationRecord>,
    base: &WeightVector,
    method: CalibrationMethod,
) -> Option<BTreeMap<String, f64>> {
    let mut touched = false;
    let raw: BTreeMap<String, f64> = base
        .iter()
        .map(|(category, w)| {
            let adjusted = match records.get(category).filter(|r| r.has_evidence()) {
                Some(record) => {
                    touched = true;
                    let c = confidence(cfg, record);
                    c * empirical_estimate(cfg, record, w, method) + (1.0 - c) * w
                }
                None => w,
            };
            (category.to_string(), adjusted)
        })
        .collect();
    touched.then_some(raw)
}

fn check_shares(category: &str, values: impl Iterator<Item = f64>) -> Result<(), ValidationError> {
    for v in values {
        if !(v.is_finite() && (0.0..=1.0).contains(&v)) {
            return Err(ValidationError::InvalidEvidence {
                category: category.to_string(),
                message: format!("values must lie in [0, 1], got {v}"),
            });
        }
    }
    Ok(())
}
