//! Normalized category weight vectors.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::error::ValidationError;

/// Drift allowed before a renormalization is logged.
pub const DEFAULT_SUM_TOLERANCE: f64 = 1e-3;

/// Mapping category → weight that always sums to 1.0.
///
/// Constructed only through normalizing constructors, so every value handed
/// between weighting stages already satisfies the sum invariant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WeightVector {
    weights: BTreeMap<String, f64>,
}

impl WeightVector {
    /// Normalize raw non-negative scores. Negative or non-finite entries count as zero.
    pub fn from_raw(raw: BTreeMap<String, f64>) -> Result<Self, ValidationError> {
        let cleaned: BTreeMap<String, f64> = raw
            .into_iter()
            .map(|(k, v)| (k, if v.is_finite() && v > 0.0 { v } else { 0.0 }))
            .collect();
        let sum: f64 = cleaned.values().sum();
        if cleaned.is_empty() || sum <= 0.0 || !sum.is_finite() {
            return Err(ValidationError::WeightSum { sum });
        }
        Ok(Self {
            weights: cleaned.into_iter().map(|(k, v)| (k, v / sum)).collect(),
        })
    }

    /// Like [`from_raw`](Self::from_raw) but logs when the input sum had
    /// drifted beyond `tolerance` before being corrected.
    pub fn renormalized(
        raw: BTreeMap<String, f64>,
        tolerance: f64,
        stage: &str,
    ) -> Result<Self, ValidationError> {
        if let Some(sum) = sum_drift(&raw, tolerance) {
            warn!(stage, sum, tolerance, "weight sum drifted; renormalizing");
        }
        Self::from_raw(raw)
    }

    /// Equal weights over `categories`.
    pub fn equal<I, S>(categories: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_raw(categories.into_iter().map(|c| (c.into(), 1.0)).collect())
    }

    pub fn get(&self, category: &str) -> Option<f64> {
        self.weights.get(category).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Keep only `categories` and renormalize. Categories missing from this
    /// vector are added with weight zero, which only fails if nothing overlaps.
    pub fn restrict_to<'a, I>(&self, categories: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self::from_raw(
            categories
                .into_iter()
                .map(|c| (c.to_string(), self.get(c).unwrap_or(0.0)))
                .collect(),
        )
    }

    /// Largest single weight and its category.
    pub fn max_entry(&self) -> Option<(&str, f64)> {
        self.iter().max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Per-category linear combination of several vectors, renormalized.
    /// Categories absent from a vector contribute zero for that term.
    pub fn blend(
        terms: &[(f64, &WeightVector)],
        tolerance: f64,
        stage: &str,
    ) -> Result<Self, ValidationError> {
        let mut acc: BTreeMap<String, f64> = BTreeMap::new();
        for (coef, vector) in terms {
            for (category, w) in vector.iter() {
                *acc.entry(category.to_string()).or_insert(0.0) += coef * w;
            }
        }
        Self::renormalized(acc, tolerance, stage)
    }
}

/// Raw sum of `raw` when it lies further than `tolerance` from 1.0.
pub fn sum_drift(raw: &BTreeMap<String, f64>, tolerance: f64) -> Option<f64> {
    let sum: f64 = raw.values().sum();
    ((sum - 1.0).abs() > tolerance).then_some(sum)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn raw(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn normalizes_and_zeroes_bad_entries() {
        let w = WeightVector::from_raw(raw(&[("a", 2.0), ("b", 6.0), ("c", f64::NAN), ("d", -1.0)]))
            .unwrap();
        assert!((w.sum() - 1.0).abs() < 1e-12);
        assert!((w.get("b").unwrap() - 0.75).abs() < 1e-12);
        assert_eq!(w.get("c"), Some(0.0));
        assert_eq!(w.get("d"), Some(0.0));
    }

    #[test]
    fn all_zero_is_rejected() {
        let err = WeightVector::from_raw(raw(&[("a", 0.0)])).unwrap_err();
        assert!(matches!(err, ValidationError::WeightSum { .. }));
    }

    #[test]
    fn restrict_and_blend() {
        let a = WeightVector::from_raw(raw(&[("x", 1.0), ("y", 3.0)])).unwrap();
        let b = WeightVector::equal(["x", "z"]).unwrap();
        let restricted = a.restrict_to(["x", "z"]).unwrap();
        assert_eq!(restricted.get("x"), Some(1.0));
        assert_eq!(restricted.get("z"), Some(0.0));

        let blended =
            WeightVector::blend(&[(0.5, &a), (0.5, &b)], DEFAULT_SUM_TOLERANCE, "test").unwrap();
        assert_eq!(blended.len(), 3);
        assert!((blended.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    #[traced_test]
    fn drifted_input_is_logged_before_correction() {
        let w = WeightVector::renormalized(raw(&[("a", 0.45), ("b", 0.45)]), 1e-3, "calibration").unwrap();
        assert!((w.sum() - 1.0).abs() < 1e-12);
        assert!(logs_contain("weight sum drifted"));
        assert!(logs_contain("calibration"));
    }

    #[test]
    #[traced_test]
    fn sums_within_tolerance_stay_quiet() {
        WeightVector::renormalized(raw(&[("a", 0.5), ("b", 0.5004)]), 1e-3, "network").unwrap();
        assert!(!logs_contain("weight sum drifted"));
    }

    #[test]
    fn drift_is_reported_only_beyond_tolerance() {
        assert_eq!(sum_drift(&raw(&[("a", 0.6), ("b", 0.4005)]), 1e-3), None);
        let drifted = sum_drift(&raw(&[("a", 0.6), ("b", 0.3)]), 1e-3).unwrap();
        assert!((drifted - 0.9).abs() < 1e-12);

        let corrected = WeightVector::renormalized(raw(&[("a", 0.6), ("b", 0.3)]), 1e-3, "test").unwrap();
        assert!((corrected.get("a").unwrap() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn blend_with_short_coefficients_drifts() {
        let a = WeightVector::equal(["x", "y"]).unwrap();
        let partial: BTreeMap<String, f64> = a.iter().map(|(k, v)| (k.to_string(), 0.8 * v)).collect();
        assert!(sum_drift(&partial, DEFAULT_SUM_TOLERANCE).is_some());
        let blended = WeightVector::blend(&[(0.8, &a)], DEFAULT_SUM_TOLERANCE, "test").unwrap();
        assert_eq!(blended, a);
    }

    #[test]
    fn serializes_as_plain_map() {
        let w = WeightVector::equal(["a", "b"]).unwrap();
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"a":0.5,"b":0.5}"#);
    }
}
