//! Category catalog: default weights, admissible ranges, dependency links and
//! context adjustments.
//!
//! Seeded with the six food-system categories. New categories can be
//! registered at runtime; readers take snapshots so no lock is held across a
//! weighting pass.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DMatrix;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::ComponentType;
use crate::error::ConfigurationError;
use crate::weights::WeightVector;

/// How strongly the owning category depends on another one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DependencyLink {
    /// Expected in `[0.1, 1.0]`; out-of-range values are repaired by the analyzer.
    pub strength: f64,
    /// Noise of the strength estimate, `[0, 0.5]`. Falls back to the mean of
    /// both categories' base uncertainty when absent.
    #[serde(default)]
    pub uncertainty: Option<f64>,
}

impl DependencyLink {
    pub fn new(strength: f64, uncertainty: f64) -> Self {
        Self {
            strength,
            uncertainty: Some(uncertainty),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetadata {
    pub label: String,
    pub default_weight: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    /// Categories this one depends on, keyed by category id.
    #[serde(default)]
    pub depends_on: BTreeMap<String, DependencyLink>,
    /// Context key → weight the category should carry in that context.
    #[serde(default)]
    pub context_adjustments: BTreeMap<String, f64>,
    #[serde(default)]
    pub base_uncertainty: f64,
    /// Position in the category hierarchy; lower tiers are more fundamental.
    #[serde(default)]
    pub hierarchy_tier: u8,
    /// Baseline for sensitivity estimation.
    #[serde(default = "default_base_sensitivity")]
    pub base_sensitivity: f64,
}

fn default_base_sensitivity() -> f64 {
    0.0015
}

impl CategoryMetadata {
    /// Metadata with no relationships, context adjustments or uncertainty.
    pub fn new(label: impl Into<String>, default_weight: f64, min_weight: f64, max_weight: f64) -> Self {
        Self {
            label: label.into(),
            default_weight,
            min_weight,
            max_weight,
            depends_on: BTreeMap::new(),
            context_adjustments: BTreeMap::new(),
            base_uncertainty: 0.0,
            hierarchy_tier: 0,
            base_sensitivity: default_base_sensitivity(),
        }
    }

    pub fn depends_on(mut self, category: impl Into<String>, strength: f64, uncertainty: f64) -> Self {
        self.depends_on
            .insert(category.into(), DependencyLink::new(strength, uncertainty));
        self
    }

    fn validate(&self, category: &str) -> Result<(), ConfigurationError> {
        let field = |name: &str| format!("{category}.{name}");
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !(in_unit(self.default_weight) && self.default_weight > 0.0) {
            return Err(ConfigurationError::invalid(
                field("default_weight"),
                format!("must lie in (0, 1], got {}", self.default_weight),
            ));
        }
        if !in_unit(self.min_weight) || !in_unit(self.max_weight) {
            return Err(ConfigurationError::invalid(
                field("weight_range"),
                "bounds must lie in [0, 1]",
            ));
        }
        if !(self.min_weight <= self.default_weight && self.default_weight <= self.max_weight) {
            return Err(ConfigurationError::invalid(
                field("weight_range"),
                format!(
                    "default {} outside [{}, {}]",
                    self.default_weight, self.min_weight, self.max_weight
                ),
            ));
        }
        if !in_unit(self.base_uncertainty) {
            return Err(ConfigurationError::invalid(
                field("base_uncertainty"),
                "must lie in [0, 1]",
            ));
        }
        if !(self.base_sensitivity.is_finite() && self.base_sensitivity > 0.0) {
            return Err(ConfigurationError::invalid(
                field("base_sensitivity"),
                "must be positive",
            ));
        }
        for (key, adj) in &self.context_adjustments {
            if !in_unit(*adj) {
                return Err(ConfigurationError::invalid(
                    field(&format!("context_adjustments.{key}")),
                    format!("must lie in [0, 1], got {adj}"),
                ));
            }
        }
        Ok(())
    }
}

pub struct ComponentRegistry {
    entries: RwLock<BTreeMap<String, CategoryMetadata>>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        {
            let mut entries = registry.entries.write();
            for (ct, meta) in seeded_categories() {
                entries.insert(ct.as_str().to_string(), meta);
            }
        }
        registry
    }
}

impl ComponentRegistry {
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add or replace a category.
    pub fn register(
        &self,
        category: impl Into<String>,
        metadata: CategoryMetadata,
    ) -> Result<(), ConfigurationError> {
        let category = category.into();
        if category.trim().is_empty() {
            return Err(ConfigurationError::invalid("category", "must be non-empty"));
        }
        metadata.validate(&category)?;
        let replaced = self.entries.write().insert(category.clone(), metadata).is_some();
        debug!(category = %category, replaced, "registered category");
        Ok(())
    }

    /// Registered category ids in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn contains(&self, category: &str) -> bool {
        self.entries.read().contains_key(category)
    }

    pub fn get(&self, category: &str) -> Option<CategoryMetadata> {
        self.entries.read().get(category).cloned()
    }

    /// Metadata for `names`, in the given order. Fails on unknown or repeated names.
    pub fn snapshot(&self, names: &[String]) -> Result<Vec<CategoryMetadata>, ConfigurationError> {
        let entries = self.entries.read();
        let mut seen = BTreeSet::new();
        names
            .iter()
            .map(|name| {
                if !seen.insert(name.as_str()) {
                    return Err(ConfigurationError::invalid(
                        "categories",
                        format!("duplicate category {name}"),
                    ));
                }
                entries
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConfigurationError::UnknownCategory { name: name.clone() })
            })
            .collect()
    }

    /// Normalized default weights over `names`.
    pub fn default_weights(&self, names: &[String]) -> Result<WeightVector, ConfigurationError> {
        let metas = self.snapshot(names)?;
        WeightVector::from_raw(
            names
                .iter()
                .zip(&metas)
                .map(|(n, m)| (n.clone(), m.default_weight))
                .collect(),
        )
        .map_err(|e| ConfigurationError::invalid("default_weight", e.to_string()))
    }

    /// Context-adjusted weights over every registered category.
    ///
    /// Each matching context key scales the default by
    /// `1 + adjusted - default`; the product is clamped to the category's
    /// range and the whole vector renormalized.
    pub fn context_weights(
        &self,
        context: &BTreeSet<String>,
    ) -> Result<WeightVector, ConfigurationError> {
        let entries = self.entries.read();
        let raw: BTreeMap<String, f64> = entries
            .iter()
            .map(|(name, meta)| {
                let factor: f64 = meta
                    .context_adjustments
                    .iter()
                    .filter(|(key, _)| context.contains(*key))
                    .map(|(_, adjusted)| 1.0 + adjusted - meta.default_weight)
                    .product();
                let w = (meta.default_weight * factor).clamp(meta.min_weight, meta.max_weight);
                (name.clone(), w)
            })
            .collect();
        drop(entries);
        WeightVector::from_raw(raw)
            .map_err(|e| ConfigurationError::invalid("context_weights", e.to_string()))
    }

    /// Dependency matrix over `names`: `D[i][j]` is how much `names[i]`
    /// depends on `names[j]`. Unrecorded pairs are zero, the diagonal is one;
    /// [`DependencyNetwork`](crate::centrality::DependencyNetwork) raises the
    /// zeros to its floor and logs the repair.
    pub fn dependency_matrix(&self, names: &[String]) -> Result<DMatrix<f64>, ConfigurationError> {
        let metas = self.snapshot(names)?;
        let n = names.len();
        Ok(DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                1.0
            } else {
                metas[i]
                    .depends_on
                    .get(&names[j])
                    .map(|link| link.strength)
                    .unwrap_or(0.0)
            }
        }))
    }

    /// Uncertainty of each dependency estimate, zero on the diagonal.
    pub fn uncertainty_matrix(&self, names: &[String]) -> Result<DMatrix<f64>, ConfigurationError> {
        let metas = self.snapshot(names)?;
        let n = names.len();
        Ok(DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                return 0.0;
            }
            metas[i]
                .depends_on
                .get(&names[j])
                .and_then(|link| link.uncertainty)
                .unwrap_or_else(|| {
                    ((metas[i].base_uncertainty + metas[j].base_uncertainty) / 2.0).min(0.5)
                })
        }))
    }
}

// -----------------------------------------------------------------------------
// Seed data
// -----------------------------------------------------------------------------

fn seeded_categories() -> Vec<(ComponentType, CategoryMetadata)> {
    use ComponentType::*;

    // Row i: how much category i depends on each column, with uncertainty.
    const ORDER: [ComponentType; 6] = ComponentType::ALL;
    const DEPENDENCY: [[f64; 6]; 6] = [
        [1.0, 0.8, 0.2, 0.7, 0.15, 0.3],
        [0.4, 1.0, 0.1, 0.6, 0.1, 0.5],
        [0.9, 0.7, 1.0, 0.3, 0.2, 0.2],
        [0.5, 0.4, 0.2, 1.0, 0.1, 0.4],
        [0.6, 0.3, 0.8, 0.2, 1.0, 0.6],
        [0.2, 0.3, 0.2, 0.3, 0.3, 1.0],
    ];
    const UNCERTAINTY: [[f64; 6]; 6] = [
        [0.0, 0.2, 0.3, 0.2, 0.3, 0.4],
        [0.3, 0.0, 0.4, 0.2, 0.4, 0.3],
        [0.2, 0.2, 0.0, 0.3, 0.3, 0.4],
        [0.3, 0.3, 0.4, 0.0, 0.4, 0.3],
        [0.3, 0.3, 0.2, 0.4, 0.0, 0.2],
        [0.4, 0.4, 0.4, 0.3, 0.2, 0.0],
    ];

    let links = |row: usize| -> BTreeMap<String, DependencyLink> {
        ORDER
            .iter()
            .enumerate()
            .filter(|(col, _)| *col != row)
            .map(|(col, ct)| {
                (
                    ct.as_str().to_string(),
                    DependencyLink::new(DEPENDENCY[row][col], UNCERTAINTY[row][col]),
                )
            })
            .collect()
    };
    let adjustments = |pairs: &[(&str, f64)]| -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    };
    let row_mean = |row: usize| UNCERTAINTY[row].iter().sum::<f64>() / 5.0;

    let rows = [
        (
            AgriculturalDevelopment,
            "Agricultural development",
            0.25,
            (0.10, 0.40),
            adjustments(&[("climate_vulnerable", 0.28), ("import_dependent", 0.30)]),
            1,
            0.0015,
        ),
        (
            Infrastructure,
            "Infrastructure",
            0.20,
            (0.08, 0.35),
            adjustments(&[("import_dependent", 0.28), ("urbanizing", 0.25)]),
            1,
            0.0018,
        ),
        (
            NutritionHealth,
            "Nutrition and health",
            0.20,
            (0.08, 0.35),
            adjustments(&[("high_malnutrition", 0.30), ("conflict_affected", 0.25)]),
            1,
            0.0020,
        ),
        (
            ClimateNaturalResources,
            "Climate and natural resources",
            0.20,
            (0.05, 0.35),
            adjustments(&[("climate_vulnerable", 0.30)]),
            2,
            0.0008,
        ),
        (
            SocialProtectionEquity,
            "Social protection and equity",
            0.10,
            (0.03, 0.25),
            adjustments(&[("conflict_affected", 0.20), ("high_malnutrition", 0.15)]),
            2,
            0.0025,
        ),
        (
            GovernanceInstitutions,
            "Governance and institutions",
            0.05,
            (0.02, 0.15),
            adjustments(&[("conflict_affected", 0.10)]),
            3,
            0.0006,
        ),
    ];

    rows.into_iter()
        .enumerate()
        .map(
            |(row, (ct, label, default_weight, (min_weight, max_weight), ctx, tier, alpha))| {
                (
                    ct,
                    CategoryMetadata {
                        label: label.to_string(),
                        default_weight,
                        min_weight,
                        max_weight,
                        depends_on: links(row),
                        context_adjustments: ctx,
                        base_uncertainty: row_mean(row),
                        hierarchy_tier: tier,
                        base_sensitivity: alpha,
                    },
                )
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(weight: f64) -> CategoryMetadata {
        CategoryMetadata {
            base_uncertainty: 0.2,
            base_sensitivity: 0.001,
            ..CategoryMetadata::new("custom", weight, 0.0, 1.0)
        }
    }

    #[test]
    fn seeded_registry_has_six_categories() {
        let registry = ComponentRegistry::default();
        let names = registry.names();
        assert_eq!(names.len(), 6);
        let defaults = registry.default_weights(&names).unwrap();
        assert!((defaults.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn dependency_matrix_follows_seed_rows() {
        let registry = ComponentRegistry::default();
        let names = vec![
            "nutrition_health".to_string(),
            "agricultural_development".to_string(),
        ];
        let d = registry.dependency_matrix(&names).unwrap();
        assert_eq!(d[(0, 0)], 1.0);
        assert_eq!(d[(0, 1)], 0.9);
        assert_eq!(d[(1, 0)], 0.2);
        let u = registry.uncertainty_matrix(&names).unwrap();
        assert_eq!(u[(0, 0)], 0.0);
        assert_eq!(u[(0, 1)], 0.2);
    }

    #[test]
    fn unrelated_categories_give_identity() {
        let registry = ComponentRegistry::empty();
        registry.register("a", custom(0.5)).unwrap();
        registry.register("b", custom(0.5)).unwrap();
        let names = registry.names();
        let d = registry.dependency_matrix(&names).unwrap();
        assert_eq!(d, DMatrix::identity(2, 2));
        let u = registry.uncertainty_matrix(&names).unwrap();
        assert!((u[(0, 1)] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn unknown_name_is_configuration_error() {
        let registry = ComponentRegistry::default();
        let err = registry
            .dependency_matrix(&["trade".to_string()])
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownCategory { .. }));
    }

    #[test]
    fn context_weights_apply_matching_adjustments() {
        let registry = ComponentRegistry::default();
        let base = registry.context_weights(&BTreeSet::new()).unwrap();
        let ctx: BTreeSet<String> = ["climate_vulnerable".to_string()].into_iter().collect();
        let adjusted = registry.context_weights(&ctx).unwrap();
        let climate = ComponentType::ClimateNaturalResources.as_str();
        assert!(adjusted.get(climate).unwrap() > base.get(climate).unwrap());
        assert!((adjusted.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn register_rejects_default_outside_range() {
        let registry = ComponentRegistry::empty();
        let mut meta = custom(0.5);
        meta.max_weight = 0.3;
        assert!(registry.register("x", meta).is_err());
        assert!(!registry.contains("x"));
    }
}
