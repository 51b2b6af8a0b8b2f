//! Portfolio component records, category normalization and input validation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ValidationConfig;
use crate::error::ValidationError;
use crate::registry::ComponentRegistry;
use crate::vulnerability::performance_gap;

/// One funded portfolio item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Category tag. Free-text names are normalized onto registry categories
    /// by [`prepare_components`].
    #[serde(alias = "component_type")]
    pub category: String,
    pub observed_value: f64,
    pub benchmark_value: f64,
    #[serde(default = "default_prefer_higher")]
    pub prefer_higher: bool,
    pub financial_allocation: f64,
    /// Estimated from category and allocation when absent or zero.
    #[serde(default)]
    pub sensitivity_parameter: Option<f64>,
}

fn default_prefer_higher() -> bool {
    true
}

impl Component {
    pub fn new(
        id: impl Into<String>,
        category: impl Into<String>,
        observed_value: f64,
        benchmark_value: f64,
        financial_allocation: f64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            category: category.into(),
            observed_value,
            benchmark_value,
            prefer_higher: true,
            financial_allocation,
            sensitivity_parameter: None,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity_parameter = Some(sensitivity);
        self
    }

    pub fn prefer_lower(mut self) -> Self {
        self.prefer_higher = false;
        self
    }

    pub fn gap(&self) -> f64 {
        performance_gap(self.observed_value, self.benchmark_value, self.prefer_higher)
    }

    /// Resolved sensitivity; zero until [`prepare_components`] has run.
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity_parameter.unwrap_or(0.0)
    }
}

// =============================================================================
// Domain categories
// =============================================================================

/// The six seeded food-system categories. Runtime-registered categories are
/// plain string ids and do not appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    AgriculturalDevelopment,
    Infrastructure,
    NutritionHealth,
    ClimateNaturalResources,
    SocialProtectionEquity,
    GovernanceInstitutions,
}

impl ComponentType {
    pub const ALL: [ComponentType; 6] = [
        ComponentType::AgriculturalDevelopment,
        ComponentType::Infrastructure,
        ComponentType::NutritionHealth,
        ComponentType::ClimateNaturalResources,
        ComponentType::SocialProtectionEquity,
        ComponentType::GovernanceInstitutions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentType::AgriculturalDevelopment => "agricultural_development",
            ComponentType::Infrastructure => "infrastructure",
            ComponentType::NutritionHealth => "nutrition_health",
            ComponentType::ClimateNaturalResources => "climate_natural_resources",
            ComponentType::SocialProtectionEquity => "social_protection_equity",
            ComponentType::GovernanceInstitutions => "governance_institutions",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            ComponentType::AgriculturalDevelopment => &[
                "agriculture",
                "agri",
                "farming",
                "crop",
                "livestock",
                "fisheries",
                "aquaculture",
                "extension services",
                "value chain",
                "food production",
                "rural development",
                "smallholder",
            ],
            ComponentType::Infrastructure => &[
                "transport",
                "logistics",
                "roads",
                "storage",
                "distribution",
                "irrigation",
                "warehouse",
                "post-harvest",
                "supply chain",
                "cold chain",
                "processing",
                "packaging",
                "connectivity",
                "energy",
            ],
            ComponentType::NutritionHealth => &[
                "nutrition",
                "health",
                "medical",
                "feeding",
                "malnutrition",
                "dietary",
                "micronutrient",
                "fortification",
                "food safety",
                "public health",
                "diet quality",
            ],
            ComponentType::ClimateNaturalResources => &[
                "climate",
                "adaptation",
                "mitigation",
                "resilience",
                "disaster risk",
                "early warning",
                "environment",
                "water",
                "natural_resources",
                "natural resource",
                "forestry",
                "biodiversity",
                "ecosystem",
                "conservation",
                "emissions",
                "land use",
            ],
            ComponentType::SocialProtectionEquity => &[
                "social protection",
                "social",
                "safety_nets",
                "safety nets",
                "assistance",
                "welfare",
                "cash transfer",
                "poverty",
                "equity",
                "livelihoods",
                "gender",
                "youth",
                "migration",
            ],
            ComponentType::GovernanceInstitutions => &[
                "governance",
                "institutions",
                "institutional",
                "policy",
                "regulation",
                "regulatory",
                "legal",
                "coordination",
                "monitoring",
                "evaluation",
                "accountability",
                "retail",
                "marketing",
                "market",
                "trade",
                "financial services",
                "credit",
                "insurance",
            ],
        }
    }

    /// Map a free-text type name onto a category: exact id, the legacy
    /// `social_assistance` name, then the first alias contained in the name.
    pub fn normalize(raw: &str) -> Option<ComponentType> {
        let key = raw.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        if key == "social_assistance" || key == "social assistance" {
            return Some(ComponentType::SocialProtectionEquity);
        }
        if let Ok(ct) = key.parse::<ComponentType>() {
            return Some(ct);
        }
        Self::ALL.into_iter().find(|ct| {
            ct.aliases()
                .iter()
                .any(|alias| key == *alias || key.contains(alias))
        })
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|ct| ct.as_str() == s).ok_or(())
    }
}

// =============================================================================
// Sensitivity estimation
// =============================================================================

/// Estimate a sensitivity parameter from a category baseline.
///
/// Large programs get a scale-economy bonus, structural gaps above 0.5 a
/// penalty, and very large programs a coordination penalty. The result is
/// clamped to the configured sensitivity range.
pub fn estimate_sensitivity(
    base: f64,
    allocation: f64,
    gap: f64,
    bounds: &ValidationConfig,
) -> f64 {
    let mut alpha = base;
    if allocation > 100.0 {
        alpha += 0.0005 * (allocation / 1000.0).min(0.5);
    }
    if gap > 0.5 {
        alpha -= 0.0003 * gap.min(1.0);
    }
    if allocation > 500.0 {
        alpha -= 0.0002 * ((allocation - 500.0) / 2000.0).min(0.2);
    }
    alpha.clamp(bounds.min_sensitivity, bounds.max_sensitivity)
}

// =============================================================================
// Validation
// =============================================================================

fn field_error(id: &str, field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        component_id: id.to_string(),
        field: field.to_string(),
        message: message.into(),
    }
}

fn check_non_negative(id: &str, field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(field_error(id, field, format!("must be finite, got {value}")));
    }
    if value < 0.0 {
        return Err(field_error(id, field, format!("must be non-negative, got {value}")));
    }
    Ok(())
}

/// Validate raw component fields without touching the registry.
pub fn validate_components(components: &[Component]) -> Result<(), ValidationError> {
    if components.is_empty() {
        return Err(ValidationError::EmptyComponents);
    }
    let mut seen = BTreeSet::new();
    for c in components {
        if c.id.trim().is_empty() {
            return Err(field_error(&c.id, "id", "must be non-empty"));
        }
        if !seen.insert(c.id.as_str()) {
            return Err(ValidationError::DuplicateComponentId { id: c.id.clone() });
        }
        check_non_negative(&c.id, "observed_value", c.observed_value)?;
        check_non_negative(&c.id, "benchmark_value", c.benchmark_value)?;
        check_non_negative(&c.id, "financial_allocation", c.financial_allocation)?;
        if let Some(alpha) = c.sensitivity_parameter {
            check_non_negative(&c.id, "sensitivity_parameter", alpha)?;
        }
    }
    Ok(())
}

/// Check a portfolio's total allocation against the budget.
pub fn validate_budget(
    components: &[Component],
    budget: f64,
    tolerance: f64,
) -> Result<f64, ValidationError> {
    if !budget.is_finite() || budget <= 0.0 {
        return Err(ValidationError::InvalidBudget { budget });
    }
    let total: f64 = components.iter().map(|c| c.financial_allocation).sum();
    if total <= 0.0 {
        return Err(ValidationError::ZeroAllocation);
    }
    if total > budget * (1.0 + tolerance) {
        return Err(ValidationError::AllocationExceedsBudget {
            total,
            budget,
            tolerance,
        });
    }
    Ok(total)
}

/// Validate components, resolve their categories against the registry and
/// fill in missing sensitivities.
///
/// Categories registered at runtime match by exact id; anything else goes
/// through [`ComponentType::normalize`].
pub fn prepare_components(
    components: &[Component],
    registry: &ComponentRegistry,
    bounds: &ValidationConfig,
) -> Result<Vec<Component>, ValidationError> {
    validate_components(components)?;
    components
        .iter()
        .map(|c| {
            let category = resolve_category(&c.category, registry).ok_or_else(|| {
                ValidationError::UnknownCategory {
                    component_id: c.id.clone(),
                    category: c.category.clone(),
                }
            })?;
            let mut out = c.clone();
            if out.name.is_empty() {
                out.name = out.id.clone();
            }
            let needs_estimate = out.sensitivity_parameter.map_or(true, |a| a == 0.0);
            if needs_estimate {
                let base = registry
                    .get(&category)
                    .map(|m| m.base_sensitivity)
                    .unwrap_or(0.0015);
                let alpha = estimate_sensitivity(base, out.financial_allocation, out.gap(), bounds);
                debug!(component = %out.id, category = %category, alpha, "estimated sensitivity");
                out.sensitivity_parameter = Some(alpha);
            }
            out.category = category;
            Ok(out)
        })
        .collect()
}

/// Registry id for a free-text category name, if any.
pub fn resolve_category(raw: &str, registry: &ComponentRegistry) -> Option<String> {
    if registry.contains(raw) {
        return Some(raw.to_string());
    }
    let ct = ComponentType::normalize(raw)?;
    registry.contains(ct.as_str()).then(|| ct.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_aliases_and_legacy_names() {
        assert_eq!(
            ComponentType::normalize("Social_Assistance"),
            Some(ComponentType::SocialProtectionEquity)
        );
        assert_eq!(
            ComponentType::normalize("rural roads and storage"),
            Some(ComponentType::Infrastructure)
        );
        assert_eq!(
            ComponentType::normalize("nutrition_health"),
            Some(ComponentType::NutritionHealth)
        );
        assert_eq!(ComponentType::normalize("space program"), None);
    }

    #[test]
    fn sensitivity_estimate_stays_in_bounds() {
        let bounds = ValidationConfig::default();
        let small = estimate_sensitivity(0.0015, 50.0, 0.1, &bounds);
        assert_eq!(small, 0.0015);

        let large = estimate_sensitivity(0.0015, 1500.0, 0.8, &bounds);
        let expected = 0.0015 + 0.0005 * 0.5 - 0.0003 * 0.8 - 0.0002 * 0.2;
        assert!((large - expected).abs() < 1e-12);

        let floor = estimate_sensitivity(0.0001, 10.0, 0.0, &bounds);
        assert_eq!(floor, bounds.min_sensitivity);
    }

    #[test]
    fn rejects_negative_sensitivity_and_duplicates() {
        let bad = vec![Component::new("a", "agriculture", 1.0, 2.0, 10.0).with_sensitivity(-0.1)];
        let err = validate_components(&bad).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { ref field, .. } if field == "sensitivity_parameter"));

        let dup = vec![
            Component::new("a", "agriculture", 1.0, 2.0, 10.0),
            Component::new("a", "climate", 1.0, 2.0, 10.0),
        ];
        assert!(matches!(
            validate_components(&dup),
            Err(ValidationError::DuplicateComponentId { .. })
        ));
    }

    #[test]
    fn budget_check_allows_small_overrun() {
        let comps = vec![
            Component::new("a", "agriculture", 1.0, 2.0, 500.0),
            Component::new("b", "climate", 1.0, 2.0, 500.5),
        ];
        assert!(validate_budget(&comps, 1000.0, 1e-3).is_ok());
        assert!(matches!(
            validate_budget(&comps, 900.0, 1e-3),
            Err(ValidationError::AllocationExceedsBudget { .. })
        ));
        assert!(matches!(
            validate_budget(&comps, 0.0, 1e-3),
            Err(ValidationError::InvalidBudget { .. })
        ));
    }

    #[test]
    fn prepare_resolves_categories_and_sensitivity() {
        let registry = ComponentRegistry::default();
        let comps = vec![
            Component::new("a", "Crop production", 60.0, 80.0, 200.0),
            Component::new("b", "infrastructure", 70.0, 80.0, 300.0).with_sensitivity(0.002),
        ];
        let prepared = prepare_components(&comps, &registry, &ValidationConfig::default()).unwrap();
        assert_eq!(prepared[0].category, "agricultural_development");
        assert!(prepared[0].sensitivity() > 0.0);
        assert_eq!(prepared[1].sensitivity(), 0.002);

        let unknown = vec![Component::new("x", "space program", 1.0, 1.0, 1.0)];
        assert!(matches!(
            prepare_components(&unknown, &registry, &ValidationConfig::default()),
            Err(ValidationError::UnknownCategory { .. })
        ));
    }
}
