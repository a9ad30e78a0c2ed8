// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Canonical form used for every ingredient comparison: trimmed and lower-cased.
pub fn normalize_ingredient(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// ========================================================================================
//                                  Categorical values
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SkinType {
    Oily,
    Dry,
    Combination,
    Sensitive,
    Normal,
    /// A label outside the known set. Kept verbatim so the encoder can route it
    /// to its unknown bucket instead of failing the load.
    Other(String),
}

impl SkinType {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "oily" => Self::Oily,
            "dry" => Self::Dry,
            "combination" => Self::Combination,
            "sensitive" => Self::Sensitive,
            "normal" => Self::Normal,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Oily => "oily",
            Self::Dry => "dry",
            Self::Combination => "combination",
            Self::Sensitive => "sensitive",
            Self::Normal => "normal",
            Self::Other(label) => label,
        }
    }
}

impl fmt::Display for SkinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HormoneLevel {
    Low,
    #[default]
    Normal,
    High,
}

impl HormoneLevel {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Any level away from normal marks the user as sensitive to hormonal ingredients.
    pub fn is_sensitive(self) -> bool {
        !matches!(self, Self::Normal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// The tagged variant that drives per-category rule dispatch. The handler table
/// lives in `rules.rs`, keyed on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrendCategory {
    Skincare,
    Diet,
    Supplement,
    /// Missing or unrecognised category. Only the universal checks apply.
    General,
}

impl TrendCategory {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "skincare" | "skin" => Self::Skincare,
            "diet" | "dietary" => Self::Diet,
            "supplement" | "supplements" => Self::Supplement,
            _ => Self::General,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skincare => "skincare",
            Self::Diet => "diet",
            Self::Supplement => "supplement",
            Self::General => "general",
        }
    }
}

impl fmt::Display for TrendCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RiskCategory {
    Allergen,
    Hormonal,
    Irritant,
    #[default]
    None,
}

impl RiskCategory {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "allergen" => Some(Self::Allergen),
            "hormonal" | "hormone" => Some(Self::Hormonal),
            "irritant" => Some(Self::Irritant),
            "none" | "" => Some(Self::None),
            _ => None,
        }
    }
}

// ========================================================================================
//                                     Input records
// ========================================================================================

/// A cell the loader could not parse. The record still loads with the
/// attribute left at its default; encoding rejects every pair it takes part in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MalformedValue {
    pub attribute: &'static str,
    pub raw: String,
    pub expected: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub id: String,
    /// Optional at load time; the encoder rejects pairs where it is absent.
    pub age: Option<u32>,
    pub bmi: Option<f64>,
    pub skin_type: SkinType,
    pub allergies: BTreeSet<String>,
    pub hormone_level: HormoneLevel,
    pub malformed: Vec<MalformedValue>,
}

impl Hash for UserProfile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.age.hash(state);
        self.bmi.map(f64::to_bits).hash(state);
        self.skin_type.hash(state);
        self.allergies.hash(state);
        self.hormone_level.hash(state);
        self.malformed.hash(state);
    }
}

/// Claims a trend makes about who it is for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TrendTargets {
    pub skin_type: Option<SkinType>,
    pub weight_loss: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trend {
    pub id: String,
    pub category: TrendCategory,
    pub ingredients: BTreeSet<String>,
    pub targets: TrendTargets,
    pub malformed: Vec<MalformedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientRiskEntry {
    pub ingredient: String,
    pub banned: bool,
    pub category: RiskCategory,
    /// `None` means the table did not specify one; callers substitute the
    /// configured default weight.
    pub severity: Option<f64>,
}

impl Hash for IngredientRiskEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ingredient.hash(state);
        self.banned.hash(state);
        self.category.hash(state);
        self.severity.map(f64::to_bits).hash(state);
    }
}

/// Lookup table from normalised ingredient name to its risk entry.
#[derive(Debug, Clone, Default)]
pub struct RiskTable {
    entries: AHashMap<String, IngredientRiskEntry>,
}

impl RiskTable {
    /// Builds the table, normalising each ingredient name. Later entries with the
    /// same normalised name replace earlier ones; the loader rejects duplicates
    /// before this point.
    pub fn from_entries(entries: impl IntoIterator<Item = IngredientRiskEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|mut entry| {
                entry.ingredient = normalize_ingredient(&entry.ingredient);
                (entry.ingredient.clone(), entry)
            })
            .collect();
        Self { entries }
    }

    #[inline]
    pub fn lookup(&self, ingredient: &str) -> Option<&IngredientRiskEntry> {
        self.entries.get(ingredient)
    }

    pub fn contains(&self, ingredient: &str) -> bool {
        self.entries.contains_key(ingredient)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ingredient-name order, for anything that must not depend on
    /// hash-map iteration order.
    pub fn sorted_entries(&self) -> Vec<&IngredientRiskEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| a.ingredient.cmp(&b.ingredient));
        entries
    }
}

impl Hash for RiskTable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let entries = self.sorted_entries();
        entries.len().hash(state);
        for entry in entries {
            entry.hash(state);
        }
    }
}

// ========================================================================================
//                                   Derived records
// ========================================================================================

/// Risk label for a (user, trend) pair. Declaration order is severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLabel {
    Safe,
    Medium,
    High,
}

impl RiskLabel {
    pub const ALL: [RiskLabel; 3] = [RiskLabel::Safe, RiskLabel::Medium, RiskLabel::High];
    pub const COUNT: usize = 3;

    /// Maps an accumulated rule score to a label. A zero score is Safe, anything
    /// up to and including `medium_threshold` is Medium.
    pub fn from_score(score: f64, medium_threshold: f64) -> Self {
        if score <= 0.0 {
            Self::Safe
        } else if score <= medium_threshold {
            Self::Medium
        } else {
            Self::High
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "safe" => Some(Self::Safe),
            "medium" | "medium risk" => Some(Self::Medium),
            "high" | "high risk" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

impl fmt::Display for RiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Output of the rule engine for one (user, trend) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub user_id: String,
    pub trend_id: String,
    pub label: RiskLabel,
    pub score: f64,
    /// Triggered reasons in check order. Empty only when the label is Safe.
    pub reasons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_thresholds_are_inclusive_at_medium() {
        assert_eq!(RiskLabel::from_score(0.0, 5.0), RiskLabel::Safe);
        assert_eq!(RiskLabel::from_score(0.5, 5.0), RiskLabel::Medium);
        assert_eq!(RiskLabel::from_score(5.0, 5.0), RiskLabel::Medium);
        assert_eq!(RiskLabel::from_score(5.01, 5.0), RiskLabel::High);
    }

    #[test]
    fn label_index_round_trips() {
        for label in RiskLabel::ALL {
            assert_eq!(RiskLabel::from_index(label.index()), Some(label));
        }
        assert_eq!(RiskLabel::from_index(3), None);
        assert!(RiskLabel::Safe < RiskLabel::Medium && RiskLabel::Medium < RiskLabel::High);
    }

    #[test]
    fn parses_original_dashboard_labels() {
        assert_eq!(RiskLabel::parse("Medium Risk"), Some(RiskLabel::Medium));
        assert_eq!(RiskLabel::parse(" high risk "), Some(RiskLabel::High));
        assert_eq!(RiskLabel::parse("severe"), None);
    }

    #[test]
    fn unknown_skin_type_is_kept_verbatim() {
        assert_eq!(SkinType::parse(" Oily "), SkinType::Oily);
        let other = SkinType::parse("Acne-Prone");
        assert_eq!(other, SkinType::Other("acne-prone".to_string()));
        assert_eq!(other.as_str(), "acne-prone");
    }

    #[test]
    fn category_parsing_accepts_original_labels() {
        assert_eq!(TrendCategory::parse("Dietary"), TrendCategory::Diet);
        assert_eq!(TrendCategory::parse("Skincare"), TrendCategory::Skincare);
        assert_eq!(TrendCategory::parse("fitness"), TrendCategory::General);
    }

    #[test]
    fn risk_table_normalises_names() {
        let table = RiskTable::from_entries([IngredientRiskEntry {
            ingredient: "  Vitamin C ".to_string(),
            banned: false,
            category: RiskCategory::None,
            severity: None,
        }]);
        assert!(table.contains("vitamin c"));
        assert_eq!(table.lookup("vitamin c").map(|e| e.ingredient.as_str()), Some("vitamin c"));
    }
}
