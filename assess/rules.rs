//! # Rule Engine
//!
//! Deterministic, explainable scoring of a single (user, trend) pair. The engine is
//! an ordered list of pure checks. Each check receives the read-only context and
//! the accumulated state, and returns the next state. Two checks run for every
//! trend (banned ingredients, allergies); the rest come from a handler table
//! keyed on [`TrendCategory`].
//!
//! The output of this module is ground truth for model training, so nothing here
//! may depend on randomness or on hash-map iteration order. Ingredients are kept
//! in a `BTreeSet`, which fixes the order in which reasons are appended.

use crate::config::RuleConfig;
use crate::types::{
    IngredientRiskEntry, RiskAssessment, RiskCategory, RiskLabel, RiskTable, SkinType, Trend,
    TrendCategory, UserProfile,
};

/// Everything a check may read.
#[derive(Clone, Copy)]
pub struct RuleContext<'a> {
    pub user: &'a UserProfile,
    pub trend: &'a Trend,
    pub risk_table: &'a RiskTable,
    pub config: &'a RuleConfig,
}

/// Running result threaded through the checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckState {
    pub score: f64,
    pub reasons: Vec<String>,
    /// Set by the banned-ingredient check. Once set the label is High no matter
    /// what the score says.
    pub pinned_high: bool,
}

impl CheckState {
    fn add(mut self, weight: f64, reason: String) -> Self {
        self.score += weight;
        self.reasons.push(reason);
        self
    }

    fn label(&self, medium_threshold: f64) -> RiskLabel {
        if self.pinned_high {
            RiskLabel::High
        } else {
            RiskLabel::from_score(self.score, medium_threshold)
        }
    }
}

/// A single step of the rule pipeline.
pub type RuleCheck = fn(&RuleContext<'_>, CheckState) -> CheckState;

// ========================================================================================
//                                   The handler table
// ========================================================================================

/// Checks that apply to every trend, in this order, before any category checks.
pub const UNIVERSAL_CHECKS: &[RuleCheck] = &[check_banned_ingredients, check_allergies];

const SKINCARE_CHECKS: &[RuleCheck] = &[check_skin_compatibility];
const DIET_CHECKS: &[RuleCheck] = &[check_hormone_compatibility, check_weight_loss_fit];
const SUPPLEMENT_CHECKS: &[RuleCheck] = &[check_hormone_compatibility];
const GENERAL_CHECKS: &[RuleCheck] = &[];

impl TrendCategory {
    /// Category-specific checks, run after [`UNIVERSAL_CHECKS`].
    pub fn checks(self) -> &'static [RuleCheck] {
        match self {
            Self::Skincare => SKINCARE_CHECKS,
            Self::Diet => DIET_CHECKS,
            Self::Supplement => SUPPLEMENT_CHECKS,
            Self::General => GENERAL_CHECKS,
        }
    }
}

/// Scores (user, trend) pairs against an ingredient risk table.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    config: RuleConfig,
}

impl RuleEngine {
    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Runs every applicable check and labels the result. Pure: identical inputs
    /// always produce identical assessments.
    pub fn assess(
        &self,
        user: &UserProfile,
        trend: &Trend,
        risk_table: &RiskTable,
    ) -> RiskAssessment {
        let ctx = RuleContext {
            user,
            trend,
            risk_table,
            config: &self.config,
        };

        let state = UNIVERSAL_CHECKS
            .iter()
            .chain(trend.category.checks())
            .fold(CheckState::default(), |state, check| check(&ctx, state));

        let label = state.label(self.config.medium_threshold);
        log::trace!(
            "assessed user '{}' x trend '{}': {label} (score {:.2}, {} reasons)",
            user.id,
            trend.id,
            state.score,
            state.reasons.len()
        );

        RiskAssessment {
            user_id: user.id.clone(),
            trend_id: trend.id.clone(),
            label,
            score: state.score,
            reasons: state.reasons,
        }
    }
}

// ========================================================================================
//                                      The checks
// ========================================================================================

/// Severity of a known entry, falling back to the configured default when the
/// table leaves it unspecified.
#[inline]
fn entry_weight(entry: &IngredientRiskEntry, config: &RuleConfig) -> f64 {
    entry.severity.unwrap_or(config.default_ingredient_weight)
}

/// Summed weight of the trend ingredients whose entry is in `category`. Unknown
/// ingredients are treated as category none and contribute nothing.
fn category_weight(ctx: &RuleContext<'_>, category: RiskCategory) -> Option<f64> {
    let weights: Vec<f64> = ctx
        .trend
        .ingredients
        .iter()
        .filter_map(|ingredient| ctx.risk_table.lookup(ingredient))
        .filter(|entry| entry.category == category)
        .map(|entry| entry_weight(entry, ctx.config))
        .collect();
    (!weights.is_empty()).then(|| weights.iter().sum())
}

pub fn check_banned_ingredients(ctx: &RuleContext<'_>, mut state: CheckState) -> CheckState {
    for ingredient in &ctx.trend.ingredients {
        if let Some(entry) = ctx.risk_table.lookup(ingredient).filter(|e| e.banned) {
            state = state.add(
                entry_weight(entry, ctx.config),
                format!("banned ingredient: {ingredient}"),
            );
            state.pinned_high = true;
        }
    }
    state
}

pub fn check_allergies(ctx: &RuleContext<'_>, mut state: CheckState) -> CheckState {
    for ingredient in ctx.trend.ingredients.intersection(&ctx.user.allergies) {
        let weight = ctx
            .risk_table
            .lookup(ingredient)
            .and_then(|entry| entry.severity)
            .unwrap_or(ctx.config.default_ingredient_weight);
        state = state.add(weight, format!("allergen match: {ingredient}"));
    }
    state
}

/// True when a skincare trend is not aimed at this user's skin. A trend without a
/// declared target is still treated as a mismatch for sensitive skin.
pub fn skin_mismatch(user: &UserProfile, trend: &Trend) -> bool {
    match &trend.targets.skin_type {
        Some(target) => *target != user.skin_type,
        None => user.skin_type == SkinType::Sensitive,
    }
}

pub fn check_skin_compatibility(ctx: &RuleContext<'_>, state: CheckState) -> CheckState {
    if !skin_mismatch(ctx.user, ctx.trend) {
        return state;
    }
    match category_weight(ctx, RiskCategory::Irritant) {
        Some(weight) => state.add(weight, "skin type mismatch".to_string()),
        None => state,
    }
}

pub fn check_hormone_compatibility(ctx: &RuleContext<'_>, state: CheckState) -> CheckState {
    if !ctx.user.hormone_level.is_sensitive() {
        return state;
    }
    match category_weight(ctx, RiskCategory::Hormonal) {
        Some(weight) => state.add(weight, "hormonal risk".to_string()),
        None => state,
    }
}

pub fn check_weight_loss_fit(ctx: &RuleContext<'_>, state: CheckState) -> CheckState {
    let high_bmi = ctx
        .user
        .bmi
        .is_some_and(|bmi| bmi > ctx.config.high_bmi_threshold);
    if ctx.trend.targets.weight_loss && high_bmi {
        state.add(
            ctx.config.diet_mismatch_weight,
            "diet mismatch: high BMI".to_string(),
        )
    } else {
        state
    }
}
