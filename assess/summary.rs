//! Aggregations over a finished run: label distributions, per-user
//! recommendation lists, per-trend risk share and an ingredient ranking.

use crate::data::Dataset;
use crate::matrix::DataIntegrityError;
use crate::reconcile::ReconciledAssessment;
use crate::types::{RiskAssessment, RiskLabel, Trend, TrendCategory};
use ahash::AHashMap;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LabelCounts {
    pub safe: usize,
    pub medium: usize,
    pub high: usize,
}

impl LabelCounts {
    pub fn record(&mut self, label: RiskLabel) {
        match label {
            RiskLabel::Safe => self.safe += 1,
            RiskLabel::Medium => self.medium += 1,
            RiskLabel::High => self.high += 1,
        }
    }

    pub fn get(&self, label: RiskLabel) -> usize {
        match label {
            RiskLabel::Safe => self.safe,
            RiskLabel::Medium => self.medium,
            RiskLabel::High => self.high,
        }
    }

    pub fn total(&self) -> usize {
        self.safe + self.medium + self.high
    }
}

impl FromIterator<RiskLabel> for LabelCounts {
    fn from_iter<I: IntoIterator<Item = RiskLabel>>(iter: I) -> Self {
        let mut counts = Self::default();
        for label in iter {
            counts.record(label);
        }
        counts
    }
}

/// Rule-label distribution over all assessments.
pub fn label_counts(assessments: &[RiskAssessment]) -> LabelCounts {
    assessments.iter().map(|a| a.label).collect()
}

fn trends_by_id(dataset: &Dataset) -> AHashMap<&str, &Trend> {
    dataset
        .trends
        .iter()
        .map(|trend| (trend.id.as_str(), trend))
        .collect()
}

/// Rule-label distribution per trend category.
pub fn counts_by_category(
    dataset: &Dataset,
    assessments: &[RiskAssessment],
) -> BTreeMap<TrendCategory, LabelCounts> {
    let trends = trends_by_id(dataset);
    let mut counts: BTreeMap<TrendCategory, LabelCounts> = BTreeMap::new();
    for assessment in assessments {
        let category = trends
            .get(assessment.trend_id.as_str())
            .map_or(TrendCategory::General, |trend| trend.category);
        counts.entry(category).or_default().record(assessment.label);
    }
    counts
}

/// Optional narrowing of a recommendation list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecommendationFilter {
    pub category: Option<TrendCategory>,
    pub label: Option<RiskLabel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub trend_id: String,
    pub category: TrendCategory,
    pub label: RiskLabel,
    pub score: f64,
    pub reasons: Vec<String>,
    pub predicted_label: Option<RiskLabel>,
    pub confidence: Option<f64>,
}

/// Every trend assessed for `user_id` that passes `filter`, riskiest first.
/// Equal scores fall back to natural order of the trend id.
pub fn recommendations_for(
    dataset: &Dataset,
    records: &[ReconciledAssessment],
    user_id: &str,
    filter: RecommendationFilter,
) -> Result<Vec<Recommendation>, DataIntegrityError> {
    if dataset.user(user_id).is_none() {
        return Err(DataIntegrityError::UnknownUser(user_id.to_string()));
    }
    let trends = trends_by_id(dataset);

    let mut list: Vec<Recommendation> = records
        .iter()
        .filter(|record| record.user_id == user_id)
        .filter_map(|record| {
            let category = trends
                .get(record.trend_id.as_str())
                .map_or(TrendCategory::General, |trend| trend.category);
            let keep = filter.category.is_none_or(|c| c == category)
                && filter.label.is_none_or(|l| l == record.rule_label);
            keep.then(|| Recommendation {
                trend_id: record.trend_id.clone(),
                category,
                label: record.rule_label,
                score: record.rule_score,
                reasons: record.rule_reasons.clone(),
                predicted_label: record.predicted_label,
                confidence: record.confidence,
            })
        })
        .collect();

    list.sort_by(|a, b| by_score_then_id(a.score, &a.trend_id, b.score, &b.trend_id));
    Ok(list)
}

fn by_score_then_id(a_score: f64, a_id: &str, b_score: f64, b_id: &str) -> Ordering {
    b_score
        .total_cmp(&a_score)
        .then_with(|| natord::compare(a_id, b_id))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRiskShare {
    pub trend_id: String,
    pub high: usize,
    pub total: usize,
    /// `high / total`, zero for a trend with no assessments.
    pub share: f64,
}

/// Fraction of users for whom each trend is High risk, largest share first.
pub fn trend_high_risk_share(
    dataset: &Dataset,
    assessments: &[RiskAssessment],
) -> Vec<TrendRiskShare> {
    let mut tallies: AHashMap<&str, (usize, usize)> = dataset
        .trends
        .iter()
        .map(|trend| (trend.id.as_str(), (0, 0)))
        .collect();
    for assessment in assessments {
        if let Some((high, total)) = tallies.get_mut(assessment.trend_id.as_str()) {
            *total += 1;
            if assessment.label == RiskLabel::High {
                *high += 1;
            }
        }
    }

    let mut shares: Vec<TrendRiskShare> = tallies
        .into_iter()
        .map(|(trend_id, (high, total))| TrendRiskShare {
            trend_id: trend_id.to_string(),
            high,
            total,
            share: if total > 0 {
                high as f64 / total as f64
            } else {
                0.0
            },
        })
        .collect();
    shares.sort_by(|a, b| by_score_then_id(a.share, &a.trend_id, b.share, &b.trend_id));
    shares
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngredientRisk {
    pub ingredient: String,
    /// Mean rule score over every assessment of a trend containing the ingredient.
    pub mean_score: f64,
    pub trend_count: usize,
}

/// The `top_n` ingredients with the highest mean rule score.
pub fn ingredient_risk_ranking(
    dataset: &Dataset,
    assessments: &[RiskAssessment],
    top_n: usize,
) -> Vec<IngredientRisk> {
    let trends = trends_by_id(dataset);

    let mut per_trend: AHashMap<&str, (f64, usize)> = AHashMap::new();
    for assessment in assessments {
        let entry = per_trend
            .entry(assessment.trend_id.as_str())
            .or_insert((0.0, 0));
        entry.0 += assessment.score;
        entry.1 += 1;
    }

    // ingredient -> (score sum, assessment count, trend count)
    let mut per_ingredient: AHashMap<&str, (f64, usize, usize)> = AHashMap::new();
    for (trend_id, (sum, count)) in &per_trend {
        let Some(trend) = trends.get(trend_id) else {
            continue;
        };
        for ingredient in &trend.ingredients {
            let entry = per_ingredient
                .entry(ingredient.as_str())
                .or_insert((0.0, 0, 0));
            entry.0 += sum;
            entry.1 += count;
            entry.2 += 1;
        }
    }

    let mut ranking: Vec<IngredientRisk> = per_ingredient
        .into_iter()
        .filter(|(_, (_, count, _))| *count > 0)
        .map(|(ingredient, (sum, count, trend_count))| IngredientRisk {
            ingredient: ingredient.to_string(),
            mean_score: sum / count as f64,
            trend_count,
        })
        .collect();
    ranking.sort_by(|a, b| by_score_then_id(a.mean_score, &a.ingredient, b.mean_score, &b.ingredient));
    ranking.truncate(top_n);
    ranking
}
