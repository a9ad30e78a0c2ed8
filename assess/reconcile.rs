//! Joins rule-engine output with model predictions into one record per pair.
//!
//! Rule reasons are always carried; the model can add a second opinion but never
//! hides why the rules fired. When the model is unavailable, or a pair could not
//! be encoded, the prediction fields are `None`.

use crate::data::Dataset;
use crate::matrix::RiskMatrix;
use crate::model::TrainedModel;
use crate::types::{RiskLabel, Trend, UserProfile};
use ahash::AHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledAssessment {
    pub user_id: String,
    pub trend_id: String,
    pub rule_label: RiskLabel,
    pub rule_score: f64,
    pub rule_reasons: Vec<String>,
    pub predicted_label: Option<RiskLabel>,
    pub confidence: Option<f64>,
}

impl ReconciledAssessment {
    /// True when the model produced a label different from the rules.
    pub fn disagrees(&self) -> bool {
        self.predicted_label
            .is_some_and(|predicted| predicted != self.rule_label)
    }

    pub fn is_rule_only(&self) -> bool {
        self.predicted_label.is_none()
    }
}

/// One record per assessment in `matrix`, in the same user-major order.
///
/// A model whose vocabulary matches the matrix scores the matrix rows directly.
/// Any other model (for instance one kept from an earlier snapshot) re-encodes
/// each pair from `dataset` under its own vocabulary, looked up by id. Pairs
/// whose user or trend is not in `dataset` get no prediction.
pub fn reconcile(
    dataset: &Dataset,
    matrix: &RiskMatrix,
    model: Option<&TrainedModel>,
) -> Vec<ReconciledAssessment> {
    let users: AHashMap<&str, &UserProfile> = dataset
        .users
        .iter()
        .map(|user| (user.id.as_str(), user))
        .collect();
    let trends: AHashMap<&str, &Trend> = dataset
        .trends
        .iter()
        .map(|trend| (trend.id.as_str(), trend))
        .collect();

    let shared_vocabulary = model.is_some_and(|m| m.vocabulary == matrix.vocabulary);
    if model.is_some() && !shared_vocabulary {
        log::info!("Model vocabulary differs from the current snapshot; re-encoding pairs");
    }

    let records: Vec<ReconciledAssessment> = matrix
        .assessments
        .par_iter()
        .enumerate()
        .map(|(i, assessment)| {
            let prediction = model.and_then(|model| {
                let result = if shared_vocabulary {
                    matrix
                        .row_for_pair(i)
                        .map(|row| model.predict(row.features.view()))
                } else {
                    let user = users.get(assessment.user_id.as_str());
                    let trend = trends.get(assessment.trend_id.as_str());
                    if user.is_none() || trend.is_none() {
                        log::debug!(
                            "({}, {}) is not in the data set; no prediction",
                            assessment.user_id,
                            assessment.trend_id
                        );
                    }
                    user.zip(trend)
                        .map(|(user, trend)| model.predict_pair(user, trend, &dataset.risk_table))
                };
                match result? {
                    Ok(prediction) => Some(prediction),
                    Err(e) => {
                        log::debug!(
                            "no prediction for ({}, {}): {e}",
                            assessment.user_id,
                            assessment.trend_id
                        );
                        None
                    }
                }
            });

            ReconciledAssessment {
                user_id: assessment.user_id.clone(),
                trend_id: assessment.trend_id.clone(),
                rule_label: assessment.label,
                rule_score: assessment.score,
                rule_reasons: assessment.reasons.clone(),
                predicted_label: prediction.map(|p| p.label),
                confidence: prediction.map(|p| p.confidence),
            }
        })
        .collect();

    if model.is_some() {
        let disagreements = records.iter().filter(|r| r.disagrees()).count();
        log::info!(
            "Reconciled {} pairs; model and rules disagree on {disagreements}",
            records.len()
        );
    }
    records
}

/// Writes records as CSV. Reasons are joined with `"; "`; missing predictions
/// are left empty.
pub fn write_csv<W: Write>(records: &[ReconciledAssessment], writer: W) -> Result<(), csv::Error> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record([
        "user_id",
        "trend_id",
        "rule_label",
        "rule_score",
        "rule_reasons",
        "predicted_label",
        "confidence",
    ])?;
    for record in records {
        out.write_record([
            record.user_id.clone(),
            record.trend_id.clone(),
            record.rule_label.to_string(),
            format!("{}", record.rule_score),
            record.rule_reasons.join("; "),
            record
                .predicted_label
                .map(|label| label.to_string())
                .unwrap_or_default(),
            record
                .confidence
                .map(|c| format!("{c:.4}"))
                .unwrap_or_default(),
        ])?;
    }
    out.flush()?;
    Ok(())
}
