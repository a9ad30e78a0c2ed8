//! # Risk Matrix Builder
//!
//! Evaluates the full cross product of users × trends: every pair is scored by the
//! rule engine and encoded under a vocabulary fitted on the same snapshot. The
//! labelled rows are the training set for the learned model.
//!
//! Problems never abort the build. Trend ingredients missing from the risk table
//! are reported as [`DataIntegrityError::UnknownIngredient`] and treated as
//! category none with weight zero. A pair whose record cannot be encoded loses
//! its row but keeps its rule assessment, and the failure is listed in the
//! [`BuildReport`].

use crate::config::RuleConfig;
use crate::encode::{EncodingError, FeatureEncoder, Vocabulary};
use crate::rules::RuleEngine;
use crate::types::{RiskAssessment, RiskLabel, RiskTable, Trend, UserProfile};
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use std::io::Write;
use thiserror::Error;

/// A referenced record that does not exist. Recoverable: the pipeline degrades
/// to safe defaults and reports the issue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataIntegrityError {
    #[error(
        "trend '{trend_id}' references ingredient '{ingredient}' which is absent from the risk table ({affected_rows} rows affected)"
    )]
    UnknownIngredient {
        trend_id: String,
        ingredient: String,
        affected_rows: usize,
    },
    #[error("no user with id '{0}'")]
    UnknownUser(String),
    #[error("no trend with id '{0}'")]
    UnknownTrend(String),
}

/// A pair that could not be encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PairFailure {
    pub user_id: String,
    pub trend_id: String,
    pub error: EncodingError,
}

/// Everything that went wrong during a build, aggregated rather than fatal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub integrity: Vec<DataIntegrityError>,
    pub failures: Vec<PairFailure>,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.integrity.is_empty() && self.failures.is_empty()
    }

    /// Number of rows scored with at least one unknown ingredient. A row with two
    /// unknown ingredients is counted once per ingredient.
    pub fn rows_with_unknown_ingredients(&self) -> usize {
        self.integrity
            .iter()
            .map(|issue| match issue {
                DataIntegrityError::UnknownIngredient { affected_rows, .. } => *affected_rows,
                DataIntegrityError::UnknownUser(_) | DataIntegrityError::UnknownTrend(_) => 0,
            })
            .sum()
    }
}

/// The unit of training data.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskMatrixRow {
    pub user_id: String,
    pub trend_id: String,
    pub features: Array1<f64>,
    pub label: RiskLabel,
    pub rule_score: f64,
}

/// Observer for reporting per-pair progress while the matrix is built. Called
/// from worker threads.
pub trait BuildProgress: Sync {
    fn on_start(&self, _total_pairs: usize) {}
    fn on_pair(&self) {}
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopBuildProgress;

impl BuildProgress for NoopBuildProgress {}

/// The labelled feature table over all (user, trend) pairs.
#[derive(Debug, Clone)]
pub struct RiskMatrix {
    pub vocabulary: Vocabulary,
    /// One rule assessment per pair, in user-major order. Always complete.
    pub assessments: Vec<RiskAssessment>,
    /// Encoded rows, in the same order, minus pairs that failed to encode.
    pub rows: Vec<RiskMatrixRow>,
    pub report: BuildReport,
    /// For each assessment, the index of its row (if it has one).
    pair_rows: Vec<Option<usize>>,
}

impl RiskMatrix {
    pub fn build(
        users: &[UserProfile],
        trends: &[Trend],
        risk_table: &RiskTable,
        config: &RuleConfig,
    ) -> Self {
        Self::build_with_progress(users, trends, risk_table, config, &NoopBuildProgress)
    }

    pub fn build_with_progress(
        users: &[UserProfile],
        trends: &[Trend],
        risk_table: &RiskTable,
        config: &RuleConfig,
        progress: &dyn BuildProgress,
    ) -> Self {
        let vocabulary = Vocabulary::fit(users, trends);
        let engine = RuleEngine::new(config.clone());
        let encoder = FeatureEncoder::new(&vocabulary, risk_table);

        let integrity = unknown_ingredients(trends, risk_table, users.len());
        for issue in &integrity {
            log::warn!("{issue}; treating it as risk category 'none' with weight 0");
        }

        let pairs: Vec<(&UserProfile, &Trend)> =
            users.iter().cartesian_product(trends.iter()).collect();
        log::info!(
            "Building risk matrix over {} users x {} trends ({} pairs)",
            users.len(),
            trends.len(),
            pairs.len()
        );
        progress.on_start(pairs.len());

        // Ordered collect keeps the parallel result identical to a sequential pass.
        let outcomes: Vec<(RiskAssessment, Result<Array1<f64>, EncodingError>)> = pairs
            .par_iter()
            .map(|&(user, trend)| {
                let assessment = engine.assess(user, trend, risk_table);
                let features = encoder.encode(user, trend);
                progress.on_pair();
                (assessment, features)
            })
            .collect();
        progress.on_finish();

        let mut assessments = Vec::with_capacity(outcomes.len());
        let mut rows = Vec::with_capacity(outcomes.len());
        let mut pair_rows = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();

        for (assessment, features) in outcomes {
            match features {
                Ok(features) => {
                    pair_rows.push(Some(rows.len()));
                    rows.push(RiskMatrixRow {
                        user_id: assessment.user_id.clone(),
                        trend_id: assessment.trend_id.clone(),
                        features,
                        label: assessment.label,
                        rule_score: assessment.score,
                    });
                }
                Err(error) => {
                    log::debug!(
                        "pair ({}, {}) kept rule-only: {error}",
                        assessment.user_id,
                        assessment.trend_id
                    );
                    pair_rows.push(None);
                    failures.push(PairFailure {
                        user_id: assessment.user_id.clone(),
                        trend_id: assessment.trend_id.clone(),
                        error,
                    });
                }
            }
            assessments.push(assessment);
        }

        if !failures.is_empty() {
            log::warn!(
                "{} of {} pairs could not be encoded and were left out of the training rows",
                failures.len(),
                assessments.len()
            );
        }

        Self {
            vocabulary,
            assessments,
            rows,
            report: BuildReport {
                integrity,
                failures,
            },
            pair_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The encoded row belonging to the `pair`-th assessment, if it encoded.
    pub fn row_for_pair(&self, pair: usize) -> Option<&RiskMatrixRow> {
        self.pair_rows
            .get(pair)
            .copied()
            .flatten()
            .map(|index| &self.rows[index])
    }

    /// Number of rows per label, indexed by [`RiskLabel::index`].
    pub fn label_counts(&self) -> [usize; RiskLabel::COUNT] {
        let mut counts = [0; RiskLabel::COUNT];
        for row in &self.rows {
            counts[row.label.index()] += 1;
        }
        counts
    }

    /// Stacks the selected rows into a design matrix, one row per index.
    pub fn design_matrix(&self, indices: &[usize]) -> Array2<f64> {
        let width = self.vocabulary.width();
        let mut design = Array2::<f64>::zeros((indices.len(), width));
        for (mut out, &index) in design.axis_iter_mut(Axis(0)).zip(indices) {
            out.assign(&self.rows[index].features);
        }
        design
    }

    /// Writes the matrix as a tab-separated table: ids, rule label and score,
    /// then one column per feature.
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);

        let mut header = vec![
            "user_id".to_string(),
            "trend_id".to_string(),
            "rule_label".to_string(),
            "rule_score".to_string(),
        ];
        header.extend(self.vocabulary.feature_names());
        out.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![
                row.user_id.clone(),
                row.trend_id.clone(),
                row.label.to_string(),
                format!("{}", row.rule_score),
            ];
            record.extend(row.features.iter().map(|v| format!("{v}")));
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }
}

/// One issue per (trend, unknown ingredient). Every user is paired with the
/// trend, so each issue affects `user_count` rows.
fn unknown_ingredients(
    trends: &[Trend],
    risk_table: &RiskTable,
    user_count: usize,
) -> Vec<DataIntegrityError> {
    trends
        .iter()
        .flat_map(|trend| {
            trend
                .ingredients
                .iter()
                .filter(|ingredient| !risk_table.contains(ingredient))
                .map(|ingredient| DataIntegrityError::UnknownIngredient {
                    trend_id: trend.id.clone(),
                    ingredient: ingredient.clone(),
                    affected_rows: user_count,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{sample_table, sample_trends, sample_users, trend};
    use crate::types::TrendCategory;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build() -> RiskMatrix {
        RiskMatrix::build(
            &sample_users(),
            &sample_trends(),
            &sample_table(),
            &RuleConfig::default(),
        )
    }

    #[test]
    fn covers_the_full_cross_product_without_duplicates() {
        let matrix = build();
        let expected = sample_users().len() * sample_trends().len();
        assert_eq!(matrix.len(), expected);
        assert_eq!(matrix.assessments.len(), expected);

        let pairs: HashSet<(&str, &str)> = matrix
            .rows
            .iter()
            .map(|row| (row.user_id.as_str(), row.trend_id.as_str()))
            .collect();
        assert_eq!(pairs.len(), expected);
        assert!(matrix.report.is_clean());
    }

    #[test]
    fn rows_carry_the_rule_labels() {
        let users = sample_users();
        let trends = sample_trends();
        let table = sample_table();
        let matrix = RiskMatrix::build(&users, &trends, &table, &RuleConfig::default());
        let engine = RuleEngine::default();

        let mut i = 0;
        for user in &users {
            for trend in &trends {
                let expected = engine.assess(user, trend, &table);
                assert_eq!(matrix.assessments[i], expected);
                let row = matrix.row_for_pair(i).unwrap();
                assert_eq!(row.label, expected.label);
                assert_eq!(row.features.len(), matrix.vocabulary.width());
                i += 1;
            }
        }
    }

    #[test]
    fn sample_data_contains_every_label() {
        let counts = build().label_counts();
        assert!(counts.iter().all(|&c| c > 0), "counts: {counts:?}");
        assert_eq!(counts.iter().sum::<usize>(), 120);
    }

    #[test]
    fn unknown_ingredients_are_reported_not_fatal() {
        let users = sample_users();
        let mut trends = sample_trends();
        trends.push(trend(
            "moon dust",
            TrendCategory::Supplement,
            &["stardust", "collagen"],
        ));
        let matrix = RiskMatrix::build(&users, &trends, &sample_table(), &RuleConfig::default());

        assert_eq!(matrix.len(), users.len() * trends.len());
        assert_eq!(
            matrix.report.integrity,
            vec![DataIntegrityError::UnknownIngredient {
                trend_id: "moon dust".to_string(),
                ingredient: "stardust".to_string(),
                affected_rows: users.len(),
            }]
        );
        assert_eq!(matrix.report.rows_with_unknown_ingredients(), users.len());
        assert!(
            matrix
                .assessments
                .iter()
                .filter(|a| a.trend_id == "moon dust")
                .all(|a| a.label == RiskLabel::Safe)
        );
    }

    #[test]
    fn encoding_failures_only_drop_their_own_pairs() {
        let mut users = sample_users();
        users[2].age = None;
        let trends = sample_trends();
        let matrix = RiskMatrix::build(&users, &trends, &sample_table(), &RuleConfig::default());

        assert_eq!(matrix.assessments.len(), users.len() * trends.len());
        assert_eq!(matrix.len(), (users.len() - 1) * trends.len());
        assert_eq!(matrix.report.failures.len(), trends.len());
        assert!(matrix.report.failures.iter().all(|f| f.user_id == users[2].id));

        let failed_pair = 2 * trends.len();
        assert!(matrix.row_for_pair(failed_pair).is_none());
        assert_eq!(matrix.assessments[failed_pair].user_id, users[2].id);
    }

    #[test]
    fn progress_observer_sees_every_pair() {
        #[derive(Default)]
        struct Counter {
            total: AtomicUsize,
            seen: AtomicUsize,
        }
        impl BuildProgress for Counter {
            fn on_start(&self, total_pairs: usize) {
                self.total.store(total_pairs, Ordering::SeqCst);
            }
            fn on_pair(&self) {
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Counter::default();
        RiskMatrix::build_with_progress(
            &sample_users(),
            &sample_trends(),
            &sample_table(),
            &RuleConfig::default(),
            &counter,
        );
        assert_eq!(counter.total.load(Ordering::SeqCst), 120);
        assert_eq!(counter.seen.load(Ordering::SeqCst), 120);
    }

    #[test]
    fn observers_may_skip_the_start_callback() {
        #[derive(Default)]
        struct FinishOnly {
            finished: AtomicUsize,
        }
        impl BuildProgress for FinishOnly {
            fn on_finish(&self) {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
        }

        let observer = FinishOnly::default();
        let matrix = RiskMatrix::build_with_progress(
            &sample_users(),
            &sample_trends(),
            &sample_table(),
            &RuleConfig::default(),
            &observer,
        );
        assert_eq!(matrix.len(), 120);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writes_a_header_and_one_line_per_row() {
        let matrix = build();
        let mut buffer = Vec::new();
        matrix.write_tsv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("user_id\ttrend_id\trule_label\trule_score\tage\tbmi"));
        assert_eq!(lines.count(), matrix.len());
    }

    #[test]
    fn design_matrix_stacks_selected_rows() {
        let matrix = build();
        let design = matrix.design_matrix(&[3, 0]);
        assert_eq!(design.nrows(), 2);
        assert_eq!(design.row(0), matrix.rows[3].features.view());
        assert_eq!(design.row(1), matrix.rows[0].features.view());
    }
}
