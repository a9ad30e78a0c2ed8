// ========================================================================================
//
//                         THE HYBRID RISK ASSESSMENT PIPELINE
//
// ========================================================================================
//
// Orchestrates one run over a data snapshot:
//
//   1. Rule engine over the full cross product (the risk matrix).
//   2. Model training under the configured time budget.
//   3. Reconciliation of rule labels and model predictions.
//
// Runs are memoized by snapshot. When training fails the pipeline degrades: a
// timeout or optimizer failure keeps serving the last good model, a degenerate
// label space drops to rule-only output. Either way the reason is kept in the
// outcome. Only runs that would come out the same again are memoized, so a
// timed-out snapshot is retrained on the next run.

use crate::cache::{AssessmentCache, snapshot_key};
use crate::config::AssessConfig;
use crate::data::Dataset;
use crate::estimate::{EstimationError, train_with_budget};
use crate::matrix::{BuildProgress, DataIntegrityError, NoopBuildProgress, RiskMatrix};
use crate::model::TrainedModel;
use crate::reconcile::{ReconciledAssessment, reconcile};
use crate::rules::RuleEngine;
use crate::types::RiskAssessment;
use std::sync::Arc;

/// Which model, if any, produced the predictions of a run.
#[derive(Debug, Clone)]
pub enum ModelStatus {
    /// Trained on this snapshot.
    Trained(Arc<TrainedModel>),
    /// Training failed; predictions come from the last model that succeeded.
    Previous {
        model: Arc<TrainedModel>,
        reason: EstimationError,
    },
    /// No usable model. Records carry rule output only.
    RuleOnly { reason: EstimationError },
}

impl ModelStatus {
    /// Decides the status of a run from its training result and the last good
    /// model. A degenerate data snapshot never reuses an older model.
    pub fn resolve(
        result: Result<TrainedModel, EstimationError>,
        previous: Option<Arc<TrainedModel>>,
    ) -> Self {
        match result {
            Ok(model) => Self::Trained(Arc::new(model)),
            Err(reason) if reason.is_deterministic() => Self::RuleOnly { reason },
            Err(reason) => match previous {
                Some(model) => Self::Previous { model, reason },
                None => Self::RuleOnly { reason },
            },
        }
    }

    pub fn model(&self) -> Option<&Arc<TrainedModel>> {
        match self {
            Self::Trained(model) | Self::Previous { model, .. } => Some(model),
            Self::RuleOnly { .. } => None,
        }
    }

    /// False when training failed for a reason that may not recur, such as a
    /// timeout.
    pub fn is_reproducible(&self) -> bool {
        self.reason().is_none_or(EstimationError::is_deterministic)
    }

    /// Why this run is not using a freshly trained model.
    pub fn reason(&self) -> Option<&EstimationError> {
        match self {
            Self::Trained(_) => None,
            Self::Previous { reason, .. } | Self::RuleOnly { reason } => Some(reason),
        }
    }
}

/// Everything one run produced. Shared read-only behind `Arc`.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub matrix: Arc<RiskMatrix>,
    pub model: ModelStatus,
    pub records: Vec<ReconciledAssessment>,
}

impl PipelineOutcome {
    pub fn assessments(&self) -> &[RiskAssessment] {
        &self.matrix.assessments
    }
}

pub struct RiskPipeline {
    config: AssessConfig,
    engine: RuleEngine,
    cache: AssessmentCache,
}

impl RiskPipeline {
    pub fn new(config: AssessConfig) -> Self {
        Self {
            engine: RuleEngine::new(config.rules.clone()),
            config,
            cache: AssessmentCache::default(),
        }
    }

    pub fn config(&self) -> &AssessConfig {
        &self.config
    }

    /// Seeds the fallback model, e.g. one loaded from disk.
    pub fn with_model(mut self, model: TrainedModel) -> Self {
        self.cache.remember_model(Arc::new(model));
        self
    }

    /// Rule assessment of a single pair, without building the matrix.
    pub fn assess_pair(
        &self,
        dataset: &Dataset,
        user_id: &str,
        trend_id: &str,
    ) -> Result<RiskAssessment, DataIntegrityError> {
        let (user, trend) = dataset.find_pair(user_id, trend_id)?;
        for ingredient in trend.ingredients.iter().filter(|i| !dataset.risk_table.contains(i)) {
            log::warn!(
                "{}",
                DataIntegrityError::UnknownIngredient {
                    trend_id: trend.id.clone(),
                    ingredient: ingredient.clone(),
                    affected_rows: 1,
                }
            );
        }
        Ok(self.engine.assess(user, trend, &dataset.risk_table))
    }

    pub fn run(&mut self, dataset: &Dataset) -> Arc<PipelineOutcome> {
        self.run_with_progress(dataset, &NoopBuildProgress)
    }

    pub fn run_with_progress(
        &mut self,
        dataset: &Dataset,
        progress: &dyn BuildProgress,
    ) -> Arc<PipelineOutcome> {
        let key = snapshot_key(dataset, &self.config);
        if let Some(outcome) = self.cache.get(key) {
            log::info!("Reusing memoized run for snapshot {key:016x}");
            return outcome;
        }

        let matrix = Arc::new(RiskMatrix::build_with_progress(
            &dataset.users,
            &dataset.trends,
            &dataset.risk_table,
            &self.config.rules,
            progress,
        ));
        let result = train_with_budget(Arc::clone(&matrix), &self.config.training);
        let outcome = self.finish(dataset, matrix, result);
        self.memoize(key, &outcome);
        outcome
    }

    fn memoize(&mut self, key: u64, outcome: &Arc<PipelineOutcome>) {
        if outcome.model.is_reproducible() {
            self.cache.insert(key, Arc::clone(outcome));
        } else {
            log::debug!("Not memoizing snapshot {key:016x}; training will be retried");
        }
    }

    /// Resolves the model status, reconciles, and remembers a fresh model.
    fn finish(
        &mut self,
        dataset: &Dataset,
        matrix: Arc<RiskMatrix>,
        result: Result<TrainedModel, EstimationError>,
    ) -> Arc<PipelineOutcome> {
        let model = ModelStatus::resolve(result, self.cache.last_model());
        match &model {
            ModelStatus::Trained(trained) => self.cache.remember_model(Arc::clone(trained)),
            ModelStatus::Previous { reason, .. } => {
                log::warn!("{reason} Serving predictions from the previous model.");
            }
            ModelStatus::RuleOnly { reason } => {
                log::warn!("{reason} Serving rule-engine output only.");
            }
        }

        let records = reconcile(dataset, &matrix, model.model().map(Arc::as_ref));
        Arc::new(PipelineOutcome {
            matrix,
            model,
            records,
        })
    }

    /// Forgets memoized runs. Call after the input tables change on disk.
    pub fn reload(&mut self) {
        self.cache.invalidate();
    }
}
