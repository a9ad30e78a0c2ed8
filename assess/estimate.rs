// assess/estimate.rs

//! # Model Estimation
//!
//! Fits the learned risk model on the rows of a [`RiskMatrix`]. The classifier is
//! a multinomial logistic (softmax) regression over {Safe, Medium, High}:
//!
//! 1.  **Split:** rows are partitioned per class into a training and a holdout
//!     set with a seeded `StdRng`, so a given seed always yields the same split
//!     and every class present in the data keeps at least one training row.
//!
//! 2.  **Fit:** the ridge-penalised negative log-likelihood is minimised with
//!     BFGS. The bias column is left unpenalised. If the line search gives up,
//!     a backtracking gradient descent finishes the job from the same start.
//!
//! 3.  **Evaluate:** accuracy, per-class precision/recall and the confusion
//!     matrix are computed on the holdout rows.
//!
//! A label space with an empty class cannot be learned; that case is reported as
//! [`EstimationError::InsufficientData`] so the caller can fall back to the rule
//! engine alone.

// External Crate for Optimization
use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::config::TrainingConfig;
use crate::matrix::RiskMatrix;
use crate::model::{TrainedModel, softmax_rows};
use crate::types::RiskLabel;

use ndarray::{Array1, Array2, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    #[error("The risk matrix has no encoded rows to train on.")]
    EmptyMatrix,

    #[error(
        "Cannot train a classifier: no training examples for class(es) {}. Falling back to rule-engine output is required.",
        display_labels(.missing)
    )]
    InsufficientData { missing: Vec<RiskLabel> },

    #[error("Training did not finish within its time budget of {budget:?}.")]
    TimedOut { budget: Duration },

    #[error("Optimization produced an unusable model: {0}")]
    OptimizationFailed(String),

    #[error("The training worker failed: {0}")]
    WorkerFailed(String),

    #[error("Training was cancelled before it finished.")]
    Cancelled,
}

impl EstimationError {
    /// True when retraining on the same snapshot would fail the same way.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::InsufficientData { .. } | Self::EmptyMatrix)
    }
}

fn display_labels(labels: &[RiskLabel]) -> String {
    labels
        .iter()
        .map(|label| label.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ========================================================================================
//                                   Evaluation results
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: RiskLabel,
    /// Zero when the class was never predicted.
    pub precision: f64,
    /// Zero when the class has no evaluation rows.
    pub recall: f64,
    pub support: usize,
}

/// Metrics recorded at training time and saved with the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub accuracy: f64,
    pub train_size: usize,
    pub holdout_size: usize,
    /// True when the holdout partition was empty and the metrics describe the
    /// training rows instead.
    pub evaluated_on_training: bool,
    pub iterations: usize,
    pub final_cost: f64,
    /// `confusion[actual][predicted]`, indexed by [`RiskLabel::index`].
    pub confusion: [[usize; RiskLabel::COUNT]; RiskLabel::COUNT],
    pub per_class: Vec<ClassMetrics>,
}

/// Accuracy, per-class metrics and confusion matrix for paired label slices.
pub fn evaluate(
    actual: &[RiskLabel],
    predicted: &[RiskLabel],
) -> (f64, Vec<ClassMetrics>, [[usize; RiskLabel::COUNT]; RiskLabel::COUNT]) {
    let mut confusion = [[0usize; RiskLabel::COUNT]; RiskLabel::COUNT];
    for (a, p) in actual.iter().zip(predicted) {
        confusion[a.index()][p.index()] += 1;
    }

    let total = actual.len().min(predicted.len());
    let correct: usize = (0..RiskLabel::COUNT).map(|k| confusion[k][k]).sum();
    let accuracy = if total > 0 {
        correct as f64 / total as f64
    } else {
        0.0
    };

    let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };
    let per_class = RiskLabel::ALL
        .iter()
        .map(|&label| {
            let k = label.index();
            let support: usize = confusion[k].iter().sum();
            let predicted_as_k: usize = confusion.iter().map(|row| row[k]).sum();
            ClassMetrics {
                label,
                precision: ratio(confusion[k][k], predicted_as_k),
                recall: ratio(confusion[k][k], support),
                support,
            }
        })
        .collect();

    (accuracy, per_class, confusion)
}

// ========================================================================================
//                                        Splitting
// ========================================================================================

/// Row indices of the two partitions, each sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub holdout: Vec<usize>,
}

/// Splits row indices per class. Each class holds out `round(n * fraction)` rows,
/// capped so at least one row of the class stays in training.
pub fn stratified_split(labels: &[RiskLabel], holdout_fraction: f64, seed: u64) -> DataSplit {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut holdout = Vec::new();

    for label in RiskLabel::ALL {
        let mut indices: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == label)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            continue;
        }
        indices.shuffle(&mut rng);

        let n = indices.len();
        let n_holdout = ((n as f64 * holdout_fraction).round() as usize).min(n - 1);
        holdout.extend_from_slice(&indices[..n_holdout]);
        train.extend_from_slice(&indices[n_holdout..]);
    }

    train.sort_unstable();
    holdout.sort_unstable();
    DataSplit { train, holdout }
}

// ========================================================================================
//                                         Training
// ========================================================================================

/// Stop flag shared between a training run and whoever is waiting on it. Clones
/// observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The main entry point for model training.
pub fn train(matrix: &RiskMatrix, config: &TrainingConfig) -> Result<TrainedModel, EstimationError> {
    train_cancellable(matrix, config, &CancelToken::new())
}

/// [`train`], stopping the optimizer with [`EstimationError::Cancelled`] soon
/// after `cancel` is set.
pub fn train_cancellable(
    matrix: &RiskMatrix,
    config: &TrainingConfig,
    cancel: &CancelToken,
) -> Result<TrainedModel, EstimationError> {
    if matrix.is_empty() {
        return Err(EstimationError::EmptyMatrix);
    }
    let started = Instant::now();

    let labels: Vec<RiskLabel> = matrix.rows.iter().map(|row| row.label).collect();
    let split = stratified_split(&labels, config.holdout_fraction, config.seed);

    let mut train_counts = [0usize; RiskLabel::COUNT];
    for &i in &split.train {
        train_counts[labels[i].index()] += 1;
    }
    let missing: Vec<RiskLabel> = RiskLabel::ALL
        .into_iter()
        .filter(|label| train_counts[label.index()] == 0)
        .collect();
    if !missing.is_empty() {
        log::warn!(
            "Training aborted: no examples for {}",
            display_labels(&missing)
        );
        return Err(EstimationError::InsufficientData { missing });
    }

    log::info!(
        "Starting model training. {} training rows, {} holdout rows, {} features.",
        split.train.len(),
        split.holdout.len(),
        matrix.vocabulary.width()
    );
    log::debug!(
        "Training class counts: Safe={}, Medium={}, High={}",
        train_counts[0],
        train_counts[1],
        train_counts[2]
    );

    let x_train = matrix.design_matrix(&split.train);
    let y_train: Vec<RiskLabel> = split.train.iter().map(|&i| labels[i]).collect();
    let fit = internal::fit_softmax(x_train, &y_train, config, cancel)?;

    let mut model = TrainedModel::new(matrix.vocabulary.clone(), fit.weights);

    let (eval_indices, evaluated_on_training) = if split.holdout.is_empty() {
        log::warn!("Holdout partition is empty; reporting metrics on the training rows.");
        (&split.train, true)
    } else {
        (&split.holdout, false)
    };
    let x_eval = matrix.design_matrix(eval_indices);
    let predicted: Vec<RiskLabel> = model
        .predict_batch(x_eval.view())
        .map_err(|e| EstimationError::OptimizationFailed(e.to_string()))?
        .into_iter()
        .map(|prediction| prediction.label)
        .collect();
    let actual: Vec<RiskLabel> = eval_indices.iter().map(|&i| labels[i]).collect();
    let (accuracy, per_class, confusion) = evaluate(&actual, &predicted);

    model.metrics = TrainingMetrics {
        accuracy,
        train_size: split.train.len(),
        holdout_size: split.holdout.len(),
        evaluated_on_training,
        iterations: fit.iterations,
        final_cost: fit.final_cost,
        confusion,
        per_class,
    };

    log::info!(
        "Model trained in {:.2?} ({} iterations). Holdout accuracy: {:.3}",
        started.elapsed(),
        fit.iterations,
        accuracy
    );
    Ok(model)
}

/// Runs [`train`] on a worker thread and gives up after the configured budget.
/// A zero budget trains on the calling thread without a limit.
pub fn train_with_budget(
    matrix: Arc<RiskMatrix>,
    config: &TrainingConfig,
) -> Result<TrainedModel, EstimationError> {
    match config.time_budget() {
        None => train(&matrix, config),
        Some(budget) => {
            let worker_config = config.clone();
            run_with_budget(budget, move |cancel| {
                train_cancellable(&matrix, &worker_config, &cancel)
            })
        }
    }
}

/// Runs `job` on a named worker thread, waiting at most `budget` for its result.
/// On timeout the job's [`CancelToken`] is set so the worker winds down, and
/// whatever it returns afterwards is discarded.
pub fn run_with_budget<T, F>(budget: Duration, job: F) -> Result<T, EstimationError>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> Result<T, EstimationError> + Send + 'static,
{
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("risk-model-trainer".to_string())
        .spawn(move || {
            // The receiver is gone after a timeout; nothing left to report to.
            let _ = tx.send(job(worker_cancel));
        })
        .map_err(|e| EstimationError::WorkerFailed(e.to_string()))?;

    match rx.recv_timeout(budget) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            cancel.cancel();
            log::warn!("Training exceeded its {budget:?} budget; stopping the trainer");
            Err(EstimationError::TimedOut { budget })
        }
        Err(RecvTimeoutError::Disconnected) => Err(EstimationError::WorkerFailed(
            "the trainer exited without producing a result".to_string(),
        )),
    }
}

/// Internal module for estimation logic.
mod internal {
    use super::*;

    pub(super) struct SoftmaxFit {
        pub(super) weights: Array2<f64>,
        pub(super) iterations: usize,
        pub(super) final_cost: f64,
    }

    /// Penalised softmax negative log-likelihood over a fixed design matrix.
    /// Parameters are a `K x (d + 1)` matrix flattened row-major; the last column
    /// of each row is that class's bias.
    pub(super) struct SoftmaxObjective {
        x: Array2<f64>,
        targets: Array2<f64>,
        l2: f64,
    }

    impl SoftmaxObjective {
        pub(super) fn new(x: Array2<f64>, labels: &[RiskLabel], l2: f64) -> Self {
            let mut targets = Array2::<f64>::zeros((labels.len(), RiskLabel::COUNT));
            for (i, label) in labels.iter().enumerate() {
                targets[[i, label.index()]] = 1.0;
            }
            Self { x, targets, l2 }
        }

        pub(super) fn n_params(&self) -> usize {
            RiskLabel::COUNT * (self.x.ncols() + 1)
        }

        pub(super) fn cost_and_grad(&self, theta: &Array1<f64>) -> (f64, Array1<f64>) {
            let d = self.x.ncols();
            let n = self.x.nrows().max(1) as f64;
            let w = unflatten(theta, d + 1);
            let weights = w.slice(s![.., ..d]);
            let bias = w.column(d);

            let mut logits = self.x.dot(&weights.t());
            logits += &bias;
            let probs = softmax_rows(logits);

            let nll: f64 = probs
                .axis_iter(Axis(0))
                .zip(self.targets.axis_iter(Axis(0)))
                .map(|(p, t)| -p.dot(&t).max(1e-300).ln())
                .sum();
            let penalty = 0.5 * self.l2 * weights.iter().map(|v| v * v).sum::<f64>();
            let cost = nll / n + penalty;

            let residual = (&probs - &self.targets) / n;
            let grad_w = residual.t().dot(&self.x) + &weights * self.l2;
            let grad_b = residual.sum_axis(Axis(0));

            let mut grad = Array1::<f64>::zeros(theta.len());
            for k in 0..RiskLabel::COUNT {
                let row = k * (d + 1);
                for j in 0..d {
                    grad[row + j] = grad_w[[k, j]];
                }
                grad[row + d] = grad_b[k];
            }
            (cost, grad)
        }

        pub(super) fn cost(&self, theta: &Array1<f64>) -> f64 {
            self.cost_and_grad(theta).0
        }
    }

    /// Reshapes a flat parameter vector into `K x cols`.
    pub(super) fn unflatten(theta: &Array1<f64>, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((RiskLabel::COUNT, cols), |(r, c)| theta[r * cols + c])
    }

    pub(super) fn fit_softmax(
        x: Array2<f64>,
        labels: &[RiskLabel],
        config: &TrainingConfig,
        cancel: &CancelToken,
    ) -> Result<SoftmaxFit, EstimationError> {
        let objective = Arc::new(SoftmaxObjective::new(x, labels, config.l2_penalty));
        let initial = Array1::<f64>::zeros(objective.n_params());
        let cols = objective.x.ncols() + 1;

        let objective_for_closure = objective.clone();
        let cancel_for_closure = cancel.clone();
        // A cancelled run answers with NaN, which makes BFGS bail out at once.
        let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
            if cancel_for_closure.is_cancelled() {
                return (f64::NAN, Array1::from_elem(theta.len(), f64::NAN));
            }
            objective_for_closure.cost_and_grad(theta)
        };

        let (theta, iterations, final_cost) = match Bfgs::new(initial.clone(), cost_and_grad)
            .with_tolerance(config.tolerance)
            .with_max_iterations(config.max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) => {
                log::debug!("BFGS converged in {iterations} iterations, cost {final_value:.6}");
                (final_point, iterations, final_value)
            }
            Err(_) if cancel.is_cancelled() => return Err(EstimationError::Cancelled),
            Err(e) => {
                log::warn!("BFGS failed ({e:?}); continuing with gradient descent");
                gradient_descent(&objective, initial, config, cancel)
            }
        };
        if cancel.is_cancelled() {
            log::debug!("Training cancelled after {iterations} iterations");
            return Err(EstimationError::Cancelled);
        }

        if theta.iter().any(|v| !v.is_finite()) || !final_cost.is_finite() {
            return Err(EstimationError::OptimizationFailed(
                "non-finite coefficients".to_string(),
            ));
        }

        Ok(SoftmaxFit {
            weights: unflatten(&theta, cols),
            iterations,
            final_cost,
        })
    }

    /// Backtracking (Armijo) gradient descent. Always returns its best point;
    /// stops early once `cancel` is set.
    pub(super) fn gradient_descent(
        objective: &SoftmaxObjective,
        mut theta: Array1<f64>,
        config: &TrainingConfig,
        cancel: &CancelToken,
    ) -> (Array1<f64>, usize, f64) {
        let (mut cost, mut grad) = objective.cost_and_grad(&theta);
        let mut iterations = 0;

        while iterations < config.max_iterations && !cancel.is_cancelled() {
            let grad_sq = grad.dot(&grad);
            if grad_sq.sqrt() <= config.tolerance {
                break;
            }
            iterations += 1;

            let mut step = 1.0;
            let mut accepted = false;
            while step > 1e-12 {
                let candidate = &theta - &(&grad * step);
                let candidate_cost = objective.cost(&candidate);
                if candidate_cost <= cost - 1e-4 * step * grad_sq {
                    theta = candidate;
                    accepted = true;
                    break;
                }
                step *= 0.5;
            }
            if !accepted {
                break;
            }
            (cost, grad) = objective.cost_and_grad(&theta);
        }

        log::debug!("Gradient descent stopped after {iterations} iterations, cost {cost:.6}");
        (theta, iterations, cost)
    }
}
