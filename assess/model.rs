use crate::encode::{EncodingError, FeatureEncoder, Vocabulary};
use crate::estimate::TrainingMetrics;
use crate::types::{RiskLabel, RiskTable, Trend, UserProfile};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// The trained model is saved as human-readable TOML. Everything needed to encode
// new pairs and score them travels with the file.

/// A fitted softmax classifier over {Safe, Medium, High}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    /// Class order of the weight rows.
    pub classes: Vec<RiskLabel>,
    /// Canonical feature order, one name per weight column (bias excluded).
    pub feature_names: Vec<String>,
    /// The encoding the model was trained under. Prediction must reuse it.
    pub vocabulary: Vocabulary,
    /// `K x (d + 1)`; the last column of each row is that class's bias.
    pub weights: Array2<f64>,
    pub metrics: TrainingMetrics,
}

/// The learned model's verdict for one feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: RiskLabel,
    /// Probability of `label`, in (0, 1].
    pub confidence: f64,
    /// Per-class probabilities indexed by [`RiskLabel::index`].
    pub probabilities: [f64; RiskLabel::COUNT],
}

/// A comprehensive error type for all operations related to a trained model.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(
        "Feature count mismatch: the model expects {expected} features, but the input has {found}."
    )]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error(
        "Malformed model: weight matrix is {rows}x{cols}, expected {expected_rows}x{expected_cols}."
    )]
    MalformedWeights {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("Malformed model: class rows are {found:?}, expected [Safe, Medium, High].")]
    UnexpectedClassOrder { found: Vec<RiskLabel> },
    #[error("Failed to encode the pair for prediction: {0}")]
    EncodingError(#[from] EncodingError),
}

/// Row-wise softmax, shifted by the row maximum for numerical stability.
pub(crate) fn softmax_rows(mut logits: Array2<f64>) -> Array2<f64> {
    for mut row in logits.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row /= total;
    }
    logits
}

impl TrainedModel {
    /// Wraps freshly fitted weights. Metrics are filled in by the trainer.
    pub fn new(vocabulary: Vocabulary, weights: Array2<f64>) -> Self {
        Self {
            classes: RiskLabel::ALL.to_vec(),
            feature_names: vocabulary.feature_names(),
            vocabulary,
            weights,
            metrics: TrainingMetrics::default(),
        }
    }

    /// Number of features the model expects.
    pub fn width(&self) -> usize {
        self.feature_names.len()
    }

    /// An encoder that reproduces the training-time encoding.
    pub fn encoder<'a>(&'a self, risk_table: &'a RiskTable) -> FeatureEncoder<'a> {
        FeatureEncoder::new(&self.vocabulary, risk_table)
    }

    /// Scores a single encoded vector.
    pub fn predict(&self, features: ArrayView1<f64>) -> Result<Prediction, ModelError> {
        let x = features.insert_axis(Axis(0));
        let mut predictions = self.predict_batch(x)?;
        // predict_batch returns exactly one prediction per input row.
        Ok(predictions.remove(0))
    }

    /// Scores every row of `x`.
    pub fn predict_batch(&self, x: ArrayView2<f64>) -> Result<Vec<Prediction>, ModelError> {
        if x.ncols() != self.width() {
            return Err(ModelError::MismatchedFeatureCount {
                found: x.ncols(),
                expected: self.width(),
            });
        }
        let d = self.width();
        let weights = self.weights.slice(s![.., ..d]);
        let bias = self.weights.column(d);

        let mut logits = x.dot(&weights.t());
        logits += &bias;
        let probs = softmax_rows(logits);

        Ok(probs
            .axis_iter(Axis(0))
            .map(|row| {
                let mut probabilities = [0.0; RiskLabel::COUNT];
                for (slot, p) in probabilities.iter_mut().zip(row.iter()) {
                    *slot = *p;
                }
                // Ties resolve towards the more severe class.
                let (best, confidence) = probabilities
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |(bi, bp), (i, p)| {
                        if p >= bp { (i, p) } else { (bi, bp) }
                    });
                Prediction {
                    label: self.classes[best],
                    confidence,
                    probabilities,
                }
            })
            .collect())
    }

    /// Encodes a raw pair under the saved vocabulary and scores it.
    pub fn predict_pair(
        &self,
        user: &UserProfile,
        trend: &Trend,
        risk_table: &RiskTable,
    ) -> Result<Prediction, ModelError> {
        let features: Array1<f64> = self.encoder(risk_table).encode(user, trend)?;
        self.predict(features.view())
    }

    fn validate(&self) -> Result<(), ModelError> {
        let expected_rows = RiskLabel::COUNT;
        let expected_cols = self.width() + 1;
        let (rows, cols) = self.weights.dim();
        if rows != expected_rows
            || cols != expected_cols
            || self.vocabulary.width() != self.width()
        {
            return Err(ModelError::MalformedWeights {
                rows,
                cols,
                expected_rows,
                expected_cols,
            });
        }
        // Probabilities are indexed by `RiskLabel::index`, so the rows must be too.
        if self.classes != RiskLabel::ALL {
            return Err(ModelError::UnexpectedClassOrder {
                found: self.classes.clone(),
            });
        }
        Ok(())
    }

    /// Saves the model to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained model from a TOML file and checks its shape.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.validate()?;
        Ok(model)
    }
}
