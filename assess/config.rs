//! Tunable parameters for the rule engine and the learned model.
//!
//! Every field has a default, so an empty (or absent) TOML file yields the
//! documented behaviour:
//!
//! ```toml
//! [rules]
//! medium_threshold = 5.0          # score above this is High
//! default_ingredient_weight = 3.0 # used when an entry carries no severity
//! high_bmi_threshold = 30.0
//! diet_mismatch_weight = 1.0
//!
//! [training]
//! holdout_fraction = 0.2
//! seed = 42
//! time_budget_ms = 30000
//! max_iterations = 500
//! tolerance = 1e-6
//! l2_penalty = 1e-3
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessConfig {
    pub rules: RuleConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Upper bound (inclusive) of the Medium band. Scores above it are High.
    pub medium_threshold: f64,
    /// Severity applied when an ingredient entry has none, or is missing
    /// entirely in an allergen match.
    pub default_ingredient_weight: f64,
    pub high_bmi_threshold: f64,
    pub diet_mismatch_weight: f64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            medium_threshold: 5.0,
            default_ingredient_weight: 3.0,
            high_bmi_threshold: 30.0,
            diet_mismatch_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Fraction of each class held out for evaluation.
    pub holdout_fraction: f64,
    pub seed: u64,
    /// Wall-clock budget for a single training run. Zero disables the budget.
    pub time_budget_ms: u64,
    pub max_iterations: usize,
    /// Gradient-norm tolerance passed to BFGS.
    pub tolerance: f64,
    /// Ridge penalty on the non-bias weights.
    pub l2_penalty: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.2,
            seed: 42,
            time_budget_ms: 30_000,
            max_iterations: 500,
            tolerance: 1e-6,
            l2_penalty: 1e-3,
        }
    }
}

impl TrainingConfig {
    pub fn time_budget(&self) -> Option<Duration> {
        (self.time_budget_ms > 0).then(|| Duration::from_millis(self.time_budget_ms))
    }
}

impl AssessConfig {
    /// Loads a configuration from a TOML file and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("expected a finite, non-negative number, found {value}"),
                });
            }
            Ok(())
        }

        non_negative("rules.medium_threshold", self.rules.medium_threshold)?;
        non_negative(
            "rules.default_ingredient_weight",
            self.rules.default_ingredient_weight,
        )?;
        non_negative("rules.high_bmi_threshold", self.rules.high_bmi_threshold)?;
        non_negative("rules.diet_mismatch_weight", self.rules.diet_mismatch_weight)?;
        non_negative("training.l2_penalty", self.training.l2_penalty)?;
        non_negative("training.tolerance", self.training.tolerance)?;

        let holdout = self.training.holdout_fraction;
        if !(0.0..1.0).contains(&holdout) {
            return Err(ConfigError::InvalidValue {
                field: "training.holdout_fraction",
                reason: format!("expected a value in [0, 1), found {holdout}"),
            });
        }
        if self.training.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "training.max_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// Floats are hashed by bit pattern; the cache only needs equality of identical settings.
impl Hash for AssessConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let rules = &self.rules;
        for value in [
            rules.medium_threshold,
            rules.default_ingredient_weight,
            rules.high_bmi_threshold,
            rules.diet_mismatch_weight,
        ] {
            value.to_bits().hash(state);
        }
        let training = &self.training;
        training.holdout_fraction.to_bits().hash(state);
        training.seed.hash(state);
        training.time_budget_ms.hash(state);
        training.max_iterations.hash(state);
        training.tolerance.to_bits().hash(state);
        training.l2_penalty.to_bits().hash(state);
    }
}
