#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod cache;
pub mod config;
pub mod data;
pub mod encode;
pub mod estimate;
pub mod matrix;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod rules;
pub mod summary;
pub mod types;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use config::AssessConfig;
pub use data::Dataset;
pub use pipeline::RiskPipeline;
pub use rules::RuleEngine;
pub use types::{RiskAssessment, RiskLabel};
