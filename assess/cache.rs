//! Memoization of pipeline runs, keyed by a hash of the data snapshot and the
//! configuration. Nothing expires on its own: a reload calls
//! [`AssessmentCache::invalidate`].

use crate::config::AssessConfig;
use crate::data::Dataset;
use crate::model::TrainedModel;
use crate::pipeline::PipelineOutcome;
use ahash::{AHashMap, RandomState};
use std::collections::VecDeque;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

/// Fixed seeds so a snapshot hashes to the same key in every process.
const SNAPSHOT_SEEDS: [u64; 4] = [
    0x7472_656e_6477_6973,
    0x655f_7269_736b_5f31,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
];

const DEFAULT_CAPACITY: usize = 4;

/// Stable key for a (dataset, config) snapshot.
pub fn snapshot_key(dataset: &Dataset, config: &AssessConfig) -> u64 {
    let [k0, k1, k2, k3] = SNAPSHOT_SEEDS;
    let mut hasher = RandomState::with_seeds(k0, k1, k2, k3).build_hasher();
    dataset.users.hash(&mut hasher);
    dataset.trends.hash(&mut hasher);
    dataset.risk_table.hash(&mut hasher);
    config.hash(&mut hasher);
    hasher.finish()
}

/// A small LRU of finished runs plus the last model that trained successfully.
pub struct AssessmentCache {
    capacity: usize,
    outcomes: AHashMap<u64, Arc<PipelineOutcome>>,
    order: VecDeque<u64>,
    last_model: Option<Arc<TrainedModel>>,
}

impl Default for AssessmentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AssessmentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: AHashMap::new(),
            order: VecDeque::new(),
            last_model: None,
        }
    }

    pub fn get(&mut self, key: u64) -> Option<Arc<PipelineOutcome>> {
        let outcome = self.outcomes.get(&key).cloned()?;
        self.touch(key);
        Some(outcome)
    }

    pub fn insert(&mut self, key: u64, outcome: Arc<PipelineOutcome>) {
        if self.outcomes.insert(key, outcome).is_some() {
            self.touch(key);
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
        self.order.push_back(key);
    }

    fn touch(&mut self, key: u64) {
        self.order.retain(|&k| k != key);
        self.order.push_back(key);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Drops every memoized run. The last trained model survives so a retrain
    /// that fails after a reload still has something to fall back on.
    pub fn invalidate(&mut self) {
        log::debug!("Invalidating {} cached run(s)", self.outcomes.len());
        self.outcomes.clear();
        self.order.clear();
    }

    pub fn last_model(&self) -> Option<Arc<TrainedModel>> {
        self.last_model.clone()
    }

    pub fn remember_model(&mut self, model: Arc<TrainedModel>) {
        self.last_model = Some(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::RiskMatrix;
    use crate::pipeline::ModelStatus;
    use crate::estimate::EstimationError;
    use crate::test_fixtures::{sample_table, sample_trends, sample_users};

    fn dataset() -> Dataset {
        Dataset::new(sample_users(), sample_trends(), sample_table())
    }

    fn outcome(dataset: &Dataset) -> Arc<PipelineOutcome> {
        let matrix = RiskMatrix::build(
            &dataset.users,
            &dataset.trends,
            &dataset.risk_table,
            &AssessConfig::default().rules,
        );
        Arc::new(PipelineOutcome {
            matrix: Arc::new(matrix),
            model: ModelStatus::RuleOnly {
                reason: EstimationError::EmptyMatrix,
            },
            records: Vec::new(),
        })
    }

    #[test]
    fn key_is_stable_and_sensitive() {
        let data = dataset();
        let config = AssessConfig::default();
        assert_eq!(snapshot_key(&data, &config), snapshot_key(&data.clone(), &config));

        let mut changed = data.clone();
        changed.users[3].bmi = Some(31.0);
        assert_ne!(snapshot_key(&data, &config), snapshot_key(&changed, &config));

        let mut tuned = config.clone();
        tuned.rules.medium_threshold = 4.0;
        assert_ne!(snapshot_key(&data, &config), snapshot_key(&data, &tuned));
    }

    #[test]
    fn hit_then_invalidate() {
        let data = dataset();
        let key = snapshot_key(&data, &AssessConfig::default());
        let mut cache = AssessmentCache::default();
        assert!(cache.get(key).is_none());

        let stored = outcome(&data);
        cache.insert(key, stored.clone());
        let hit = cache.get(key).unwrap();
        assert!(Arc::ptr_eq(&hit, &stored));

        cache.invalidate();
        assert!(cache.is_empty());
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let data = dataset();
        let mut cache = AssessmentCache::new(2);
        cache.insert(1, outcome(&data));
        cache.insert(2, outcome(&data));
        cache.get(1);
        cache.insert(3, outcome(&data));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
    }
}
