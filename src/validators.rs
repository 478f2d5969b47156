//! Validator sets with stake weights and copy-on-write snapshots.
//!
//! Sampling (used constantly by the bootstrap engine and the live voter)
//! operates on an immutable snapshot taken under a read lock; mutations build
//! a new snapshot and swap the pointer under the writer lock, so a slow
//! sample never blocks a weight update and vice versa.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::ids::ShortId;
use crate::sampler::{SamplerError, Weighted};

/// One validator's registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validator {
    pub node_id: ShortId,
    pub weight: u64,
    /// Unix seconds this registration becomes active.
    pub start_time: u64,
    /// Unix seconds this registration expires.
    pub end_time: u64,
}

/// Immutable view of a validator set at a point in time.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    validators: Vec<Validator>,
    by_node: HashMap<ShortId, usize>,
    total_weight: u64,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn weight(&self, node_id: &ShortId) -> u64 {
        self.by_node
            .get(node_id)
            .map(|&i| self.validators[i].weight)
            .unwrap_or(0)
    }

    pub fn contains(&self, node_id: &ShortId) -> bool {
        self.by_node.contains_key(node_id)
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Sample up to `count` distinct validators, stake-weighted. If the set
    /// is smaller than `count`, every validator is returned.
    pub fn sample<R: Rng>(&self, rng: &mut R, count: usize) -> Result<Vec<ShortId>, SamplerError> {
        let count = count.min(self.validators.len());
        let weights = self.validators.iter().map(|v| v.weight).collect();
        let picked = Weighted::new(weights).sample(rng, count)?;
        Ok(picked
            .into_iter()
            .map(|i| self.validators[i].node_id)
            .collect())
    }
}

/// A mutable validator set handing out [`Snapshot`]s.
#[derive(Debug, Default)]
pub struct ValidatorSet {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ValidatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; cheap to clone, never invalidated.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Add weight to `node_id`, registering it if absent.
    pub fn add_weight(&self, node_id: ShortId, weight: u64, start_time: u64, end_time: u64) {
        self.mutate(|validators| {
            if let Some(v) = validators.iter_mut().find(|v| v.node_id == node_id) {
                v.weight = v.weight.saturating_add(weight);
                v.end_time = v.end_time.max(end_time);
            } else {
                validators.push(Validator {
                    node_id,
                    weight,
                    start_time,
                    end_time,
                });
            }
        });
    }

    /// Remove `node_id` entirely.
    pub fn remove(&self, node_id: &ShortId) {
        self.mutate(|validators| validators.retain(|v| v.node_id != *node_id));
    }

    /// Drop registrations that have expired as of `now` (unix seconds).
    pub fn prune_expired(&self, now: u64) {
        self.mutate(|validators| validators.retain(|v| v.end_time > now));
    }

    fn mutate(&self, f: impl FnOnce(&mut Vec<Validator>)) {
        let mut guard = self.snapshot.write();
        let mut validators = guard.validators.clone();
        f(&mut validators);

        let by_node = validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.node_id, i))
            .collect();
        let total_weight = validators.iter().map(|v| v.weight).sum();
        *guard = Arc::new(Snapshot {
            validators,
            by_node,
            total_weight,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn node(b: u8) -> ShortId {
        ShortId([b; 20])
    }

    #[test]
    fn add_weight_accumulates() {
        let set = ValidatorSet::new();
        set.add_weight(node(1), 10, 0, 100);
        set.add_weight(node(1), 5, 0, 200);
        set.add_weight(node(2), 7, 0, 100);

        let snap = set.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.weight(&node(1)), 15);
        assert_eq!(snap.total_weight(), 22);
    }

    #[test]
    fn snapshot_survives_mutation() {
        let set = ValidatorSet::new();
        set.add_weight(node(1), 10, 0, 100);
        let before = set.snapshot();

        set.remove(&node(1));
        assert_eq!(before.weight(&node(1)), 10);
        assert_eq!(set.snapshot().weight(&node(1)), 0);
    }

    #[test]
    fn prune_expired_drops_old_entries() {
        let set = ValidatorSet::new();
        set.add_weight(node(1), 10, 0, 50);
        set.add_weight(node(2), 10, 0, 500);
        set.prune_expired(100);

        let snap = set.snapshot();
        assert!(!snap.contains(&node(1)));
        assert!(snap.contains(&node(2)));
    }

    #[test]
    fn sample_caps_at_population() {
        let set = ValidatorSet::new();
        set.add_weight(node(1), 1, 0, 100);
        set.add_weight(node(2), 1, 0, 100);

        let mut rng = StdRng::seed_from_u64(7);
        let sample = set.snapshot().sample(&mut rng, 10).unwrap();
        assert_eq!(sample.len(), 2);
    }
}
