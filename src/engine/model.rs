use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::features::{
    FEATURE_COUNT, Feature, FeatureVector, NormalizationBounds, RawFeatures, normalize,
};
use crate::engine::training::{self, MIN_EXAMPLES, RETRAIN_EVERY, TrainingExample, TrainingParams};

// Deviation and capacity priors penalize the raw value. They are stored
// against the inverted term, which is why they read positive here.
const SEED_WEIGHTS: [(Feature, f64); FEATURE_COUNT] = [
    (Feature::RouteDeviation, 1.2),
    (Feature::TimeOverlap, 1.0),
    (Feature::Rating, 0.8),
    (Feature::WeightRatio, 0.5),
    (Feature::SizeRatio, 0.5),
    (Feature::Utilization, 0.4),
    (Feature::Experience, 0.3),
    (Feature::DistanceToPickup, 0.6),
    (Feature::TripDistance, 0.2),
    (Feature::TimeOfDay, 0.0),
    (Feature::DayOfWeek, 0.0),
    (Feature::SpecialRequirements, -0.2),
];
const SEED_INTERCEPT: f64 = -2.0;

/// One immutable set of weights. Published as a whole; never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSnapshot {
    pub version: u64,
    pub weights: [f64; FEATURE_COUNT],
    pub intercept: f64,
    pub bounds: NormalizationBounds,
    pub trained_examples: usize,
    pub validation_accuracy: Option<f64>,
}

impl ModelSnapshot {
    pub fn seed() -> Self {
        let mut weights = [0.0; FEATURE_COUNT];
        for (feature, weight) in SEED_WEIGHTS {
            weights[feature.index()] = weight;
        }

        Self {
            version: 0,
            weights,
            intercept: SEED_INTERCEPT,
            bounds: NormalizationBounds::seeded(),
            trained_examples: 0,
            validation_accuracy: None,
        }
    }

    pub fn weight(&self, feature: Feature) -> f64 {
        self.weights[feature.index()]
    }

    pub fn logit(&self, features: &FeatureVector) -> f64 {
        Feature::ALL.iter().fold(self.intercept, |acc, feature| {
            acc + self.weight(*feature) * features.term(*feature)
        })
    }

    pub fn predict(&self, features: &FeatureVector) -> f64 {
        sigmoid(self.logit(features))
    }

    pub fn is_finite(&self) -> bool {
        self.intercept.is_finite() && self.weights.iter().all(|w| w.is_finite())
    }
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[derive(Debug, Default)]
struct TrainingSet {
    examples: VecDeque<TrainingExample>,
    since_last_train: usize,
    trained: bool,
    requested: bool,
}

/// The live predictor plus the examples it learns from.
pub struct ScoringModel {
    live: ArcSwap<ModelSnapshot>,
    seed: Arc<ModelSnapshot>,
    training: Mutex<TrainingSet>,
    max_examples: usize,
}

impl ScoringModel {
    pub fn new(max_examples: usize) -> Self {
        let seed = Arc::new(ModelSnapshot::seed());

        Self {
            live: ArcSwap::new(seed.clone()),
            seed,
            training: Mutex::new(TrainingSet::default()),
            max_examples: max_examples.max(MIN_EXAMPLES),
        }
    }

    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.live.load_full()
    }

    /// Replaces the live weights in one step.
    pub fn publish(&self, snapshot: ModelSnapshot) {
        self.live.store(Arc::new(snapshot));
    }

    /// Probability that the pair works out, with the features it was computed
    /// from. Falls back to the seed weights if the live snapshot misbehaves.
    pub fn score(&self, raw: &RawFeatures) -> (f64, FeatureVector) {
        let live = self.live.load();
        let features = normalize(raw, &live.bounds);
        let probability = live.predict(&features);
        if probability.is_finite() {
            return (probability.clamp(0.0, 1.0), features);
        }

        warn!(version = live.version, "live model produced a non-finite score; using seed weights");
        let features = normalize(raw, &self.seed.bounds);
        let probability = self.seed.predict(&features);
        let probability = if probability.is_finite() { probability } else { 0.0 };
        (probability.clamp(0.0, 1.0), features)
    }

    pub fn example_count(&self) -> usize {
        self.lock_training().examples.len()
    }

    pub fn examples(&self) -> Vec<TrainingExample> {
        self.lock_training().examples.iter().cloned().collect()
    }

    /// Stores an outcome. Returns true when this example makes a retrain due
    /// and no other retrain is already queued; the caller then owns the request.
    pub fn record(&self, example: TrainingExample) -> bool {
        let mut set = self.lock_training();

        if set.examples.len() >= self.max_examples {
            set.examples.pop_front();
        }
        set.examples.push_back(example);
        set.since_last_train += 1;

        let due = if set.trained {
            set.since_last_train >= RETRAIN_EVERY
        } else {
            set.examples.len() >= MIN_EXAMPLES
        };

        if due && !set.requested {
            set.requested = true;
            return true;
        }

        false
    }

    /// Forgets an outstanding retrain request, e.g. when it could not be queued.
    pub fn release_request(&self) {
        self.lock_training().requested = false;
    }

    /// Runs a full training pass over the current examples and publishes the
    /// winning snapshot. Returns `None` when there is not enough data.
    pub fn retrain<R: Rng + ?Sized>(
        &self,
        params: &TrainingParams,
        rng: &mut R,
    ) -> Option<Arc<ModelSnapshot>> {
        let examples: Vec<TrainingExample> = {
            let mut set = self.lock_training();
            set.requested = false;
            if set.examples.len() < MIN_EXAMPLES {
                debug!(examples = set.examples.len(), "not enough examples to train");
                return None;
            }
            set.since_last_train = 0;
            set.trained = true;
            set.examples.iter().cloned().collect()
        };

        let current = self.snapshot();
        let next = Arc::new(training::train(&examples, &current, params, rng)?);
        self.live.store(next.clone());
        Some(next)
    }

    fn lock_training(&self) -> MutexGuard<'_, TrainingSet> {
        self.training
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
