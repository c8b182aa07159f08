use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::engine::features::{
    FEATURE_COUNT, Feature, FeatureVector, RawFeatures, extract_raw, normalize,
};
use crate::engine::model::ModelSnapshot;
use crate::models::carrier::Carrier;
use crate::models::matching::Match;
use crate::models::package::Package;
use crate::state::AppState;

pub const MIN_EXAMPLES: usize = 10;
pub const RETRAIN_EVERY: usize = 50;

const VALIDATION_SHARE: f64 = 0.2;
const EVALUATE_EVERY: usize = 10;
const DECISION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub match_id: Uuid,
    pub features: RawFeatures,
    pub label: bool,
    // Kept for later models; the linear model ignores them.
    pub completion_minutes: Option<f64>,
    pub customer_rating: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrainingParams {
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 200,
            learning_rate: 0.1,
        }
    }
}

impl From<&EngineSettings> for TrainingParams {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            epochs: settings.training_epochs,
            learning_rate: settings.learning_rate,
        }
    }
}

/// How a match ended, as far as the model is concerned.
#[derive(Debug, Clone, Copy, Default)]
pub struct Outcome {
    pub successful: bool,
    pub completion_minutes: Option<f64>,
    pub customer_rating: Option<f64>,
}

impl Outcome {
    pub fn unsuccessful() -> Self {
        Self::default()
    }
}

/// Where training feedback fetches the real entities behind a match.
pub trait EntityLookup {
    fn package(&self, id: Uuid) -> Option<Package>;
    fn carrier(&self, id: Uuid) -> Option<Carrier>;
}

pub fn example_for<L: EntityLookup + ?Sized>(
    lookup: &L,
    m: &Match,
    outcome: Outcome,
) -> Option<TrainingExample> {
    let package = lookup.package(m.package_id)?;
    let carrier = lookup.carrier(m.carrier_id)?;

    Some(TrainingExample {
        match_id: m.id,
        features: extract_raw(&carrier, &package),
        label: outcome.successful,
        completion_minutes: outcome.completion_minutes,
        customer_rating: outcome.customer_rating,
        recorded_at: Utc::now(),
    })
}

#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub examples: usize,
    pub requested_at: DateTime<Utc>,
}

/// Feeds a terminal match back into the model and queues a retrain when one
/// becomes due.
pub fn record_outcome(state: &AppState, m: &Match, outcome: Outcome) {
    record_example(state, m.id, example_for(state, m, outcome));
}

/// Like `record_outcome`, for an example the caller captured before the
/// transition changed the carrier.
pub fn record_example(state: &AppState, match_id: Uuid, example: Option<TrainingExample>) {
    let Some(example) = example else {
        warn!(match_id = %match_id, "match entities are gone; outcome not used for training");
        return;
    };

    let due = state.model.record(example);
    let examples = state.model.example_count();
    state.metrics.training_examples.set(examples as i64);

    if !due {
        return;
    }

    let request = TrainingRequest {
        examples,
        requested_at: Utc::now(),
    };
    match state.training_tx.try_send(request) {
        Ok(()) => debug!(examples, "model retrain requested"),
        Err(err) => {
            state.model.release_request();
            warn!(error = %err, "could not queue model retrain");
        }
    }
}

pub async fn run_training_worker(state: Arc<AppState>, mut training_rx: mpsc::Receiver<TrainingRequest>) {
    info!("training worker started");

    while let Some(request) = training_rx.recv().await {
        let worker_state = state.clone();
        let params = TrainingParams::from(&state.settings);

        let result = tokio::task::spawn_blocking(move || {
            let mut rng = rand::rng();
            worker_state.model.retrain(&params, &mut rng)
        })
        .await;

        match result {
            Ok(Some(snapshot)) => {
                state
                    .metrics
                    .model_training_runs_total
                    .with_label_values(&["success"])
                    .inc();
                state.metrics.model_version.set(snapshot.version as i64);
                info!(
                    version = snapshot.version,
                    examples = snapshot.trained_examples,
                    validation_accuracy = snapshot.validation_accuracy.unwrap_or_default(),
                    queued_at = %request.requested_at,
                    "scoring model retrained"
                );
            }
            Ok(None) => {
                state
                    .metrics
                    .model_training_runs_total
                    .with_label_values(&["skipped"])
                    .inc();
                debug!(examples = request.examples, "retrain skipped");
            }
            Err(err) => {
                state.model.release_request();
                state
                    .metrics
                    .model_training_runs_total
                    .with_label_values(&["error"])
                    .inc();
                error!(error = %err, "training pass failed; keeping current weights");
            }
        }
    }

    warn!("training worker stopped: queue channel closed");
}

/// One training pass: shuffle, hold out a validation slice, run batch
/// gradient descent on the logistic loss and keep the weights that scored
/// best on the validation slice.
pub fn train<R: Rng + ?Sized>(
    examples: &[TrainingExample],
    current: &ModelSnapshot,
    params: &TrainingParams,
    rng: &mut R,
) -> Option<ModelSnapshot> {
    if examples.len() < MIN_EXAMPLES {
        return None;
    }

    let mut shuffled: Vec<&TrainingExample> = examples.iter().collect();
    shuffled.shuffle(rng);

    let total = shuffled.len();
    let validation_len = ((total as f64 * VALIDATION_SHARE).round() as usize).clamp(1, total - 1);
    let (validation, training) = shuffled.split_at(validation_len);

    let raw: Vec<RawFeatures> = examples.iter().map(|example| example.features).collect();
    let bounds = current.bounds.widen_to(&raw);

    let labelled = |set: &[&TrainingExample]| -> Vec<(FeatureVector, f64)> {
        set.iter()
            .map(|example| {
                let label = if example.label { 1.0 } else { 0.0 };
                (normalize(&example.features, &bounds), label)
            })
            .collect()
    };
    let training = labelled(training);
    let validation = labelled(validation);

    let mut candidate = ModelSnapshot {
        version: current.version + 1,
        weights: current.weights,
        intercept: current.intercept,
        bounds: bounds.clone(),
        trained_examples: total,
        validation_accuracy: None,
    };
    if !candidate.is_finite() {
        let seed = ModelSnapshot::seed();
        candidate.weights = seed.weights;
        candidate.intercept = seed.intercept;
    }

    let mut best_accuracy = accuracy(&candidate, &validation);
    let mut best = candidate.clone();

    for epoch in 1..=params.epochs {
        let mut gradient = [0.0; FEATURE_COUNT];
        let mut intercept_gradient = 0.0;

        for (features, label) in &training {
            let error = candidate.predict(features) - label;
            intercept_gradient += error;
            for feature in Feature::ALL {
                gradient[feature.index()] += error * features.term(feature);
            }
        }

        let n = training.len() as f64;
        candidate.intercept -= params.learning_rate * intercept_gradient / n;
        for (weight, grad) in candidate.weights.iter_mut().zip(gradient) {
            *weight -= params.learning_rate * grad / n;
        }

        if !candidate.is_finite() {
            warn!(epoch, "weights diverged; stopping early");
            break;
        }

        if epoch % EVALUATE_EVERY == 0 || epoch == params.epochs {
            let score = accuracy(&candidate, &validation);
            if score > best_accuracy {
                best_accuracy = score;
                best = candidate.clone();
            }
        }
    }

    best.validation_accuracy = Some(best_accuracy);
    Some(best)
}

fn accuracy(snapshot: &ModelSnapshot, set: &[(FeatureVector, f64)]) -> f64 {
    if set.is_empty() {
        return 0.0;
    }

    let correct = set
        .iter()
        .filter(|(features, label)| {
            let predicted = if snapshot.predict(features) >= DECISION_THRESHOLD {
                1.0
            } else {
                0.0
            };
            predicted == *label
        })
        .count();

    correct as f64 / set.len() as f64
}
