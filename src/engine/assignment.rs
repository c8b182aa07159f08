use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::lifecycle::{self, ProposeMatch};
use crate::engine::ranking::score_pair;
use crate::error::AppError;
use crate::models::carrier::Carrier;
use crate::models::matching::{Match, MatchCandidate, MatchOrigin};
use crate::models::package::Package;
use crate::state::AppState;

/// Greedy resolution of a many-to-many score list.
///
/// Walks every pair best score first and keeps it when the package is still
/// free and the carrier has room left. Ties keep their incoming order.
pub fn greedy_assign(
    mut candidates: Vec<MatchCandidate>,
    capacity: &HashMap<Uuid, u32>,
) -> Vec<MatchCandidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut assigned_packages: HashSet<Uuid> = HashSet::new();
    let mut carrier_load: HashMap<Uuid, u32> = HashMap::new();
    let mut assignments = Vec::new();

    for candidate in candidates {
        if assigned_packages.contains(&candidate.package_id) {
            continue;
        }

        let limit = capacity.get(&candidate.carrier_id).copied().unwrap_or(0);
        let load = carrier_load.entry(candidate.carrier_id).or_insert(0);
        if *load >= limit {
            continue;
        }

        *load += 1;
        assigned_packages.insert(candidate.package_id);
        assignments.push(candidate);
    }

    assignments
}

/// Offers every open package to at most one carrier in one pass.
pub fn run_batch_matching(state: &AppState) -> Result<Vec<Match>, AppError> {
    let start = Instant::now();
    let expired = lifecycle::sweep_expired(state);

    let mut packages: Vec<Package> = state
        .packages
        .iter()
        .filter(|entry| entry.value().is_matchable())
        .map(|entry| entry.value().clone())
        .collect();
    packages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let mut carriers: Vec<Carrier> = state
        .carriers
        .iter()
        .filter(|entry| entry.value().can_take_offer())
        .map(|entry| entry.value().clone())
        .collect();
    carriers.sort_by_key(|carrier| carrier.id);

    let capacity: HashMap<Uuid, u32> = carriers
        .iter()
        .map(|carrier| (carrier.id, carrier.spare_capacity()))
        .collect();

    let min_score = state.settings.batch_min_score;
    let candidates: Vec<MatchCandidate> = packages
        .par_iter()
        .map(|package| {
            carriers
                .iter()
                .filter_map(|carrier| score_pair(state, carrier, package))
                .filter(|candidate| candidate.score >= min_score)
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();
    let scored_pairs = candidates.len();

    let mut proposed = Vec::new();
    for candidate in greedy_assign(candidates, &capacity) {
        let request = ProposeMatch {
            package_id: candidate.package_id,
            carrier_id: candidate.carrier_id,
            score: Some(candidate.score),
            origin: MatchOrigin::Batch,
            ttl: None,
            note: None,
        };

        match lifecycle::propose_match(state, request) {
            Ok(m) => proposed.push(m),
            Err(err) => warn!(
                package_id = %candidate.package_id,
                carrier_id = %candidate.carrier_id,
                error = %err,
                "batch assignment skipped"
            ),
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    state.metrics.batch_matching_seconds.observe(elapsed);

    info!(
        packages = packages.len(),
        carriers = carriers.len(),
        scored_pairs,
        expired,
        proposed = proposed.len(),
        elapsed_ms = (elapsed * 1000.0) as u64,
        "batch matching finished"
    );

    Ok(proposed)
}

pub async fn run_batch_scheduler(state: Arc<AppState>, every: Duration) {
    info!(interval_secs = every.as_secs(), "batch scheduler started");

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let run_state = state.clone();
        match tokio::task::spawn_blocking(move || run_batch_matching(&run_state)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(error = %err, "batch matching failed"),
            Err(err) => error!(error = %err, "batch matching task panicked"),
        }
    }
}
