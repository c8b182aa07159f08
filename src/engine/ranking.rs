use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::engine::features::{Feature, extract_raw};
use crate::engine::{gate, pricing};
use crate::error::AppError;
use crate::geo::travel_minutes;
use crate::models::carrier::Carrier;
use crate::models::matching::MatchCandidate;
use crate::models::package::Package;
use crate::requests::FindMatchesQuery;
use crate::state::AppState;

/// Gates, then scores one pair. Incompatible pairs never reach the model.
pub fn score_pair(state: &AppState, carrier: &Carrier, package: &Package) -> Option<MatchCandidate> {
    if let Err(reason) = gate::check(carrier, package) {
        debug!(
            carrier_id = %carrier.id,
            package_id = %package.id,
            reason = %reason,
            "pair rejected by compatibility gate"
        );
        return None;
    }

    let raw = extract_raw(carrier, package);
    let (score, features) = state.model.score(&raw);
    let detour_km = raw.get(Feature::RouteDeviation);
    let quote = pricing::quote(package, detour_km, state.settings.platform_fee_rate);

    Some(MatchCandidate {
        package_id: package.id,
        carrier_id: carrier.id,
        score,
        features,
        detour_km,
        detour_minutes: travel_minutes(detour_km),
        payout: quote.payout,
        platform_fee: quote.platform_fee,
    })
}

#[instrument(skip(state), fields(candidates))]
pub fn find_matches_for_package(
    state: &AppState,
    package_id: Uuid,
    query: &FindMatchesQuery,
) -> Result<Vec<MatchCandidate>, AppError> {
    let (min_score, max_results) = query.resolve(&state.settings);
    validate_min_score(min_score)?;

    let package = state
        .packages
        .get(&package_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("package {package_id} not found")))?;

    if !package.is_matchable() {
        return Err(AppError::Conflict(format!(
            "package {package_id} is not open for matching"
        )));
    }

    let carriers: Vec<Carrier> = state
        .carriers
        .iter()
        .filter(|entry| entry.value().can_take_offer())
        .map(|entry| entry.value().clone())
        .collect();

    let candidates = carriers
        .par_iter()
        .filter_map(|carrier| score_pair(state, carrier, &package))
        .collect();

    let ranked = rank(candidates, min_score, max_results);
    tracing::Span::current().record("candidates", ranked.len());
    Ok(ranked)
}

#[instrument(skip(state), fields(candidates))]
pub fn find_matches_for_carrier(
    state: &AppState,
    carrier_id: Uuid,
    query: &FindMatchesQuery,
) -> Result<Vec<MatchCandidate>, AppError> {
    let (min_score, max_results) = query.resolve(&state.settings);
    validate_min_score(min_score)?;

    let carrier = state
        .carriers
        .get(&carrier_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("carrier {carrier_id} not found")))?;

    if !carrier.active {
        return Err(AppError::Conflict(format!("carrier {carrier_id} is inactive")));
    }

    let packages: Vec<Package> = state
        .packages
        .iter()
        .filter(|entry| entry.value().is_matchable())
        .map(|entry| entry.value().clone())
        .collect();

    let candidates = packages
        .par_iter()
        .filter_map(|package| score_pair(state, &carrier, package))
        .collect();

    let ranked = rank(candidates, min_score, max_results);
    tracing::Span::current().record("candidates", ranked.len());
    Ok(ranked)
}

/// Drops weak candidates and orders the rest best first. Equal scores keep
/// their incoming order.
pub fn rank(
    mut candidates: Vec<MatchCandidate>,
    min_score: f64,
    max_results: Option<usize>,
) -> Vec<MatchCandidate> {
    candidates.retain(|candidate| candidate.score >= min_score);
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    if let Some(limit) = max_results {
        candidates.truncate(limit);
    }

    candidates
}

fn validate_min_score(min_score: f64) -> Result<(), AppError> {
    if !(0.0..=1.0).contains(&min_score) {
        return Err(AppError::Validation(format!(
            "min score {min_score} must be within [0, 1]"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::rank;
    use crate::engine::features::{FEATURE_COUNT, FeatureVector};
    use crate::models::matching::MatchCandidate;

    fn candidate(seed: u128, score: f64) -> MatchCandidate {
        MatchCandidate {
            package_id: Uuid::from_u128(seed),
            carrier_id: Uuid::from_u128(seed + 100),
            score,
            features: FeatureVector([0.0; FEATURE_COUNT]),
            detour_km: 0.0,
            detour_minutes: 0.0,
            payout: 50.0,
            platform_fee: 7.5,
        }
    }

    #[test]
    fn ranking_filters_sorts_and_truncates() {
        let ranked = rank(
            vec![
                candidate(1, 0.7),
                candidate(2, 0.5),
                candidate(3, 0.9),
                candidate(4, 0.8),
            ],
            0.6,
            Some(2),
        );

        let scores: Vec<f64> = ranked.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.8]);
    }

    #[test]
    fn ties_keep_discovery_order() {
        let ranked = rank(vec![candidate(1, 0.7), candidate(2, 0.7)], 0.0, None);
        assert_eq!(ranked[0].package_id, Uuid::from_u128(1));
        assert_eq!(ranked[1].package_id, Uuid::from_u128(2));
    }
}
