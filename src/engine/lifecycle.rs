use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::one::RefMut;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::effects::{self, SideEffect};
use crate::engine::features::{Feature, extract_raw};
use crate::engine::training::{self, Outcome};
use crate::engine::{gate, pricing};
use crate::error::AppError;
use crate::geo::{haversine_km, travel_minutes};
use crate::models::matching::{
    ActorRole, Match, MatchEvent, MatchOrigin, MatchStatus, normalize_score,
};
use crate::models::package::PackageStatus;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct ProposeMatch {
    pub package_id: Uuid,
    pub carrier_id: Uuid,
    /// Pre-computed score, as a probability or a percentage. Scored by the
    /// model when absent.
    pub score: Option<f64>,
    pub origin: MatchOrigin,
    /// Overrides the origin's default offer lifetime.
    pub ttl: Option<Duration>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompleteMatch {
    pub match_id: Uuid,
    pub carrier_id: Uuid,
    pub successful: bool,
    pub delivery_code: Option<String>,
    pub completion_minutes: Option<f64>,
    pub customer_rating: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CancelMatch {
    pub match_id: Uuid,
    pub actor_id: Uuid,
    pub role: ActorRole,
    pub reason: Option<String>,
}

/// Six random digits from the thread-local CSPRNG.
fn verification_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

pub fn propose_match(state: &AppState, request: ProposeMatch) -> Result<Match, AppError> {
    if request.package_id.is_nil() || request.carrier_id.is_nil() {
        return Err(AppError::Validation(
            "package id and carrier id are required".to_string(),
        ));
    }

    let package = state
        .packages
        .get(&request.package_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("package {} not found", request.package_id)))?;
    let carrier = state
        .carriers
        .get(&request.carrier_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("carrier {} not found", request.carrier_id)))?;

    if !package.is_matchable() {
        return Err(AppError::Validation(format!(
            "package {} is not open for matching",
            package.id
        )));
    }
    if !carrier.active {
        return Err(AppError::Validation(format!("carrier {} is inactive", carrier.id)));
    }
    gate::check(&carrier, &package).map_err(|reason| {
        AppError::Validation(format!(
            "package {} cannot go with carrier {}: {reason}",
            package.id, carrier.id
        ))
    })?;

    let ttl = request.ttl.unwrap_or(match request.origin {
        MatchOrigin::Batch => state.settings.offer_ttl,
        MatchOrigin::Manual => state.settings.manual_offer_ttl,
    });
    if ttl <= Duration::zero() {
        return Err(AppError::Validation("offer ttl must be positive".to_string()));
    }
    if ttl > state.settings.max_offer_ttl {
        return Err(AppError::Validation(format!(
            "offer ttl cannot exceed {} minutes",
            state.settings.max_offer_ttl.num_minutes()
        )));
    }

    let raw = extract_raw(&carrier, &package);
    let score = match request.score {
        Some(score) => normalize_score(score),
        None => state.model.score(&raw).0,
    };

    let now = Utc::now();
    let expires_at = now
        .checked_add_signed(ttl)
        .ok_or_else(|| AppError::Validation("offer ttl is out of range".to_string()))?;
    let detour_km = raw.get(Feature::RouteDeviation);
    let quote = pricing::quote(&package, detour_km, state.settings.platform_fee_rate);
    let estimated_pickup_at = package.pickup_window.start.max(carrier.availability.start);
    let trip_minutes = travel_minutes(haversine_km(&package.pickup, &package.delivery));
    let estimated_delivery_at =
        estimated_pickup_at + Duration::milliseconds((trip_minutes * 60_000.0) as i64);

    let m = Match {
        id: Uuid::new_v4(),
        package_id: package.id,
        carrier_id: carrier.id,
        route_id: carrier.route.id,
        status: MatchStatus::Pending,
        origin: request.origin,
        score,
        detour_km,
        detour_minutes: travel_minutes(detour_km),
        estimated_pickup_at,
        estimated_delivery_at,
        expires_at,
        payout: quote.payout,
        platform_fee: quote.platform_fee,
        responded_at: None,
        response_time_ms: None,
        carrier_notes: None,
        notes: request.note.into_iter().collect(),
        pickup_code: verification_code(),
        delivery_code: verification_code(),
        successful: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };

    reserve(state, &m)?;
    state.matches.insert(m.id, m.clone());

    state
        .metrics
        .matches_proposed_total
        .with_label_values(&[m.origin.as_str()])
        .inc();
    info!(
        match_id = %m.id,
        package_id = %m.package_id,
        carrier_id = %m.carrier_id,
        score = m.score,
        origin = m.origin.as_str(),
        expires_at = %m.expires_at,
        "match proposed"
    );
    publish(state, &m, None);

    Ok(m)
}

/// Claims an offer slot on the carrier and the package's single open-match
/// slot. Either both are taken or neither is.
fn reserve(state: &AppState, m: &Match) -> Result<(), AppError> {
    {
        let mut carrier = state
            .carriers
            .get_mut(&m.carrier_id)
            .ok_or_else(|| AppError::NotFound(format!("carrier {} not found", m.carrier_id)))?;
        if !carrier.can_take_offer() {
            return Err(AppError::Conflict(format!(
                "carrier {} has no spare capacity",
                m.carrier_id
            )));
        }
        carrier.open_offers += 1;
        carrier.updated_at = m.created_at;
    }

    let claimed = match state.packages.get_mut(&m.package_id) {
        Some(mut package) if package.is_matchable() => {
            package.active_match = Some(m.id);
            package.updated_at = m.created_at;
            Ok(())
        }
        Some(_) => Err(AppError::Conflict(format!(
            "package {} already has an open match",
            m.package_id
        ))),
        None => Err(AppError::NotFound(format!("package {} not found", m.package_id))),
    };

    if claimed.is_err() {
        release_offer(state, m.carrier_id, m.created_at);
    }
    claimed
}

/// Reads a match, expiring it first if its offer ran out.
pub fn get_match(state: &AppState, match_id: Uuid) -> Result<Match, AppError> {
    let mut entry = lock_match(state, match_id)?;
    let expired = expire_if_overdue(state, &mut entry, Utc::now());
    let snapshot = entry.clone();
    drop(entry);

    if expired {
        after_terminal(state, &snapshot, MatchStatus::Pending, Outcome::unsuccessful());
    }

    Ok(snapshot)
}

pub fn list_matches(state: &AppState) -> Vec<Match> {
    sweep_expired(state);

    state
        .matches
        .iter()
        .map(|entry| entry.value().clone())
        .collect()
}

/// Touches every overdue offer so it turns Expired. Returns how many did.
pub fn sweep_expired(state: &AppState) -> usize {
    let now = Utc::now();
    let overdue: Vec<Uuid> = state
        .matches
        .iter()
        .filter(|entry| entry.value().is_overdue(now))
        .map(|entry| *entry.key())
        .collect();

    overdue
        .into_iter()
        .filter(|id| {
            matches!(get_match(state, *id), Ok(m) if m.status == MatchStatus::Expired)
        })
        .count()
}

pub fn accept_match(state: &AppState, match_id: Uuid, carrier_id: Uuid) -> Result<Match, AppError> {
    let now = Utc::now();
    let mut entry = lock_match(state, match_id)?;

    if entry.carrier_id != carrier_id {
        return Err(AppError::Forbidden(format!(
            "carrier {carrier_id} is not assigned to match {match_id}"
        )));
    }
    if expire_if_overdue(state, &mut entry, now) {
        let snapshot = entry.clone();
        drop(entry);
        after_terminal(state, &snapshot, MatchStatus::Pending, Outcome::unsuccessful());
        return Err(AppError::Expired(match_id.to_string()));
    }
    require_status(&entry, MatchStatus::Pending)?;

    {
        let mut carrier = state
            .carriers
            .get_mut(&carrier_id)
            .ok_or_else(|| AppError::NotFound(format!("carrier {carrier_id} not found")))?;
        if carrier.accepted_matches >= carrier.capacity.max_packages {
            return Err(AppError::Conflict(format!(
                "carrier {carrier_id} already carries {} packages",
                carrier.accepted_matches
            )));
        }
        carrier.accepted_matches += 1;
        carrier.open_offers = carrier.open_offers.saturating_sub(1);
        carrier.updated_at = now;
        state
            .metrics
            .observe_utilization(&carrier_id.to_string(), carrier.utilization());
    }

    if let Some(mut package) = state.packages.get_mut(&entry.package_id) {
        package.status = PackageStatus::Scheduled;
        package.assigned_carrier = Some(carrier_id);
        package.updated_at = now;
    }

    entry.status = MatchStatus::Accepted;
    entry.record_response(now);
    let snapshot = entry.clone();
    drop(entry);

    info!(
        match_id = %match_id,
        carrier_id = %carrier_id,
        response_time_ms = snapshot.response_time_ms.unwrap_or_default(),
        "match accepted"
    );
    publish(state, &snapshot, Some(MatchStatus::Pending));

    Ok(snapshot)
}

pub fn reject_match(
    state: &AppState,
    match_id: Uuid,
    carrier_id: Uuid,
    notes: Option<String>,
) -> Result<Match, AppError> {
    let now = Utc::now();
    let mut entry = lock_match(state, match_id)?;

    if entry.carrier_id != carrier_id {
        return Err(AppError::Forbidden(format!(
            "carrier {carrier_id} is not assigned to match {match_id}"
        )));
    }
    if expire_if_overdue(state, &mut entry, now) {
        let snapshot = entry.clone();
        drop(entry);
        after_terminal(state, &snapshot, MatchStatus::Pending, Outcome::unsuccessful());
        return Err(AppError::Expired(match_id.to_string()));
    }
    require_status(&entry, MatchStatus::Pending)?;

    release_offer(state, carrier_id, now);
    release_package(state, entry.package_id, match_id, now);

    entry.status = MatchStatus::Rejected;
    entry.carrier_notes = notes;
    entry.record_response(now);
    let snapshot = entry.clone();
    drop(entry);

    info!(match_id = %match_id, carrier_id = %carrier_id, "match rejected");
    after_terminal(state, &snapshot, MatchStatus::Pending, Outcome::unsuccessful());

    Ok(snapshot)
}

pub fn cancel_match(state: &AppState, request: CancelMatch) -> Result<Match, AppError> {
    let CancelMatch {
        match_id,
        actor_id,
        role,
        reason,
    } = request;
    let now = Utc::now();

    let (package_id, assigned_carrier) = state
        .matches
        .get(&match_id)
        .map(|entry| (entry.package_id, entry.carrier_id))
        .ok_or_else(|| AppError::NotFound(format!("match {match_id} not found")))?;
    let sender_id = state.packages.get(&package_id).map(|entry| entry.sender_id);

    let allowed = match role {
        ActorRole::Admin => true,
        ActorRole::Carrier => assigned_carrier == actor_id,
        ActorRole::Sender => sender_id == Some(actor_id),
    };
    if !allowed {
        return Err(AppError::Forbidden(format!(
            "{role} {actor_id} may not cancel match {match_id}"
        )));
    }

    let mut entry = lock_match(state, match_id)?;
    if expire_if_overdue(state, &mut entry, now) {
        let snapshot = entry.clone();
        drop(entry);
        after_terminal(state, &snapshot, MatchStatus::Pending, Outcome::unsuccessful());
        return Err(AppError::Expired(match_id.to_string()));
    }

    let from = entry.status;
    let example = training::example_for(state, &entry, Outcome::unsuccessful());
    match from {
        MatchStatus::Pending => {
            release_offer(state, entry.carrier_id, now);
        }
        MatchStatus::Accepted => {
            let in_transit = state
                .packages
                .get(&entry.package_id)
                .is_some_and(|package| package.status == PackageStatus::InTransit);
            if in_transit {
                return Err(AppError::Conflict(format!(
                    "package {} is already in transit",
                    entry.package_id
                )));
            }
            release_accepted(state, entry.carrier_id, now);
        }
        other => {
            return Err(AppError::Conflict(format!(
                "match {match_id} is {}, cannot cancel",
                other.as_str()
            )));
        }
    }
    release_package(state, entry.package_id, match_id, now);

    let reason = reason.unwrap_or_else(|| "no reason given".to_string());
    entry.notes.push(format!("cancelled by {role} {actor_id}: {reason}"));
    entry.status = MatchStatus::Cancelled;
    entry.updated_at = now;
    let snapshot = entry.clone();
    drop(entry);

    info!(match_id = %match_id, %role, actor_id = %actor_id, "match cancelled");
    publish(state, &snapshot, Some(from));
    training::record_example(state, match_id, example);

    Ok(snapshot)
}

/// Confirms the handoff at pickup. The match stays Accepted; the package
/// moves into transit.
pub fn verify_pickup(state: &AppState, match_id: Uuid, code: &str) -> Result<Match, AppError> {
    let now = Utc::now();
    let mut entry = lock_match(state, match_id)?;

    if expire_if_overdue(state, &mut entry, now) {
        let snapshot = entry.clone();
        drop(entry);
        after_terminal(state, &snapshot, MatchStatus::Pending, Outcome::unsuccessful());
        return Err(AppError::Expired(match_id.to_string()));
    }
    require_status(&entry, MatchStatus::Accepted)?;

    {
        let mut package = state
            .packages
            .get_mut(&entry.package_id)
            .ok_or_else(|| AppError::NotFound(format!("package {} not found", entry.package_id)))?;
        if package.status != PackageStatus::Scheduled {
            return Err(AppError::Conflict(format!(
                "package {} is not awaiting pickup",
                package.id
            )));
        }
        if code.trim() != entry.pickup_code {
            return Err(AppError::BadRequest("pickup code does not match".to_string()));
        }

        package.status = PackageStatus::InTransit;
        package.picked_up_at = Some(now);
        package.updated_at = now;
    }

    let snapshot = entry.clone();
    drop(entry);

    info!(match_id = %match_id, package_id = %snapshot.package_id, "pickup verified");
    Ok(snapshot)
}

pub fn complete_match(state: &AppState, request: CompleteMatch) -> Result<Match, AppError> {
    if let Some(rating) = request.customer_rating {
        if !rating.is_finite() || !(0.0..=5.0).contains(&rating) {
            return Err(AppError::Validation(format!(
                "customer rating {rating} must be within [0, 5]"
            )));
        }
    }
    if let Some(minutes) = request.completion_minutes {
        if !minutes.is_finite() || minutes < 0.0 {
            return Err(AppError::Validation(format!(
                "completion time {minutes} must be a non-negative number of minutes"
            )));
        }
    }

    let now = Utc::now();
    let match_id = request.match_id;
    let mut entry = lock_match(state, match_id)?;

    if entry.carrier_id != request.carrier_id {
        return Err(AppError::Forbidden(format!(
            "carrier {} is not assigned to match {match_id}",
            request.carrier_id
        )));
    }
    if expire_if_overdue(state, &mut entry, now) {
        let snapshot = entry.clone();
        drop(entry);
        after_terminal(state, &snapshot, MatchStatus::Pending, Outcome::unsuccessful());
        return Err(AppError::Expired(match_id.to_string()));
    }
    if entry.status == MatchStatus::Completed {
        return Err(AppError::Conflict(format!("match {match_id} is already completed")));
    }
    require_status(&entry, MatchStatus::Accepted)?;

    let outcome = Outcome {
        successful: request.successful,
        completion_minutes: request.completion_minutes,
        customer_rating: request.customer_rating,
    };
    // Measured before the carrier's counters move.
    let example = training::example_for(state, &entry, outcome);

    if request.successful {
        let code = request
            .delivery_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| AppError::Validation("delivery code is required".to_string()))?;

        let mut package = state
            .packages
            .get_mut(&entry.package_id)
            .ok_or_else(|| AppError::NotFound(format!("package {} not found", entry.package_id)))?;
        if package.status != PackageStatus::InTransit {
            return Err(AppError::Conflict(format!(
                "package {} has not been picked up",
                package.id
            )));
        }
        if code != entry.delivery_code {
            return Err(AppError::BadRequest("delivery code does not match".to_string()));
        }

        package.status = PackageStatus::Delivered;
        package.delivered_at = Some(now);
        package.active_match = None;
        package.updated_at = now;
    } else if let Some(mut package) = state.packages.get_mut(&entry.package_id) {
        package.status = PackageStatus::Failed;
        package.active_match = None;
        package.updated_at = now;
    }

    if let Some(mut carrier) = state.carriers.get_mut(&entry.carrier_id) {
        carrier.accepted_matches = carrier.accepted_matches.saturating_sub(1);
        if request.successful {
            carrier.completed_deliveries = carrier.completed_deliveries.saturating_add(1);
        }
        if let Some(rating) = request.customer_rating {
            carrier.record_rating(rating);
        }
        carrier.updated_at = now;
        state
            .metrics
            .observe_utilization(&carrier.id.to_string(), carrier.utilization());
    }

    entry.status = MatchStatus::Completed;
    entry.successful = Some(request.successful);
    entry.completed_at = Some(now);
    entry.updated_at = now;
    let snapshot = entry.clone();
    drop(entry);

    info!(
        match_id = %match_id,
        carrier_id = %snapshot.carrier_id,
        successful = request.successful,
        "match completed"
    );
    publish(state, &snapshot, Some(MatchStatus::Accepted));
    training::record_example(state, match_id, example);

    if request.successful {
        effects::dispatch(state, SideEffect::Payout(snapshot.clone()));
        effects::dispatch(
            state,
            SideEffect::Emissions {
                package_id: snapshot.package_id,
                carrier_id: snapshot.carrier_id,
                detour_km: snapshot.detour_km,
            },
        );
    }

    Ok(snapshot)
}

/// Cancels a live match because one of its parties left the registry. Not an
/// outcome of the carrier's work, so it is not used for training.
pub(crate) fn cancel_for_removal(state: &AppState, match_id: Uuid, reason: &str, fail_in_transit: bool) {
    let now = Utc::now();
    let Some(mut entry) = state.matches.get_mut(&match_id) else {
        return;
    };

    let from = entry.status;
    match from {
        MatchStatus::Pending => release_offer(state, entry.carrier_id, now),
        MatchStatus::Accepted => release_accepted(state, entry.carrier_id, now),
        _ => return,
    }

    if let Some(mut package) = state.packages.get_mut(&entry.package_id) {
        if package.active_match == Some(match_id) {
            if fail_in_transit && package.status == PackageStatus::InTransit {
                package.status = PackageStatus::Failed;
                package.active_match = None;
                package.updated_at = now;
            } else {
                package.release(now);
            }
        }
    }

    entry.notes.push(format!("cancelled by system: {reason}"));
    entry.status = MatchStatus::Cancelled;
    entry.updated_at = now;
    let snapshot = entry.clone();
    drop(entry);

    warn!(match_id = %match_id, reason, "match cancelled by cascade");
    publish(state, &snapshot, Some(from));
}

fn lock_match(state: &AppState, match_id: Uuid) -> Result<RefMut<'_, Uuid, Match>, AppError> {
    state
        .matches
        .get_mut(&match_id)
        .ok_or_else(|| AppError::NotFound(format!("match {match_id} not found")))
}

fn require_status(m: &Match, expected: MatchStatus) -> Result<(), AppError> {
    if m.status != expected {
        return Err(AppError::Conflict(format!(
            "match {} is {}, expected {}",
            m.id,
            m.status.as_str(),
            expected.as_str()
        )));
    }

    Ok(())
}

/// Flips an overdue offer to Expired and frees what it held. The caller
/// holds the match entry.
fn expire_if_overdue(state: &AppState, m: &mut Match, now: DateTime<Utc>) -> bool {
    if !m.is_overdue(now) {
        return false;
    }

    release_offer(state, m.carrier_id, now);
    release_package(state, m.package_id, m.id, now);
    m.status = MatchStatus::Expired;
    m.updated_at = now;

    info!(match_id = %m.id, expires_at = %m.expires_at, "match expired");
    true
}

fn release_offer(state: &AppState, carrier_id: Uuid, now: DateTime<Utc>) {
    if let Some(mut carrier) = state.carriers.get_mut(&carrier_id) {
        carrier.open_offers = carrier.open_offers.saturating_sub(1);
        carrier.updated_at = now;
    }
}

fn release_accepted(state: &AppState, carrier_id: Uuid, now: DateTime<Utc>) {
    if let Some(mut carrier) = state.carriers.get_mut(&carrier_id) {
        carrier.accepted_matches = carrier.accepted_matches.saturating_sub(1);
        carrier.updated_at = now;
        state
            .metrics
            .observe_utilization(&carrier_id.to_string(), carrier.utilization());
    }
}

fn release_package(state: &AppState, package_id: Uuid, match_id: Uuid, now: DateTime<Utc>) {
    if let Some(mut package) = state.packages.get_mut(&package_id) {
        if package.active_match == Some(match_id) {
            package.release(now);
        }
    }
}

fn publish(state: &AppState, m: &Match, from: Option<MatchStatus>) {
    state
        .metrics
        .match_transitions_total
        .with_label_values(&[m.status.as_str()])
        .inc();

    let event = MatchEvent::transition(m, from);
    let _ = state.match_events_tx.send(event.clone());
    effects::dispatch(state, SideEffect::Persist(m.clone()));
    effects::dispatch(state, SideEffect::Notify(event));
}

fn after_terminal(state: &AppState, m: &Match, from: MatchStatus, outcome: Outcome) {
    publish(state, m, Some(from));
    training::record_outcome(state, m, outcome);
}
