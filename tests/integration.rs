use std::sync::{Arc, Barrier};
use std::thread;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parcel_match::config::EngineSettings;
use parcel_match::engine::assignment::run_batch_matching;
use parcel_match::engine::effects::{Collaborators, MatchStore, run_side_effects};
use parcel_match::engine::features::Feature;
use parcel_match::engine::lifecycle::{
    CancelMatch, CompleteMatch, ProposeMatch, accept_match, cancel_match, complete_match,
    get_match, list_matches, propose_match, reject_match, verify_pickup,
};
use parcel_match::engine::ranking::{find_matches_for_carrier, find_matches_for_package};
use parcel_match::engine::registry::{
    add_carrier, add_package, get_carrier, get_package, remove_carrier, remove_package,
    set_carrier_active, update_carrier_location,
};
use parcel_match::engine::training::run_training_worker;
use parcel_match::error::AppError;
use parcel_match::models::carrier::{Carrier, Route, VehicleCapacity};
use parcel_match::models::matching::{ActorRole, Match, MatchOrigin, MatchStatus};
use parcel_match::models::package::{Package, PackageStatus, Urgency};
use parcel_match::models::{GeoPoint, TimeWindow};
use parcel_match::requests::FindMatchesQuery;
use parcel_match::state::{AppState, QueueSizes, WorkerChannels};
use tokio_stream::StreamExt;
use uuid::Uuid;

fn setup() -> (Arc<AppState>, WorkerChannels) {
    setup_with(EngineSettings::default())
}

fn setup_with(settings: EngineSettings) -> (Arc<AppState>, WorkerChannels) {
    let (state, channels) = AppState::new(settings, QueueSizes::default());
    (Arc::new(state), channels)
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 3, 4, hour, 0, 0).unwrap()
}

fn carrier(max_packages: u32) -> Carrier {
    Carrier {
        id: Uuid::new_v4(),
        name: "Route Rita".to_string(),
        capacity: VehicleCapacity {
            max_weight: 50.0,
            max_size: 100.0,
            max_packages,
        },
        has_refrigeration: false,
        rating: 4.5,
        rating_count: 10,
        completed_deliveries: 20,
        route: Route {
            id: Some(Uuid::new_v4()),
            origin: GeoPoint::new(0.0, 0.0),
            destination: GeoPoint::new(1.0, 1.0),
        },
        availability: TimeWindow::new(at(9), at(13)),
        location: GeoPoint::new(0.0, 0.0),
        active: true,
        accepted_matches: 0,
        open_offers: 0,
        updated_at: Utc::now(),
    }
}

fn package_at(pickup: GeoPoint, delivery: GeoPoint) -> Package {
    Package {
        id: Uuid::new_v4(),
        sender_id: Uuid::new_v4(),
        pickup,
        delivery,
        weight_kg: 5.0,
        size: 20.0,
        fragile: false,
        requires_signature: false,
        requires_refrigeration: false,
        urgency: Urgency::Low,
        pickup_window: TimeWindow::new(at(10), at(11)),
        delivery_window: TimeWindow::new(at(11), at(12)),
        status: PackageStatus::Created,
        active_match: None,
        assigned_carrier: None,
        picked_up_at: None,
        delivered_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn package() -> Package {
    package_at(GeoPoint::new(0.4, 0.4), GeoPoint::new(0.6, 0.6))
}

fn register(state: &AppState, carrier: Carrier, package: Package) -> (Carrier, Package) {
    (
        add_carrier(state, carrier).unwrap(),
        add_package(state, package).unwrap(),
    )
}

fn offer(state: &AppState, package_id: Uuid, carrier_id: Uuid) -> Match {
    propose_match(
        state,
        ProposeMatch {
            package_id,
            carrier_id,
            score: None,
            origin: MatchOrigin::Manual,
            ttl: None,
            note: None,
        },
    )
    .unwrap()
}

fn query(min_score: f64, max_results: Option<usize>) -> FindMatchesQuery {
    FindMatchesQuery {
        min_score: Some(min_score),
        max_results,
    }
}

fn cancel(match_id: Uuid, actor_id: Uuid, role: ActorRole, reason: Option<&str>) -> CancelMatch {
    CancelMatch {
        match_id,
        actor_id,
        role,
        reason: reason.map(str::to_string),
    }
}

fn delivered(m: &Match, carrier_id: Uuid) -> CompleteMatch {
    CompleteMatch {
        match_id: m.id,
        carrier_id,
        successful: true,
        delivery_code: Some(m.delivery_code.clone()),
        completion_minutes: Some(42.0),
        customer_rating: Some(5.0),
    }
}

#[test]
fn scenario_a_compatible_pair_is_ranked_and_offered() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(2), package());

    let ranked = find_matches_for_package(&state, p.id, &query(0.6, None)).unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].carrier_id, c.id);
    assert!(ranked[0].score >= 0.6);
    assert!(ranked[0].detour_km < 1.0);

    let m = offer(&state, p.id, c.id);
    assert_eq!(m.status, MatchStatus::Pending);
    assert_eq!(m.pickup_code.len(), 6);
    assert!(m.pickup_code.chars().all(|ch| ch.is_ascii_digit()));
    assert_eq!(m.delivery_code.len(), 6);
    assert_eq!(m.route_id, c.route.id);
    assert!((0.0..=1.0).contains(&m.score));
    assert!(m.expires_at > m.created_at);
    assert!(m.payout >= 50.0);

    let p = get_package(&state, p.id).unwrap();
    assert_eq!(p.active_match, Some(m.id));
    assert_eq!(get_carrier(&state, c.id).unwrap().open_offers, 1);
}

#[test]
fn scenario_b_single_slot_goes_to_the_better_package() {
    let (state, _channels) = setup();
    let c = add_carrier(&state, carrier(1)).unwrap();
    let x = add_package(&state, package()).unwrap();
    let y = add_package(
        &state,
        package_at(GeoPoint::new(0.9, 0.1), GeoPoint::new(0.1, 0.9)),
    )
    .unwrap();

    let ranked = find_matches_for_carrier(&state, c.id, &query(0.0, None)).unwrap();
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].package_id, x.id);
    assert!(ranked[0].score > ranked[1].score);

    let matches = run_batch_matching(&state).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].package_id, x.id);
    assert_eq!(matches[0].origin, MatchOrigin::Batch);

    assert!(get_package(&state, y.id).unwrap().is_matchable());
    assert!(run_batch_matching(&state).unwrap().is_empty());
}

#[test]
fn scenario_c_refrigerated_package_never_ranks() {
    let (state, _channels) = setup();
    let mut cold = package();
    cold.requires_refrigeration = true;
    let (c, p) = register(&state, carrier(3), cold);

    assert!(find_matches_for_package(&state, p.id, &query(0.0, None)).unwrap().is_empty());
    assert!(find_matches_for_carrier(&state, c.id, &query(0.0, None)).unwrap().is_empty());
    assert!(run_batch_matching(&state).unwrap().is_empty());

    let err = propose_match(
        &state,
        ProposeMatch {
            package_id: p.id,
            carrier_id: c.id,
            score: Some(99.0),
            origin: MatchOrigin::Manual,
            ttl: None,
            note: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[test]
fn scenario_d_concurrent_accepts_resolve_to_one_winner() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(2), package());
    let m = offer(&state, p.id, c.id);

    let barrier = Arc::new(Barrier::new(2));
    let results: Vec<Result<Match, AppError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                let state = &state;
                scope.spawn(move || {
                    barrier.wait();
                    accept_match(state, m.id, c.id)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::Conflict(_))))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(conflicts, 1);

    let c = get_carrier(&state, c.id).unwrap();
    assert_eq!(c.accepted_matches, 1);
    assert_eq!(c.open_offers, 0);
    assert_eq!(get_package(&state, p.id).unwrap().status, PackageStatus::Scheduled);
}

#[test]
fn gate_failures_never_appear_in_ranked_output() {
    let (state, _channels) = setup();
    let c = add_carrier(&state, carrier(5)).unwrap();

    let mut heavy = package();
    heavy.weight_kg = 80.0;
    let mut bulky = package();
    bulky.size = 150.0;
    let mut night = package();
    night.pickup_window = TimeWindow::new(at(20), at(21));
    night.delivery_window = TimeWindow::new(at(21), at(22));
    let fine = package();

    let excluded: Vec<Uuid> = [heavy, bulky, night]
        .into_iter()
        .map(|p| add_package(&state, p).unwrap().id)
        .collect();
    let fine = add_package(&state, fine).unwrap();

    let ranked = find_matches_for_carrier(&state, c.id, &query(0.0, None)).unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].package_id, fine.id);

    let matches = run_batch_matching(&state).unwrap();
    assert!(matches.iter().all(|m| !excluded.contains(&m.package_id)));
}

#[test]
fn batch_output_respects_uniqueness_and_capacity() {
    let (state, _channels) = setup();
    let carriers: Vec<Carrier> = (0..2)
        .map(|_| add_carrier(&state, carrier(2)).unwrap())
        .collect();
    for i in 0..5 {
        let offset = i as f64 * 0.05;
        add_package(
            &state,
            package_at(
                GeoPoint::new(0.3 + offset, 0.3 + offset),
                GeoPoint::new(0.7, 0.7),
            ),
        )
        .unwrap();
    }

    let matches = run_batch_matching(&state).unwrap();
    assert_eq!(matches.len(), 4);

    let mut packages: Vec<Uuid> = matches.iter().map(|m| m.package_id).collect();
    packages.sort();
    packages.dedup();
    assert_eq!(packages.len(), matches.len());

    for c in &carriers {
        let assigned = matches.iter().filter(|m| m.carrier_id == c.id).count();
        assert!(assigned <= 2);
        assert_eq!(get_carrier(&state, c.id).unwrap().open_offers as usize, assigned);
    }

    // Every slot is held by an open offer now.
    assert!(run_batch_matching(&state).unwrap().is_empty());
}

#[test]
fn single_sided_ranking_honours_threshold_and_limit() {
    let (state, _channels) = setup();
    let p = add_package(&state, package()).unwrap();
    for _ in 0..4 {
        add_carrier(&state, carrier(1)).unwrap();
    }

    assert_eq!(find_matches_for_package(&state, p.id, &query(0.0, Some(2))).unwrap().len(), 2);
    assert!(find_matches_for_package(&state, p.id, &query(1.0, None)).unwrap().is_empty());
    assert!(matches!(
        find_matches_for_package(&state, p.id, &query(1.5, None)),
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        find_matches_for_package(&state, Uuid::new_v4(), &query(0.6, None)),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn inactive_carriers_drop_out_until_reactivated() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());

    set_carrier_active(&state, c.id, false).unwrap();
    assert!(find_matches_for_package(&state, p.id, &query(0.0, None)).unwrap().is_empty());
    assert!(matches!(
        find_matches_for_carrier(&state, c.id, &query(0.0, None)),
        Err(AppError::Conflict(_))
    ));
    assert!(run_batch_matching(&state).unwrap().is_empty());

    set_carrier_active(&state, c.id, true).unwrap();
    let near = find_matches_for_package(&state, p.id, &query(0.0, None)).unwrap()[0].score;

    update_carrier_location(&state, c.id, GeoPoint::new(-0.8, -0.8)).unwrap();
    let far = find_matches_for_package(&state, p.id, &query(0.0, None)).unwrap()[0].score;
    assert!(far < near);

    assert!(matches!(
        update_carrier_location(&state, c.id, GeoPoint::new(120.0, 0.0)),
        Err(AppError::Validation(_))
    ));
}

#[test]
fn expired_offer_is_reported_on_read_and_cannot_be_accepted() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = propose_match(
        &state,
        ProposeMatch {
            package_id: p.id,
            carrier_id: c.id,
            score: None,
            origin: MatchOrigin::Batch,
            ttl: Some(Duration::milliseconds(10)),
            note: None,
        },
    )
    .unwrap();
    thread::sleep(std::time::Duration::from_millis(30));

    let read = get_match(&state, m.id).unwrap();
    assert_eq!(read.status, MatchStatus::Expired);
    assert_eq!(read.expires_at, m.expires_at);
    assert!(get_package(&state, p.id).unwrap().is_matchable());
    assert_eq!(get_carrier(&state, c.id).unwrap().open_offers, 0);

    assert!(matches!(
        accept_match(&state, m.id, c.id),
        Err(AppError::Conflict(_))
    ));
    assert_eq!(get_match(&state, m.id).unwrap().status, MatchStatus::Expired);
}

#[test]
fn accepting_an_overdue_offer_forces_expiry() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = propose_match(
        &state,
        ProposeMatch {
            package_id: p.id,
            carrier_id: c.id,
            score: None,
            origin: MatchOrigin::Manual,
            ttl: Some(Duration::milliseconds(10)),
            note: None,
        },
    )
    .unwrap();
    thread::sleep(std::time::Duration::from_millis(30));

    assert!(matches!(
        accept_match(&state, m.id, c.id),
        Err(AppError::Expired(_))
    ));
    assert_eq!(get_match(&state, m.id).unwrap().status, MatchStatus::Expired);
}

#[test]
fn full_lifecycle_completes_exactly_once() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);

    let accepted = accept_match(&state, m.id, c.id).unwrap();
    assert_eq!(accepted.status, MatchStatus::Accepted);
    assert!(accepted.response_time_ms.is_some());

    // Delivery cannot be confirmed before pickup.
    assert!(matches!(
        complete_match(&state, delivered(&m, c.id)),
        Err(AppError::Conflict(_))
    ));

    let wrong = if m.pickup_code == "000000" { "000001" } else { "000000" };
    assert!(matches!(
        verify_pickup(&state, m.id, wrong),
        Err(AppError::BadRequest(_))
    ));
    assert_eq!(get_package(&state, p.id).unwrap().status, PackageStatus::Scheduled);

    let picked = verify_pickup(&state, m.id, &m.pickup_code).unwrap();
    assert_eq!(picked.status, MatchStatus::Accepted);
    assert_eq!(get_package(&state, p.id).unwrap().status, PackageStatus::InTransit);

    let mut bad_code = delivered(&m, c.id);
    bad_code.delivery_code = Some(if m.delivery_code == "999999" { "999998" } else { "999999" }.to_string());
    assert!(matches!(
        complete_match(&state, bad_code),
        Err(AppError::BadRequest(_))
    ));

    let done = complete_match(&state, delivered(&m, c.id)).unwrap();
    assert_eq!(done.status, MatchStatus::Completed);
    assert_eq!(done.successful, Some(true));

    let package = get_package(&state, p.id).unwrap();
    assert_eq!(package.status, PackageStatus::Delivered);
    assert!(package.delivered_at.is_some());

    let after_first = get_carrier(&state, c.id).unwrap();
    assert_eq!(after_first.completed_deliveries, 21);
    assert_eq!(after_first.accepted_matches, 0);
    assert!(after_first.rating > 4.5);

    assert!(matches!(
        complete_match(&state, delivered(&m, c.id)),
        Err(AppError::Conflict(_))
    ));
    let after_second = get_carrier(&state, c.id).unwrap();
    assert_eq!(after_second.completed_deliveries, 21);
    assert_eq!(after_second.rating_count, after_first.rating_count);
    assert_eq!(state.model.example_count(), 1);
}

#[test]
fn failed_delivery_marks_package_failed() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);
    accept_match(&state, m.id, c.id).unwrap();

    let done = complete_match(
        &state,
        CompleteMatch {
            match_id: m.id,
            carrier_id: c.id,
            successful: false,
            delivery_code: None,
            completion_minutes: None,
            customer_rating: None,
        },
    )
    .unwrap();

    assert_eq!(done.successful, Some(false));
    assert_eq!(get_package(&state, p.id).unwrap().status, PackageStatus::Failed);
    assert_eq!(get_carrier(&state, c.id).unwrap().completed_deliveries, 20);
}

#[test]
fn wrong_actor_or_state_leaves_match_untouched() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);
    let stranger = Uuid::new_v4();

    assert!(matches!(
        accept_match(&state, m.id, stranger),
        Err(AppError::Forbidden(_))
    ));
    assert!(matches!(
        cancel_match(&state, cancel(m.id, stranger, ActorRole::Sender, None)),
        Err(AppError::Forbidden(_))
    ));

    let rejected = reject_match(&state, m.id, c.id, Some("too far".to_string())).unwrap();
    assert_eq!(rejected.status, MatchStatus::Rejected);
    assert_eq!(rejected.carrier_notes.as_deref(), Some("too far"));
    assert!(get_package(&state, p.id).unwrap().is_matchable());

    for result in [
        accept_match(&state, m.id, c.id),
        reject_match(&state, m.id, c.id, Some("again".to_string())),
        cancel_match(&state, cancel(m.id, c.id, ActorRole::Carrier, None)),
    ] {
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    let unchanged = get_match(&state, m.id).unwrap();
    assert_eq!(unchanged.status, MatchStatus::Rejected);
    assert_eq!(unchanged.carrier_notes.as_deref(), Some("too far"));
    assert_eq!(unchanged.updated_at, rejected.updated_at);
}

#[test]
fn cancelling_an_accepted_match_reopens_the_package() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);
    accept_match(&state, m.id, c.id).unwrap();

    let cancelled = cancel_match(
        &state,
        cancel(m.id, p.sender_id, ActorRole::Sender, Some("plans changed")),
    )
    .unwrap();
    assert_eq!(cancelled.status, MatchStatus::Cancelled);
    assert!(cancelled.notes.iter().any(|n| n.contains("sender") && n.contains("plans changed")));

    let package = get_package(&state, p.id).unwrap();
    assert_eq!(package.status, PackageStatus::Created);
    assert!(package.assigned_carrier.is_none());
    assert_eq!(get_carrier(&state, c.id).unwrap().accepted_matches, 0);

    // A fresh offer can be made for the reopened package.
    let again = offer(&state, p.id, c.id);
    assert_eq!(again.status, MatchStatus::Pending);
    assert_ne!(again.id, m.id);
}

#[test]
fn in_transit_and_completed_matches_cannot_be_cancelled() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);
    accept_match(&state, m.id, c.id).unwrap();
    verify_pickup(&state, m.id, &m.pickup_code).unwrap();

    assert!(matches!(
        cancel_match(&state, cancel(m.id, Uuid::new_v4(), ActorRole::Admin, None)),
        Err(AppError::Conflict(_))
    ));

    complete_match(&state, delivered(&m, c.id)).unwrap();
    assert!(matches!(
        cancel_match(&state, cancel(m.id, Uuid::new_v4(), ActorRole::Admin, None)),
        Err(AppError::Conflict(_))
    ));
}

#[test]
fn a_package_holds_one_open_match_at_a_time() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(3), package());
    let other = add_carrier(&state, carrier(3)).unwrap();
    offer(&state, p.id, c.id);

    let err = propose_match(
        &state,
        ProposeMatch {
            package_id: p.id,
            carrier_id: other.id,
            score: None,
            origin: MatchOrigin::Manual,
            ttl: None,
            note: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(get_carrier(&state, other.id).unwrap().open_offers, 0);
}

#[test]
fn removing_entities_cascades_to_live_matches() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(2), package());
    let m = offer(&state, p.id, c.id);

    remove_carrier(&state, c.id).unwrap();
    assert_eq!(get_match(&state, m.id).unwrap().status, MatchStatus::Cancelled);
    assert!(get_package(&state, p.id).unwrap().is_matchable());
    assert!(matches!(get_carrier(&state, c.id), Err(AppError::NotFound(_))));

    let c2 = add_carrier(&state, carrier(2)).unwrap();
    let m2 = offer(&state, p.id, c2.id);
    accept_match(&state, m2.id, c2.id).unwrap();

    remove_package(&state, p.id).unwrap();
    assert_eq!(get_match(&state, m2.id).unwrap().status, MatchStatus::Cancelled);
    assert_eq!(get_carrier(&state, c2.id).unwrap().accepted_matches, 0);
    assert!(matches!(remove_package(&state, p.id), Err(AppError::NotFound(_))));
}

#[test]
fn manual_scores_are_normalized() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = propose_match(
        &state,
        ProposeMatch {
            package_id: p.id,
            carrier_id: c.id,
            score: Some(87.0),
            origin: MatchOrigin::Manual,
            ttl: None,
            note: Some("ops override".to_string()),
        },
    )
    .unwrap();

    assert!((m.score - 0.87).abs() < 1e-9);
    assert_eq!(m.notes, vec!["ops override".to_string()]);
    assert!(m.expires_at - m.created_at >= Duration::hours(23));
}

#[test]
fn empty_query_ranks_at_the_configured_threshold() {
    let (state, _channels) = setup();
    let p = add_package(&state, package()).unwrap();
    let strong = add_carrier(&state, carrier(1)).unwrap();
    let weak = add_carrier(
        &state,
        Carrier {
            capacity: VehicleCapacity {
                max_weight: 6.0,
                max_size: 21.0,
                max_packages: 1,
            },
            rating: 0.0,
            rating_count: 0,
            completed_deliveries: 0,
            route: Route {
                id: None,
                origin: GeoPoint::new(-1.0, -1.0),
                destination: GeoPoint::new(-1.1, -1.1),
            },
            location: GeoPoint::new(-1.0, -1.0),
            ..carrier(1)
        },
    )
    .unwrap();

    let everything = find_matches_for_package(&state, p.id, &query(0.0, None)).unwrap();
    assert_eq!(everything.len(), 2);
    let weak_score = everything
        .iter()
        .find(|candidate| candidate.carrier_id == weak.id)
        .map(|candidate| candidate.score)
        .unwrap();
    assert!(weak_score < 0.6);

    let defaulted = find_matches_for_package(&state, p.id, &FindMatchesQuery::default()).unwrap();
    assert_eq!(defaulted.len(), 1);
    assert_eq!(defaulted[0].carrier_id, strong.id);
    assert!(defaulted[0].score >= 0.6);

    let for_weak = find_matches_for_carrier(&state, weak.id, &FindMatchesQuery::default()).unwrap();
    assert!(for_weak.is_empty());
}

#[test]
fn oversized_offer_ttl_is_a_validation_error() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let with_ttl = |ttl: Duration| ProposeMatch {
        package_id: p.id,
        carrier_id: c.id,
        score: None,
        origin: MatchOrigin::Manual,
        ttl: Some(ttl),
        note: None,
    };

    for ttl in [
        Duration::minutes(10_000_000_000_000),
        state.settings.max_offer_ttl + Duration::minutes(1),
    ] {
        assert!(matches!(
            propose_match(&state, with_ttl(ttl)),
            Err(AppError::Validation(_))
        ));
    }
    assert_eq!(get_carrier(&state, c.id).unwrap().open_offers, 0);
    assert!(get_package(&state, p.id).unwrap().is_matchable());
    assert!(list_matches(&state).is_empty());

    let longest = propose_match(&state, with_ttl(state.settings.max_offer_ttl)).unwrap();
    assert_eq!(longest.expires_at - longest.created_at, state.settings.max_offer_ttl);
}

#[test]
fn outcomes_are_measured_before_the_carrier_is_released() {
    let (state, _channels) = setup();
    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);
    accept_match(&state, m.id, c.id).unwrap();
    verify_pickup(&state, m.id, &m.pickup_code).unwrap();
    complete_match(&state, delivered(&m, c.id)).unwrap();

    let second = add_package(&state, package()).unwrap();
    let m2 = offer(&state, second.id, c.id);
    accept_match(&state, m2.id, c.id).unwrap();
    cancel_match(&state, cancel(m2.id, c.id, ActorRole::Carrier, None)).unwrap();

    let examples = state.model.examples();
    assert_eq!(examples.len(), 2);

    let completed = &examples[0];
    assert_eq!(completed.match_id, m.id);
    assert!(completed.label);
    assert_eq!(completed.features.get(Feature::Experience), 20.0);
    assert_eq!(completed.features.get(Feature::Utilization), 1.0);
    assert_eq!(completed.completion_minutes, Some(42.0));

    let cancelled = &examples[1];
    assert_eq!(cancelled.match_id, m2.id);
    assert!(!cancelled.label);
    assert_eq!(cancelled.features.get(Feature::Experience), 21.0);
    assert_eq!(cancelled.features.get(Feature::Utilization), 1.0);

    let carrier = get_carrier(&state, c.id).unwrap();
    assert_eq!(carrier.completed_deliveries, 21);
    assert_eq!(carrier.accepted_matches, 0);
}

#[test]
fn removing_a_carrier_fails_packages_already_on_board() {
    let (state, _channels) = setup();
    let (c, on_board) = register(&state, carrier(2), package());
    let waiting = add_package(&state, package()).unwrap();

    let carried = offer(&state, on_board.id, c.id);
    accept_match(&state, carried.id, c.id).unwrap();
    verify_pickup(&state, carried.id, &carried.pickup_code).unwrap();
    let offered = offer(&state, waiting.id, c.id);

    remove_carrier(&state, c.id).unwrap();

    let on_board = get_package(&state, on_board.id).unwrap();
    assert_eq!(on_board.status, PackageStatus::Failed);
    assert!(on_board.active_match.is_none());
    assert!(get_package(&state, waiting.id).unwrap().is_matchable());

    let matches = list_matches(&state);
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().all(|m| m.status == MatchStatus::Cancelled));
    assert!(matches.iter().any(|m| m.id == carried.id));
    assert!(matches.iter().any(|m| m.id == offered.id));
    assert_eq!(state.model.example_count(), 0);
}

#[tokio::test]
async fn outcomes_train_the_model_in_the_background() {
    let (state, channels) = setup();
    tokio::spawn(run_training_worker(state.clone(), channels.training_rx));

    let (c, p) = register(&state, carrier(1), package());
    for _ in 0..10 {
        let m = offer(&state, p.id, c.id);
        reject_match(&state, m.id, c.id, None).unwrap();
    }
    assert_eq!(state.model.example_count(), 10);

    let mut version = 0;
    for _ in 0..100 {
        version = state.model.snapshot().version;
        if version > 0 {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    }
    assert_eq!(version, 1);

    // Still a usable probability after training on all-negative outcomes.
    let ranked = find_matches_for_package(&state, p.id, &query(0.0, None)).unwrap();
    assert!((0.0..=1.0).contains(&ranked[0].score));
}

struct BrokenStore;

#[async_trait]
impl MatchStore for BrokenStore {
    async fn save_match(&self, _m: &Match) -> Result<(), AppError> {
        Err(AppError::Internal("store offline".to_string()))
    }
}

#[tokio::test]
async fn collaborator_failures_do_not_undo_transitions() {
    let settings = EngineSettings {
        collaborator_timeout_ms: 50,
        ..EngineSettings::default()
    };
    let (state, channels) = setup_with(settings);
    let collaborators = Collaborators {
        store: Arc::new(BrokenStore),
        ..Collaborators::default()
    };
    tokio::spawn(run_side_effects(state.clone(), collaborators, channels.effects_rx));

    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);
    accept_match(&state, m.id, c.id).unwrap();

    let mut failures = 0;
    for _ in 0..50 {
        failures = state
            .metrics
            .side_effect_failures_total
            .with_label_values(&["persist"])
            .get();
        if failures >= 2 {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    }

    assert_eq!(failures, 2);
    assert_eq!(get_match(&state, m.id).unwrap().status, MatchStatus::Accepted);
}

#[tokio::test]
async fn transitions_are_published_as_events() {
    let (state, _channels) = setup();
    let events = state.subscribe_events();
    tokio::pin!(events);

    let (c, p) = register(&state, carrier(1), package());
    let m = offer(&state, p.id, c.id);
    accept_match(&state, m.id, c.id).unwrap();

    let created = events.next().await.unwrap();
    assert_eq!(created.match_id, m.id);
    assert_eq!(created.from, None);
    assert_eq!(created.to, MatchStatus::Pending);

    let accepted = events.next().await.unwrap();
    assert_eq!(accepted.from, Some(MatchStatus::Pending));
    assert_eq!(accepted.to, MatchStatus::Accepted);
}
