use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tracing::info;
use uuid::Uuid;

use crate::engine::lifecycle;
use crate::error::AppError;
use crate::models::carrier::Carrier;
use crate::models::matching::Match;
use crate::models::package::{Package, PackageStatus};
use crate::models::{GeoPoint, TimeWindow};
use crate::state::AppState;

pub fn add_package(state: &AppState, package: Package) -> Result<Package, AppError> {
    validate_package(&package)?;

    let mut package = package;
    package.status = PackageStatus::Created;
    package.active_match = None;
    package.assigned_carrier = None;
    package.updated_at = Utc::now();

    match state.packages.entry(package.id) {
        Entry::Occupied(_) => Err(AppError::Conflict(format!(
            "package {} already exists",
            package.id
        ))),
        Entry::Vacant(slot) => {
            slot.insert(package.clone());
            info!(package_id = %package.id, sender_id = %package.sender_id, "package registered");
            Ok(package)
        }
    }
}

pub fn add_carrier(state: &AppState, carrier: Carrier) -> Result<Carrier, AppError> {
    validate_carrier(&carrier)?;

    let mut carrier = carrier;
    carrier.rating = carrier.rating.clamp(0.0, 5.0);
    carrier.accepted_matches = 0;
    carrier.open_offers = 0;
    carrier.updated_at = Utc::now();

    match state.carriers.entry(carrier.id) {
        Entry::Occupied(_) => Err(AppError::Conflict(format!(
            "carrier {} already exists",
            carrier.id
        ))),
        Entry::Vacant(slot) => {
            slot.insert(carrier.clone());
            state.metrics.observe_utilization(&carrier.id.to_string(), 0.0);
            info!(carrier_id = %carrier.id, name = %carrier.name, "carrier registered");
            Ok(carrier)
        }
    }
}

/// Removes a package and cancels whatever live match it had.
pub fn remove_package(state: &AppState, package_id: Uuid) -> Result<Package, AppError> {
    if !state.packages.contains_key(&package_id) {
        return Err(AppError::NotFound(format!("package {package_id} not found")));
    }

    let live = live_matches(state, |m| m.package_id == package_id);
    for match_id in &live {
        lifecycle::cancel_for_removal(state, *match_id, "package removed", false);
    }

    let (_, package) = state
        .packages
        .remove(&package_id)
        .ok_or_else(|| AppError::NotFound(format!("package {package_id} not found")))?;

    info!(package_id = %package_id, cancelled = live.len(), "package removed");
    Ok(package)
}

/// Removes a carrier. Its live matches are cancelled; packages it had not
/// picked up go back to the open pool, packages already on board fail.
pub fn remove_carrier(state: &AppState, carrier_id: Uuid) -> Result<Carrier, AppError> {
    if !state.carriers.contains_key(&carrier_id) {
        return Err(AppError::NotFound(format!("carrier {carrier_id} not found")));
    }

    let live = live_matches(state, |m| m.carrier_id == carrier_id);
    for match_id in &live {
        lifecycle::cancel_for_removal(state, *match_id, "carrier removed", true);
    }

    let (_, carrier) = state
        .carriers
        .remove(&carrier_id)
        .ok_or_else(|| AppError::NotFound(format!("carrier {carrier_id} not found")))?;
    let _ = state
        .metrics
        .carrier_utilization
        .remove_label_values(&[&carrier_id.to_string()]);

    info!(carrier_id = %carrier_id, cancelled = live.len(), "carrier removed");
    Ok(carrier)
}

pub fn get_package(state: &AppState, package_id: Uuid) -> Result<Package, AppError> {
    state
        .packages
        .get(&package_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("package {package_id} not found")))
}

pub fn get_carrier(state: &AppState, carrier_id: Uuid) -> Result<Carrier, AppError> {
    state
        .carriers
        .get(&carrier_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("carrier {carrier_id} not found")))
}

pub fn set_carrier_active(state: &AppState, carrier_id: Uuid, active: bool) -> Result<Carrier, AppError> {
    let mut carrier = state
        .carriers
        .get_mut(&carrier_id)
        .ok_or_else(|| AppError::NotFound(format!("carrier {carrier_id} not found")))?;

    carrier.active = active;
    carrier.updated_at = Utc::now();

    Ok(carrier.clone())
}

pub fn update_carrier_location(
    state: &AppState,
    carrier_id: Uuid,
    location: GeoPoint,
) -> Result<Carrier, AppError> {
    if !location.is_valid() {
        return Err(AppError::Validation(format!("invalid location {location:?}")));
    }

    let mut carrier = state
        .carriers
        .get_mut(&carrier_id)
        .ok_or_else(|| AppError::NotFound(format!("carrier {carrier_id} not found")))?;

    carrier.location = location;
    carrier.updated_at = Utc::now();

    Ok(carrier.clone())
}

fn live_matches(state: &AppState, belongs: impl Fn(&Match) -> bool) -> Vec<Uuid> {
    state
        .matches
        .iter()
        .filter(|entry| !entry.value().status.is_terminal() && belongs(entry.value()))
        .map(|entry| *entry.key())
        .collect()
}

fn validate_window(name: &str, window: &TimeWindow) -> Result<(), AppError> {
    if window.end < window.start {
        return Err(AppError::Validation(format!("{name} ends before it starts")));
    }

    Ok(())
}

fn validate_positive(name: &str, value: f64) -> Result<(), AppError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::Validation(format!("{name} must be > 0")));
    }

    Ok(())
}

fn validate_package(package: &Package) -> Result<(), AppError> {
    if package.id.is_nil() {
        return Err(AppError::Validation("package id is required".to_string()));
    }
    if package.sender_id.is_nil() {
        return Err(AppError::Validation("sender id is required".to_string()));
    }
    if !package.pickup.is_valid() || !package.delivery.is_valid() {
        return Err(AppError::Validation(
            "pickup and delivery must be valid coordinates".to_string(),
        ));
    }
    validate_positive("weight", package.weight_kg)?;
    validate_positive("size", package.size)?;
    validate_window("pickup window", &package.pickup_window)?;
    validate_window("delivery window", &package.delivery_window)?;
    if package.delivery_window.end < package.pickup_window.start {
        return Err(AppError::Validation(
            "delivery window closes before pickup opens".to_string(),
        ));
    }

    Ok(())
}

fn validate_carrier(carrier: &Carrier) -> Result<(), AppError> {
    if carrier.id.is_nil() {
        return Err(AppError::Validation("carrier id is required".to_string()));
    }
    if carrier.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    validate_positive("max weight", carrier.capacity.max_weight)?;
    validate_positive("max size", carrier.capacity.max_size)?;
    if carrier.capacity.max_packages == 0 {
        return Err(AppError::Validation("max packages must be > 0".to_string()));
    }
    if !carrier.rating.is_finite() {
        return Err(AppError::Validation("rating must be a number".to_string()));
    }
    if !carrier.location.is_valid()
        || !carrier.route.origin.is_valid()
        || !carrier.route.destination.is_valid()
    {
        return Err(AppError::Validation(
            "carrier location and route must be valid coordinates".to_string(),
        ));
    }
    validate_window("availability", &carrier.availability)?;

    Ok(())
}
