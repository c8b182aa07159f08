use std::path::Path;

use chrono::{Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::engine::lifecycle::{CancelMatch, CompleteMatch, ProposeMatch};
use crate::engine::registry;
use crate::error::AppError;
use crate::models::carrier::{Carrier, Route, VehicleCapacity};
use crate::models::matching::{ActorRole, MatchOrigin};
use crate::models::package::{Package, PackageStatus, Urgency};
use crate::models::{GeoPoint, TimeWindow};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct NewPackage {
    pub id: Option<Uuid>,
    pub sender_id: Uuid,
    pub pickup: GeoPoint,
    pub delivery: GeoPoint,
    pub weight_kg: f64,
    pub size: f64,
    #[serde(default)]
    pub fragile: bool,
    #[serde(default)]
    pub requires_signature: bool,
    #[serde(default)]
    pub requires_refrigeration: bool,
    #[serde(default)]
    pub urgency: Urgency,
    pub pickup_window: TimeWindow,
    pub delivery_window: TimeWindow,
}

impl NewPackage {
    pub fn into_package(self) -> Package {
        let now = Utc::now();
        Package {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            sender_id: self.sender_id,
            pickup: self.pickup,
            delivery: self.delivery,
            weight_kg: self.weight_kg,
            size: self.size,
            fragile: self.fragile,
            requires_signature: self.requires_signature,
            requires_refrigeration: self.requires_refrigeration,
            urgency: self.urgency,
            pickup_window: self.pickup_window,
            delivery_window: self.delivery_window,
            status: PackageStatus::Created,
            active_match: None,
            assigned_carrier: None,
            picked_up_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCarrier {
    pub id: Option<Uuid>,
    pub name: String,
    pub capacity: VehicleCapacity,
    #[serde(default)]
    pub has_refrigeration: bool,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub completed_deliveries: u32,
    pub route: Route,
    pub availability: TimeWindow,
    /// Defaults to the start of the route.
    pub location: Option<GeoPoint>,
}

impl NewCarrier {
    pub fn into_carrier(self) -> Carrier {
        Carrier {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            capacity: self.capacity,
            has_refrigeration: self.has_refrigeration,
            rating: self.rating,
            rating_count: if self.rating > 0.0 { 1 } else { 0 },
            completed_deliveries: self.completed_deliveries,
            location: self.location.unwrap_or(self.route.origin),
            route: self.route,
            availability: self.availability,
            active: true,
            accepted_matches: 0,
            open_offers: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Manual offer made by an operator.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposeMatchRequest {
    pub package_id: Option<Uuid>,
    pub carrier_id: Option<Uuid>,
    pub score: Option<f64>,
    pub ttl_minutes: Option<i64>,
    pub note: Option<String>,
}

impl ProposeMatchRequest {
    pub fn into_command(self, settings: &EngineSettings) -> Result<ProposeMatch, AppError> {
        let package_id = self
            .package_id
            .ok_or_else(|| AppError::Validation("package_id is required".to_string()))?;
        let carrier_id = self
            .carrier_id
            .ok_or_else(|| AppError::Validation("carrier_id is required".to_string()))?;

        let ttl = match self.ttl_minutes {
            Some(minutes) if minutes <= 0 => {
                return Err(AppError::Validation("ttl_minutes must be > 0".to_string()));
            }
            Some(minutes) => {
                let ttl = Duration::try_minutes(minutes)
                    .filter(|ttl| *ttl <= settings.max_offer_ttl)
                    .ok_or_else(|| {
                        AppError::Validation(format!(
                            "ttl_minutes must be at most {}",
                            settings.max_offer_ttl.num_minutes()
                        ))
                    })?;
                Some(ttl)
            }
            None => None,
        };

        Ok(ProposeMatch {
            package_id,
            carrier_id,
            score: self.score,
            origin: MatchOrigin::Manual,
            ttl,
            note: self.note.filter(|note| !note.trim().is_empty()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelMatchRequest {
    pub actor_id: Uuid,
    pub role: ActorRole,
    pub reason: Option<String>,
}

impl CancelMatchRequest {
    pub fn into_command(self, match_id: Uuid) -> CancelMatch {
        CancelMatch {
            match_id,
            actor_id: self.actor_id,
            role: self.role,
            reason: self.reason.filter(|reason| !reason.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteMatchRequest {
    pub carrier_id: Uuid,
    pub successful: bool,
    pub delivery_code: Option<String>,
    pub completion_minutes: Option<f64>,
    pub customer_rating: Option<f64>,
}

impl CompleteMatchRequest {
    pub fn into_command(self, match_id: Uuid) -> CompleteMatch {
        CompleteMatch {
            match_id,
            carrier_id: self.carrier_id,
            successful: self.successful,
            delivery_code: self.delivery_code,
            completion_minutes: self.completion_minutes,
            customer_rating: self.customer_rating,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindMatchesQuery {
    pub min_score: Option<f64>,
    pub max_results: Option<usize>,
}

impl FindMatchesQuery {
    /// Threshold and limit to rank with; a missing threshold falls back to the
    /// configured `min_match_score`.
    pub fn resolve(&self, settings: &EngineSettings) -> (f64, Option<usize>) {
        (
            self.min_score.unwrap_or(settings.min_match_score),
            self.max_results,
        )
    }
}

/// Packages and carriers to seed the registry with at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub packages: Vec<NewPackage>,
    #[serde(default)]
    pub carriers: Vec<NewCarrier>,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::Internal(format!("failed to read snapshot {}: {err}", path.display()))
        })?;

        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|err| AppError::Validation(format!("invalid snapshot: {err}")))
    }

    /// Registers everything, stopping at the first invalid entry. Returns the
    /// number of packages and carriers added.
    pub fn register(self, state: &AppState) -> Result<(usize, usize), AppError> {
        let carriers = self.carriers.len();
        for carrier in self.carriers {
            registry::add_carrier(state, carrier.into_carrier())?;
        }

        let packages = self.packages.len();
        for package in self.packages {
            registry::add_package(state, package.into_package())?;
        }

        Ok((packages, carriers))
    }
}
