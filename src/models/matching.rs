use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::features::FeatureVector;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MatchStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
    Completed,
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchStatus::Rejected
                | MatchStatus::Expired
                | MatchStatus::Cancelled
                | MatchStatus::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Accepted => "accepted",
            MatchStatus::Rejected => "rejected",
            MatchStatus::Expired => "expired",
            MatchStatus::Cancelled => "cancelled",
            MatchStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum MatchOrigin {
    Batch,
    Manual,
}

impl MatchOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOrigin::Batch => "batch",
            MatchOrigin::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ActorRole {
    Sender,
    Carrier,
    Admin,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self {
            ActorRole::Sender => "sender",
            ActorRole::Carrier => "carrier",
            ActorRole::Admin => "admin",
        };
        f.write_str(role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub package_id: Uuid,
    pub carrier_id: Uuid,
    pub route_id: Option<Uuid>,
    pub status: MatchStatus,
    pub origin: MatchOrigin,
    pub score: f64,
    pub detour_km: f64,
    pub detour_minutes: f64,
    pub estimated_pickup_at: DateTime<Utc>,
    pub estimated_delivery_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payout: f64,
    pub platform_fee: f64,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_time_ms: Option<i64>,
    pub carrier_notes: Option<String>,
    pub notes: Vec<String>,
    pub pickup_code: String,
    pub delivery_code: String,
    pub successful: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Match {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == MatchStatus::Pending && now >= self.expires_at
    }

    pub(crate) fn record_response(&mut self, now: DateTime<Utc>) {
        self.responded_at = Some(now);
        self.response_time_ms = Some((now - self.created_at).num_milliseconds());
        self.updated_at = now;
    }
}

/// A scored (package, carrier) pairing that has not been offered yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub package_id: Uuid,
    pub carrier_id: Uuid,
    pub score: f64,
    pub features: FeatureVector,
    pub detour_km: f64,
    pub detour_minutes: f64,
    pub payout: f64,
    pub platform_fee: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEvent {
    pub match_id: Uuid,
    pub package_id: Uuid,
    pub carrier_id: Uuid,
    pub from: Option<MatchStatus>,
    pub to: MatchStatus,
    pub at: DateTime<Utc>,
}

impl MatchEvent {
    pub fn transition(m: &Match, from: Option<MatchStatus>) -> Self {
        Self {
            match_id: m.id,
            package_id: m.package_id,
            carrier_id: m.carrier_id,
            from,
            to: m.status,
            at: m.updated_at,
        }
    }
}

/// Scores arrive either as probabilities or as percentages depending on the
/// caller; everything stored on a match is a probability.
pub fn normalize_score(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }

    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    scaled.clamp(0.0, 1.0)
}
