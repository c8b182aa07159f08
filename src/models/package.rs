use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{GeoPoint, TimeWindow};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum PackageStatus {
    Created,
    Scheduled,
    InTransit,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub pickup: GeoPoint,
    pub delivery: GeoPoint,
    pub weight_kg: f64,
    pub size: f64,
    pub fragile: bool,
    pub requires_signature: bool,
    pub requires_refrigeration: bool,
    pub urgency: Urgency,
    pub pickup_window: TimeWindow,
    pub delivery_window: TimeWindow,
    pub status: PackageStatus,
    pub active_match: Option<Uuid>,
    pub assigned_carrier: Option<Uuid>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Package {
    pub fn is_matchable(&self) -> bool {
        self.status == PackageStatus::Created && self.active_match.is_none()
    }

    pub fn has_special_requirements(&self) -> bool {
        self.fragile || self.requires_signature || self.requires_refrigeration
    }

    /// From the opening of the pickup window to the close of the delivery window.
    pub fn service_window(&self) -> TimeWindow {
        TimeWindow::new(self.pickup_window.start, self.delivery_window.end)
    }

    /// Back to the open pool, as if no carrier had ever been involved.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = PackageStatus::Created;
        self.active_match = None;
        self.assigned_carrier = None;
        self.picked_up_at = None;
        self.updated_at = now;
    }
}
