use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{GeoPoint, TimeWindow};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VehicleCapacity {
    pub max_weight: f64,
    pub max_size: f64,
    pub max_packages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub id: Option<Uuid>,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Carrier {
    pub id: Uuid,
    pub name: String,
    pub capacity: VehicleCapacity,
    pub has_refrigeration: bool,
    pub rating: f64,
    pub rating_count: u32,
    pub completed_deliveries: u32,
    pub route: Route,
    pub availability: TimeWindow,
    pub location: GeoPoint,
    pub active: bool,
    /// Matches this carrier has accepted and not yet finished.
    pub accepted_matches: u32,
    /// Offers still waiting for this carrier's answer.
    pub open_offers: u32,
    pub updated_at: DateTime<Utc>,
}

impl Carrier {
    /// Slots left for new offers, counting both accepted work and open offers.
    pub fn spare_capacity(&self) -> u32 {
        self.capacity
            .max_packages
            .saturating_sub(self.accepted_matches.saturating_add(self.open_offers))
    }

    pub fn can_take_offer(&self) -> bool {
        self.active && self.spare_capacity() > 0
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity.max_packages == 0 {
            return 1.0;
        }

        (self.accepted_matches as f64 / self.capacity.max_packages as f64).clamp(0.0, 1.0)
    }

    /// Folds one customer rating into the running average.
    pub fn record_rating(&mut self, rating: f64) {
        let total = self.rating * self.rating_count as f64 + rating;
        self.rating_count = self.rating_count.saturating_add(1);
        self.rating = (total / self.rating_count as f64).clamp(0.0, 5.0);
    }
}
