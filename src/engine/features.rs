use std::collections::BTreeMap;

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use crate::geo::{haversine_km, route_deviation_km, time_window_overlap};
use crate::models::carrier::Carrier;
use crate::models::package::Package;

pub const FEATURE_COUNT: usize = 12;

const BOUND_PADDING: f64 = 0.10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    RouteDeviation,
    TimeOverlap,
    Rating,
    WeightRatio,
    SizeRatio,
    Utilization,
    Experience,
    DistanceToPickup,
    TripDistance,
    TimeOfDay,
    DayOfWeek,
    SpecialRequirements,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::RouteDeviation,
        Feature::TimeOverlap,
        Feature::Rating,
        Feature::WeightRatio,
        Feature::SizeRatio,
        Feature::Utilization,
        Feature::Experience,
        Feature::DistanceToPickup,
        Feature::TripDistance,
        Feature::TimeOfDay,
        Feature::DayOfWeek,
        Feature::SpecialRequirements,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::RouteDeviation => "route_deviation",
            Feature::TimeOverlap => "time_overlap",
            Feature::Rating => "rating",
            Feature::WeightRatio => "weight_ratio",
            Feature::SizeRatio => "size_ratio",
            Feature::Utilization => "utilization",
            Feature::Experience => "experience",
            Feature::DistanceToPickup => "distance_to_pickup",
            Feature::TripDistance => "trip_distance",
            Feature::TimeOfDay => "time_of_day",
            Feature::DayOfWeek => "day_of_week",
            Feature::SpecialRequirements => "special_requirements",
        }
    }

    /// Features where a larger raw value means a worse fit. The model scores
    /// them as `1 - x` so every weight reads "higher is better".
    pub fn is_inverted(self) -> bool {
        matches!(
            self,
            Feature::RouteDeviation
                | Feature::WeightRatio
                | Feature::SizeRatio
                | Feature::Utilization
                | Feature::DistanceToPickup
                | Feature::TripDistance
        )
    }

    pub fn is_binary(self) -> bool {
        self == Feature::SpecialRequirements
    }

    pub fn default_bound(self) -> Bound {
        match self {
            Feature::RouteDeviation => Bound::new(0.0, 50.0),
            Feature::Experience => Bound::new(0.0, 200.0),
            Feature::DistanceToPickup => Bound::new(0.0, 100.0),
            Feature::TripDistance => Bound::new(0.0, 200.0),
            _ => Bound::new(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
}

impl Bound {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn is_usable(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.max > self.min
    }

    fn scale(&self, value: f64) -> f64 {
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

/// Per-feature min/max used for min-max scaling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizationBounds {
    bounds: BTreeMap<Feature, Bound>,
}

impl NormalizationBounds {
    pub fn seeded() -> Self {
        Self {
            bounds: Feature::ALL
                .iter()
                .map(|feature| (*feature, feature.default_bound()))
                .collect(),
        }
    }

    /// Missing or degenerate bounds fall back to the feature's default so
    /// scaling never divides by zero.
    pub fn get(&self, feature: Feature) -> Bound {
        self.bounds
            .get(&feature)
            .copied()
            .filter(Bound::is_usable)
            .unwrap_or_else(|| feature.default_bound())
    }

    pub fn set(&mut self, feature: Feature, bound: Bound) {
        self.bounds.insert(feature, bound);
    }

    /// Grows each bound to cover the observed samples, padded by a tenth of
    /// the observed range. Bounds never shrink.
    pub fn widen_to(&self, samples: &[RawFeatures]) -> Self {
        let mut widened = self.clone();
        if samples.is_empty() {
            return widened;
        }

        for feature in Feature::ALL {
            if feature.is_binary() {
                continue;
            }

            let (lo, hi) = samples
                .iter()
                .map(|raw| raw.get(feature))
                .filter(|value| value.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
            if !lo.is_finite() || !hi.is_finite() {
                continue;
            }

            let current = self.get(feature);
            let padding = (hi - lo) * BOUND_PADDING;
            let min = if lo < current.min { lo - padding } else { current.min };
            let max = if hi > current.max { hi + padding } else { current.max };
            widened.set(feature, Bound::new(min, max));
        }

        widened
    }
}

/// Feature values before scaling, as measured on the pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RawFeatures(pub [f64; FEATURE_COUNT]);

impl RawFeatures {
    pub fn get(&self, feature: Feature) -> f64 {
        self.0[feature.index()]
    }
}

/// Scaled features, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn get(&self, feature: Feature) -> f64 {
        self.0[feature.index()]
    }

    /// The value the model multiplies with the feature's weight.
    pub fn term(&self, feature: Feature) -> f64 {
        let value = self.get(feature);
        if feature.is_inverted() {
            1.0 - value
        } else {
            value
        }
    }

    pub fn named(&self) -> Vec<(&'static str, f64)> {
        Feature::ALL
            .iter()
            .map(|feature| (feature.name(), self.get(*feature)))
            .collect()
    }
}

pub fn extract_raw(carrier: &Carrier, package: &Package) -> RawFeatures {
    let mut raw = [0.0; FEATURE_COUNT];

    raw[Feature::RouteDeviation.index()] =
        route_deviation_km(&carrier.route, &package.pickup, &package.delivery);
    raw[Feature::TimeOverlap.index()] =
        time_window_overlap(&carrier.availability, &package.service_window());
    raw[Feature::Rating.index()] = carrier.rating / 5.0;
    raw[Feature::WeightRatio.index()] = ratio(package.weight_kg, carrier.capacity.max_weight);
    raw[Feature::SizeRatio.index()] = ratio(package.size, carrier.capacity.max_size);
    raw[Feature::Utilization.index()] = carrier.utilization();
    raw[Feature::Experience.index()] = carrier.completed_deliveries as f64;
    raw[Feature::DistanceToPickup.index()] = haversine_km(&carrier.location, &package.pickup);
    raw[Feature::TripDistance.index()] = haversine_km(&package.pickup, &package.delivery);

    let pickup_start = package.pickup_window.start;
    raw[Feature::TimeOfDay.index()] = pickup_start.num_seconds_from_midnight() as f64 / 86_400.0;
    raw[Feature::DayOfWeek.index()] = pickup_start.weekday().num_days_from_monday() as f64 / 6.0;
    raw[Feature::SpecialRequirements.index()] = if package.has_special_requirements() {
        1.0
    } else {
        0.0
    };

    RawFeatures(raw)
}

pub fn normalize(raw: &RawFeatures, bounds: &NormalizationBounds) -> FeatureVector {
    let mut scaled = [0.0; FEATURE_COUNT];

    for feature in Feature::ALL {
        let value = raw.get(feature);
        scaled[feature.index()] = if !value.is_finite() {
            0.0
        } else if feature.is_binary() {
            if value > 0.0 { 1.0 } else { 0.0 }
        } else {
            bounds.get(feature).scale(value)
        };
    }

    FeatureVector(scaled)
}

fn ratio(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 1.0;
    }

    (value / limit).max(0.0)
}
