use serde::{Deserialize, Serialize};

use crate::models::package::{Package, Urgency};

const BASE_RATE: f64 = 50.0;
const PER_DETOUR_KM: f64 = 10.0;
const PER_KG: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub payout: f64,
    pub platform_fee: f64,
}

fn urgency_premium(urgency: Urgency) -> f64 {
    match urgency {
        Urgency::Low => 0.0,
        Urgency::Medium => 50.0,
        Urgency::High => 100.0,
    }
}

/// What the carrier earns for the detour, and the platform's cut on top.
pub fn quote(package: &Package, detour_km: f64, fee_rate: f64) -> Quote {
    let payout = BASE_RATE
        + detour_km.max(0.0) * PER_DETOUR_KM
        + package.weight_kg.max(0.0) * PER_KG
        + urgency_premium(package.urgency);

    Quote {
        payout: round_cents(payout),
        platform_fee: round_cents(payout * fee_rate.max(0.0)),
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
