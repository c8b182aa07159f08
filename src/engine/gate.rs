use std::fmt;

use crate::geo::time_window_overlap;
use crate::models::carrier::Carrier;
use crate::models::package::Package;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Incompatibility {
    Overweight,
    Oversize,
    NeedsRefrigeration,
    NoTimeOverlap,
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Incompatibility::Overweight => "package exceeds the carrier's weight limit",
            Incompatibility::Oversize => "package exceeds the carrier's size limit",
            Incompatibility::NeedsRefrigeration => "package needs refrigeration",
            Incompatibility::NoTimeOverlap => "carrier is not available during the package window",
        };
        f.write_str(reason)
    }
}

/// Hard constraints checked before a pair is ever scored.
pub fn check(carrier: &Carrier, package: &Package) -> Result<(), Incompatibility> {
    if package.weight_kg > carrier.capacity.max_weight {
        return Err(Incompatibility::Overweight);
    }
    if package.size > carrier.capacity.max_size {
        return Err(Incompatibility::Oversize);
    }
    if package.requires_refrigeration && !carrier.has_refrigeration {
        return Err(Incompatibility::NeedsRefrigeration);
    }
    if time_window_overlap(&carrier.availability, &package.service_window()) <= 0.0 {
        return Err(Incompatibility::NoTimeOverlap);
    }

    Ok(())
}
