use crate::models::carrier::Route;
use crate::models::{GeoPoint, TimeWindow};

const EARTH_RADIUS_KM: f64 = 6_371.0;
const AVERAGE_SPEED_KMH: f64 = 30.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Extra distance travelled when the route goes origin -> pickup -> delivery
/// -> destination instead of straight from origin to destination.
pub fn route_deviation_km(route: &Route, pickup: &GeoPoint, delivery: &GeoPoint) -> f64 {
    let with_package = haversine_km(&route.origin, pickup)
        + haversine_km(pickup, delivery)
        + haversine_km(delivery, &route.destination);
    let direct = haversine_km(&route.origin, &route.destination);

    (with_package - direct).max(0.0)
}

/// Fraction of `required` covered by `available`.
pub fn time_window_overlap(available: &TimeWindow, required: &TimeWindow) -> f64 {
    let required_ms = required.duration().num_milliseconds();
    if required_ms <= 0 {
        return if available.contains(required.start) { 1.0 } else { 0.0 };
    }

    let start = available.start.max(required.start);
    let end = available.end.min(required.end);
    let overlap_ms = (end - start).num_milliseconds().max(0);

    (overlap_ms as f64 / required_ms as f64).clamp(0.0, 1.0)
}

pub fn travel_minutes(distance_km: f64) -> f64 {
    distance_km.max(0.0) / AVERAGE_SPEED_KMH * 60.0
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{haversine_km, route_deviation_km, time_window_overlap, travel_minutes};
    use crate::models::carrier::Route;
    use crate::models::{GeoPoint, TimeWindow};

    fn window(start_hour: u32, end_hour: u32) -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 5, 6, start_hour, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 6, end_hour, 0, 0).unwrap(),
        )
    }

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn distance_is_symmetric_and_obeys_triangle_inequality() {
        let hamburg = GeoPoint::new(53.5511, 9.9937);
        let berlin = GeoPoint::new(52.52, 13.405);
        let munich = GeoPoint::new(48.1351, 11.582);

        let hb = haversine_km(&hamburg, &berlin);
        assert!((hb - haversine_km(&berlin, &hamburg)).abs() < 1e-9);

        let hm = haversine_km(&hamburg, &munich);
        let bm = haversine_km(&berlin, &munich);
        assert!(hm <= hb + bm + 1e-9);
    }

    #[test]
    fn deviation_is_zero_for_points_on_the_route_endpoints() {
        let route = Route {
            id: None,
            origin: GeoPoint::new(0.0, 0.0),
            destination: GeoPoint::new(1.0, 1.0),
        };

        let deviation = route_deviation_km(&route, &route.origin, &route.destination);
        assert!(deviation < 1e-6);
    }

    #[test]
    fn deviation_grows_for_off_route_packages() {
        let route = Route {
            id: None,
            origin: GeoPoint::new(0.0, 0.0),
            destination: GeoPoint::new(1.0, 1.0),
        };

        let near = route_deviation_km(&route, &GeoPoint::new(0.4, 0.4), &GeoPoint::new(0.6, 0.6));
        let far = route_deviation_km(&route, &GeoPoint::new(2.0, -1.0), &GeoPoint::new(0.6, 0.6));

        assert!(near >= 0.0);
        assert!(near < 1.0);
        assert!(far > near);
    }

    #[test]
    fn overlap_is_fraction_of_required_window() {
        assert_eq!(time_window_overlap(&window(9, 13), &window(10, 12)), 1.0);
        assert!((time_window_overlap(&window(11, 13), &window(10, 12)) - 0.5).abs() < 1e-9);
        assert_eq!(time_window_overlap(&window(13, 15), &window(10, 12)), 0.0);
    }

    #[test]
    fn zero_length_required_window_is_point_containment() {
        assert_eq!(time_window_overlap(&window(9, 13), &window(10, 10)), 1.0);
        assert_eq!(time_window_overlap(&window(9, 13), &window(14, 14)), 0.0);
    }

    #[test]
    fn thirty_km_take_an_hour() {
        assert!((travel_minutes(30.0) - 60.0).abs() < 1e-9);
    }
}
