//! Great-circle math for stop ordering and allocation scoring.

use crate::models::LatLon;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distance between two points in kilometers using the Haversine formula.
///
/// Inputs are decimal degrees; the result is always non-negative.
pub fn distance_km(a: LatLon, b: LatLon) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dphi = (b.lat - a.lat).to_radians();
    let dlambda = (b.lon - a.lon).to_radians();
    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Total length of the round trip origin -> stops[0] -> ... -> origin.
pub fn round_trip_km(origin: LatLon, stops: &[LatLon]) -> f64 {
    if stops.is_empty() {
        return 0.0;
    }
    let mut total = distance_km(origin, stops[0]);
    for pair in stops.windows(2) {
        total += distance_km(pair[0], pair[1]);
    }
    total + distance_km(stops[stops.len() - 1], origin)
}
