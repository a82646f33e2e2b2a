//! Geographic utilities: haversine distance and polyline length.

use crate::GeoPoint;

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometers.
///
/// Returns exactly 0 for identical coordinates. NaN inputs propagate;
/// callers validate coordinates upstream.
pub fn distance_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    if a.latitude == b.latitude && a.longitude == b.longitude {
        return 0.0;
    }

    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    // Rounding can push h just above 1 for antipodal points
    let h = if h > 1.0 { 1.0 } else { h };
    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Great-circle distance in meters.
#[inline]
pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    distance_km(a, b) * 1000.0
}

/// Total length of a path in kilometers.
pub fn polyline_length_km(points: &[GeoPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points.windows(2).map(|w| distance_km(&w[0], &w[1])).sum()
}
