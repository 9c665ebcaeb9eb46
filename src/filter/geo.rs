//! Geodesic helpers

/// Mean Earth radius (m), IUGG.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two WGS-84 positions in metres (haversine).
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // clamp guards against a > 1 from rounding on antipodal points
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// m/s → km/h
pub fn mps_to_kmh(mps: f64) -> f64 {
    mps * 3.6
}

/// Plausible WGS-84 position: finite, in range, and not the (0, 0) null fix
/// that receivers emit before lock.
pub fn is_valid_position(lat: f64, lng: f64) -> bool {
    lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
        && !(lat == 0.0 && lng == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert!(haversine_m(44.8, 20.46, 44.8, 20.46).abs() < 1e-9);
    }

    #[test]
    fn test_one_degree_latitude() {
        // ~111.2 km per degree of latitude
        let d = haversine_m(44.0, 20.0, 45.0, 20.0);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn test_symmetry() {
        let a = haversine_m(44.0, 20.0, 44.02, 20.02);
        let b = haversine_m(44.02, 20.02, 44.0, 20.0);
        assert!((a - b).abs() < 1e-9);
        assert!(a > 2_000.0 && a < 3_000.0, "got {a}");
    }

    #[test]
    fn test_position_validity() {
        assert!(is_valid_position(44.8, 20.46));
        assert!(!is_valid_position(0.0, 0.0));
        assert!(!is_valid_position(91.0, 20.0));
        assert!(!is_valid_position(44.0, -181.0));
        assert!(!is_valid_position(f64::NAN, 20.0));
    }
}
