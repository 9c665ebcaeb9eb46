//! Plausibility filter
//!
//! Flags pings whose implied motion since the last *accepted* fix is
//! physically impossible. Rejected pings never become the reference, so a
//! single bad fix cannot poison the comparison for the points after it.

use super::geo::{haversine_m, is_valid_position, mps_to_kmh};
use super::FilterError;
use crate::config::FilterConfig;
use crate::types::{FilteredPing, Fix, OutlierKind, RawPing};

/// Result of filtering one vehicle's pings for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    /// Input pings in input order, annotated
    pub pings: Vec<FilteredPing>,
    /// Number of pings flagged as outliers
    pub outliers: i64,
    /// Reference fix after the last ping (seed for the next window)
    pub last_accepted: Option<Fix>,
}

/// Stateless, deterministic filter; `run` carries the reference fix.
#[derive(Debug, Clone)]
pub struct PlausibilityFilter {
    config: FilterConfig,
}

impl PlausibilityFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Judge one ping against the current reference. `None` means accept.
    pub fn classify(&self, reference: Option<&Fix>, ping: &RawPing) -> Option<OutlierKind> {
        if !is_valid_position(ping.lat, ping.lng) {
            return Some(OutlierKind::InvalidCoordinates);
        }

        let reference = reference?;

        let dt_secs = (ping.time - reference.time).num_milliseconds() as f64 / 1000.0;
        if dt_secs <= 0.0 {
            return Some(OutlierKind::NonIncreasingTime);
        }

        let distance_m = haversine_m(reference.lat, reference.lng, ping.lat, ping.lng);
        let implied_kmh = mps_to_kmh(distance_m / dt_secs);
        if implied_kmh > self.config.max_implied_speed_kmh {
            return Some(OutlierKind::ImpliedSpeed);
        }

        if let Some(limit) = self.config.max_speed_divergence_kmh {
            if dt_secs <= self.config.divergence_max_gap_secs
                && (ping.speed - implied_kmh).abs() > limit
            {
                return Some(OutlierKind::SpeedDivergence);
            }
        }

        None
    }

    /// Filter pings for exactly one vehicle, ordered by time ascending.
    ///
    /// `seed` is the last accepted fix from before the window; without one
    /// the first valid ping is accepted and becomes the reference.
    pub fn run(
        &self,
        pings: &[RawPing],
        seed: Option<Fix>,
        vehicle_id: Option<i32>,
    ) -> Result<FilterOutcome, FilterError> {
        if let Some(first) = pings.first() {
            if let Some(other) = pings.iter().find(|p| p.garage_no != first.garage_no) {
                return Err(FilterError::MixedVehicles {
                    expected: first.garage_no.clone(),
                    found: other.garage_no.clone(),
                });
            }
        }

        let mut reference = seed;
        let mut outliers = 0_i64;
        let mut annotated = Vec::with_capacity(pings.len());

        for ping in pings {
            let verdict = self.classify(reference.as_ref(), ping);
            match verdict {
                Some(_) => outliers += 1,
                None => reference = Some(Fix::from(ping)),
            }
            annotated.push(FilteredPing::from_raw(ping, vehicle_id, verdict));
        }

        Ok(FilterOutcome {
            pings: annotated,
            outliers,
            last_accepted: reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
    }

    fn ping(secs: i64, lat: f64, lng: f64, speed: f64) -> RawPing {
        RawPing {
            time: t0() + Duration::seconds(secs),
            vehicle_id: None,
            garage_no: "P93597".to_string(),
            lat,
            lng,
            speed,
            course: 90.0,
            altitude: 120.0,
            state: 0,
            in_route: true,
            source: "teltonika".to_string(),
        }
    }

    fn filter() -> PlausibilityFilter {
        PlausibilityFilter::new(FilterConfig::default())
    }

    fn flags(outcome: &FilterOutcome) -> Vec<bool> {
        outcome.pings.iter().map(|p| p.is_outlier).collect()
    }

    #[test]
    fn test_teleport_is_flagged_and_next_point_compared_to_last_accepted() {
        let pings = vec![
            ping(0, 44.000, 20.000, 20.0),
            ping(1, 44.020, 20.020, 20.0),
            ping(5, 44.0001, 20.0001, 20.0),
        ];
        let outcome = filter().run(&pings, None, Some(1)).unwrap();

        assert_eq!(flags(&outcome), vec![false, true, false]);
        assert_eq!(outcome.outliers, 1);
        assert_eq!(outcome.pings[1].outlier_kind, Some(OutlierKind::ImpliedSpeed));
        assert_eq!(outcome.last_accepted.unwrap().time, pings[2].time);
        assert_eq!(outcome.pings[0].vehicle_id, Some(1));
    }

    #[test]
    fn test_naive_predecessor_comparison_would_reject_recovery_point() {
        // t2 is ~2.7 km from t1 in 4 s: implausible against the raw
        // predecessor, plausible against the last accepted fix.
        let pings = vec![
            ping(0, 44.000, 20.000, 20.0),
            ping(1, 44.020, 20.020, 20.0),
            ping(5, 44.0001, 20.0001, 20.0),
        ];
        let f = filter();
        let from_t1 = f.classify(Some(&Fix::from(&pings[1])), &pings[2]);
        assert_eq!(from_t1, Some(OutlierKind::ImpliedSpeed));

        let outcome = f.run(&pings, None, None).unwrap();
        assert!(!outcome.pings[2].is_outlier);
    }

    #[test]
    fn test_duplicate_timestamp_is_outlier_and_not_reference() {
        let pings = vec![
            ping(0, 44.0, 20.0, 10.0),
            ping(0, 44.0, 20.0, 10.0),
            ping(-3, 44.0, 20.0, 10.0),
            ping(10, 44.0002, 20.0, 10.0),
        ];
        let outcome = filter().run(&pings, None, None).unwrap();
        assert_eq!(flags(&outcome), vec![false, true, true, false]);
        assert_eq!(
            outcome.pings[1].outlier_kind,
            Some(OutlierKind::NonIncreasingTime)
        );
        assert_eq!(
            outcome.pings[2].outlier_kind,
            Some(OutlierKind::NonIncreasingTime)
        );
        assert_eq!(outcome.last_accepted.unwrap().time, pings[3].time);
    }

    #[test]
    fn test_seed_from_previous_window_is_used() {
        let seed = Fix {
            time: t0() - Duration::seconds(2),
            lat: 45.0,
            lng: 21.0,
        };
        // First ping is ~140 km away from the seed two seconds later
        let pings = vec![ping(0, 44.0, 20.0, 30.0), ping(1, 45.0001, 21.0, 30.0)];
        let outcome = filter().run(&pings, Some(seed), None).unwrap();
        assert_eq!(flags(&outcome), vec![true, false]);
    }

    #[test]
    fn test_first_point_without_seed_is_accepted() {
        let outcome = filter().run(&[ping(0, 44.0, 20.0, 0.0)], None, None).unwrap();
        assert_eq!(outcome.outliers, 0);
        assert!(outcome.last_accepted.is_some());
    }

    #[test]
    fn test_invalid_coordinates_never_become_reference() {
        let pings = vec![
            ping(0, 0.0, 0.0, 0.0),
            ping(1, 44.0, 20.0, 0.0),
            ping(2, f64::NAN, 20.0, 0.0),
            ping(3, 44.00001, 20.0, 0.0),
        ];
        let outcome = filter().run(&pings, None, None).unwrap();
        assert_eq!(flags(&outcome), vec![true, false, true, false]);
        assert_eq!(
            outcome.pings[0].outlier_kind,
            Some(OutlierKind::InvalidCoordinates)
        );
    }

    #[test]
    fn test_speed_divergence_only_when_enabled() {
        // ~11 m in 1 s ≈ 40 km/h implied, device reports 120 km/h
        let pings = vec![ping(0, 44.0, 20.0, 40.0), ping(1, 44.0001, 20.0, 120.0)];

        let outcome = filter().run(&pings, None, None).unwrap();
        assert_eq!(outcome.outliers, 0);

        let strict = PlausibilityFilter::new(FilterConfig {
            max_speed_divergence_kmh: Some(50.0),
            ..FilterConfig::default()
        });
        let outcome = strict.run(&pings, None, None).unwrap();
        assert_eq!(
            outcome.pings[1].outlier_kind,
            Some(OutlierKind::SpeedDivergence)
        );
    }

    #[test]
    fn test_speed_divergence_ignored_across_long_gaps() {
        let strict = PlausibilityFilter::new(FilterConfig {
            max_speed_divergence_kmh: Some(50.0),
            ..FilterConfig::default()
        });
        let pings = vec![ping(0, 44.0, 20.0, 0.0), ping(600, 44.0001, 20.0, 90.0)];
        let outcome = strict.run(&pings, None, None).unwrap();
        assert_eq!(outcome.outliers, 0);
    }

    #[test]
    fn test_mixed_vehicles_rejected() {
        let mut other = ping(1, 44.0, 20.0, 0.0);
        other.garage_no = "P80001".to_string();
        let err = filter()
            .run(&[ping(0, 44.0, 20.0, 0.0), other], None, None)
            .unwrap_err();
        assert!(matches!(err, FilterError::MixedVehicles { .. }));
    }

    #[test]
    fn test_empty_input() {
        let seed = Fix {
            time: t0(),
            lat: 44.0,
            lng: 20.0,
        };
        let outcome = filter().run(&[], Some(seed), None).unwrap();
        assert!(outcome.pings.is_empty());
        assert_eq!(outcome.last_accepted, Some(seed));
    }

    #[test]
    fn test_accepted_consecutive_pings_respect_ceiling() {
        let f = filter();
        let ceiling = f.config().max_implied_speed_kmh;
        let mut rng = StdRng::seed_from_u64(0x6b70_6961);

        for _ in 0..50 {
            let mut secs = 0_i64;
            let (mut lat, mut lng) = (44.8, 20.45);
            let mut pings = Vec::new();
            for _ in 0..200 {
                secs += rng.gen_range(-1..=5);
                if rng.gen_bool(0.1) {
                    // GPS jump of up to ~5 km
                    pings.push(ping(
                        secs,
                        lat + rng.gen_range(-0.05..0.05),
                        lng + rng.gen_range(-0.05..0.05),
                        30.0,
                    ));
                } else {
                    lat += rng.gen_range(-0.0002..0.0002);
                    lng += rng.gen_range(-0.0002..0.0002);
                    pings.push(ping(secs, lat, lng, 30.0));
                }
            }

            let outcome = f.run(&pings, None, None).unwrap();
            let accepted: Vec<&FilteredPing> =
                outcome.pings.iter().filter(|p| !p.is_outlier).collect();
            for pair in accepted.windows(2) {
                let dt = (pair[1].time - pair[0].time).num_milliseconds() as f64 / 1000.0;
                assert!(dt > 0.0, "accepted pings must be strictly increasing in time");
                let d = haversine_m(pair[0].lat, pair[0].lng, pair[1].lat, pair[1].lng);
                assert!(mps_to_kmh(d / dt) <= ceiling);
            }
            let flagged = outcome.pings.iter().filter(|p| p.is_outlier).count();
            assert_eq!(i64::try_from(flagged).unwrap(), outcome.outliers);
        }
    }
}
