//! Ping types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw position report as written by the ingestion path.
///
/// Never mutated or deleted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPing {
    pub time: DateTime<Utc>,
    /// Registry id, absent until the ingestion side resolves the garage number
    pub vehicle_id: Option<i32>,
    /// Operational identifier printed on the vehicle
    pub garage_no: String,
    /// Latitude (degrees)
    pub lat: f64,
    /// Longitude (degrees)
    pub lng: f64,
    /// Reported speed (km/h)
    pub speed: f64,
    /// Heading (degrees)
    pub course: f64,
    /// Altitude (m)
    pub altitude: f64,
    /// Device state flags
    pub state: i32,
    pub in_route: bool,
    /// Ingestion source tag
    pub source: String,
}

/// Position reference carried forward by the plausibility filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub time: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
}

impl From<&RawPing> for Fix {
    fn from(ping: &RawPing) -> Self {
        Self {
            time: ping.time,
            lat: ping.lat,
            lng: ping.lng,
        }
    }
}

impl From<&FilteredPing> for Fix {
    fn from(ping: &FilteredPing) -> Self {
        Self {
            time: ping.time,
            lat: ping.lat,
            lng: ping.lng,
        }
    }
}

/// Why a ping was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierKind {
    /// Non-finite, out of range, or null-island coordinates
    InvalidCoordinates,
    /// Duplicate or out-of-order timestamp relative to the last accepted fix
    NonIncreasingTime,
    /// Distance / Δt above the plausibility ceiling
    ImpliedSpeed,
    /// Reported speed disagrees with implied speed over a short gap
    SpeedDivergence,
}

impl OutlierKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCoordinates => "invalid_coordinates",
            Self::NonIncreasingTime => "non_increasing_time",
            Self::ImpliedSpeed => "implied_speed",
            Self::SpeedDivergence => "speed_divergence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invalid_coordinates" => Some(Self::InvalidCoordinates),
            "non_increasing_time" => Some(Self::NonIncreasingTime),
            "implied_speed" => Some(Self::ImpliedSpeed),
            "speed_divergence" => Some(Self::SpeedDivergence),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutlierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline output row, upserted keyed by `(time, garage_no)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredPing {
    pub time: DateTime<Utc>,
    pub vehicle_id: Option<i32>,
    pub garage_no: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: f64,
    pub course: f64,
    pub altitude: f64,
    pub state: i32,
    pub in_route: bool,
    pub source: String,
    pub is_outlier: bool,
    pub outlier_kind: Option<OutlierKind>,
    /// Batch that last wrote this row
    pub batch_id: Option<i64>,
}

impl FilteredPing {
    /// Annotate a raw ping. `vehicle_id` fills in when the raw row is unresolved.
    pub fn from_raw(raw: &RawPing, vehicle_id: Option<i32>, outlier: Option<OutlierKind>) -> Self {
        Self {
            time: raw.time,
            vehicle_id: raw.vehicle_id.or(vehicle_id),
            garage_no: raw.garage_no.clone(),
            lat: raw.lat,
            lng: raw.lng,
            speed: raw.speed,
            course: raw.course,
            altitude: raw.altitude,
            state: raw.state,
            in_route: raw.in_route,
            source: raw.source.clone(),
            is_outlier: outlier.is_some(),
            outlier_kind: outlier,
            batch_id: None,
        }
    }
}
