//! Vehicle discovery records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered vehicle with unprocessed rows in a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleToProcess {
    pub vehicle_id: i32,
    pub garage_no: String,
    /// Raw pings for this vehicle inside the window
    pub estimated_rows: i64,
    /// Latest filtered ping written for this vehicle, any window
    pub last_processed_time: Option<DateTime<Utc>>,
}
