//! Vehicle Discovery

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::storage::{Store, StoreError};
use crate::types::{TimeWindow, VehicleToProcess};

/// Registered vehicles seen in a window, split from the ones with work left.
#[derive(Debug, Clone, Default)]
pub struct Discovered {
    /// Still to process, largest backlog first
    pub vehicles: Vec<VehicleToProcess>,
    /// Registered vehicles with raw pings in the window, completed or not
    pub registered_in_window: usize,
}

/// Finds registered vehicles that still have work in a window.
pub struct VehicleDiscovery {
    store: Arc<dyn Store>,
}

impl VehicleDiscovery {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Vehicles with raw pings in `window` and no completed batch for that
    /// exact window, largest backlog first (ties by vehicle id).
    pub async fn vehicles_to_process(
        &self,
        window: &TimeWindow,
        limit: u32,
    ) -> Result<Discovered, StoreError> {
        let done: HashSet<i32> = self
            .store
            .completed_vehicle_ids(window)
            .await?
            .into_iter()
            .collect();

        let in_window = self.store.vehicles_in_window(window).await?;
        let registered_in_window = in_window.len();
        let mut vehicles: Vec<VehicleToProcess> = in_window
            .into_iter()
            .filter(|v| !done.contains(&v.vehicle_id))
            .collect();

        vehicles.sort_by(|a, b| {
            b.estimated_rows
                .cmp(&a.estimated_rows)
                .then(a.vehicle_id.cmp(&b.vehicle_id))
        });
        vehicles.truncate(limit as usize);

        debug!(
            window = %window,
            vehicles = vehicles.len(),
            registered = registered_in_window,
            already_done = done.len(),
            "[Discovery] vehicles to process"
        );
        Ok(Discovered {
            vehicles,
            registered_in_window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BatchStore, InMemoryStore};
    use crate::types::RawPing;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, h, m, 0).unwrap()
    }

    fn pings(garage: &str, n: u32) -> Vec<RawPing> {
        (0..n)
            .map(|i| RawPing {
                time: at(10, i),
                vehicle_id: None,
                garage_no: garage.into(),
                lat: 44.0,
                lng: 20.0,
                speed: 0.0,
                course: 0.0,
                altitude: 0.0,
                state: 0,
                in_route: false,
                source: "test".into(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_orders_by_backlog_and_skips_completed() {
        let store = Arc::new(InMemoryStore::new());
        for (id, garage) in [(1, "A"), (2, "B"), (3, "C"), (4, "D"), (5, "UNUSED")] {
            store.register_vehicle(id, garage);
        }
        store.insert_raw(pings("A", 3));
        store.insert_raw(pings("B", 10));
        store.insert_raw(pings("C", 3));
        store.insert_raw(pings("D", 20));
        store.insert_raw(pings("UNREGISTERED", 50));

        let window = TimeWindow::new(at(10, 0), at(11, 0)).unwrap();
        let id = store.create_pending(&window, Some(4)).await.unwrap();
        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();
        store.complete(id, "w", 20, 0, 0.1).await.unwrap();

        let discovery = VehicleDiscovery::new(store.clone());
        let found = discovery.vehicles_to_process(&window, 100).await.unwrap();
        let ids: Vec<i32> = found.vehicles.iter().map(|v| v.vehicle_id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert_eq!(found.vehicles[0].estimated_rows, 10);
        // D is done but still counts as registered in the window
        assert_eq!(found.registered_in_window, 4);

        let limited = discovery.vehicles_to_process(&window, 2).await.unwrap();
        assert_eq!(limited.vehicles.len(), 2);
    }

    #[tokio::test]
    async fn test_fully_completed_window_still_reports_registered() {
        let store = Arc::new(InMemoryStore::new());
        store.register_vehicle(1, "A");
        store.insert_raw(pings("A", 2));

        let window = TimeWindow::new(at(10, 0), at(11, 0)).unwrap();
        let id = store.create_pending(&window, Some(1)).await.unwrap();
        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();
        store.complete(id, "w", 2, 0, 0.1).await.unwrap();

        let found = VehicleDiscovery::new(store.clone())
            .vehicles_to_process(&window, 100)
            .await
            .unwrap();
        assert!(found.vehicles.is_empty());
        assert_eq!(found.registered_in_window, 1);
    }
}
