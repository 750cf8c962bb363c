use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::store::{FuelEvent, GarageStore};

/// Liters per 100 km between two chronologically ordered refuels of the
/// same vehicle. Defined only when the mileage strictly increased; anything
/// else (missing readings, odometer swap) reports as unavailable.
pub fn consumption_between(earlier: &FuelEvent, later: &FuelEvent) -> Option<f64> {
    let from = earlier.odometer_km?;
    let to = later.odometer_km?;
    if to <= from {
        return None;
    }
    Some(later.liters / (to - from) * 100.0)
}

/// Average consumption over a chronologically ascending run of refuels:
/// total liters of the later events divided by the distance covered across
/// strictly increasing consecutive readings.
pub fn average_consumption(events_asc: &[FuelEvent]) -> Option<f64> {
    let mut liters = 0.0;
    let mut distance = 0.0;
    for pair in events_asc.windows(2) {
        if let (Some(from), Some(to)) = (pair[0].odometer_km, pair[1].odometer_km) {
            if to > from {
                liters += pair[1].liters;
                distance += to - from;
            }
        }
    }
    if distance > 0.0 {
        Some(liters / distance * 100.0)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VehicleCostSummary {
    pub vehicle_id: i32,
    pub fuel_total: f64,
    pub maintenance_total: f64,
    pub total: f64,
    pub average_consumption: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OwnerSummary {
    pub vehicles: usize,
    pub fuel_total: f64,
    pub maintenance_total: f64,
    pub total: f64,
}

const CONSUMPTION_WINDOW: usize = 10;

pub struct StatisticsAggregator {
    store: Arc<GarageStore>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<GarageStore>) -> Self {
        Self { store }
    }

    pub async fn vehicle_summary(&self, vehicle_id: i32) -> Result<VehicleCostSummary> {
        let fuel_total = self.store.fuel_cost_total(vehicle_id).await?;
        let maintenance_total = self.store.maintenance_cost_total(vehicle_id).await?;
        let mut recent = self
            .store
            .list_fuel_events(vehicle_id, CONSUMPTION_WINDOW)
            .await?;
        recent.reverse(); // listing is newest-first
        Ok(VehicleCostSummary {
            vehicle_id,
            fuel_total,
            maintenance_total,
            total: fuel_total + maintenance_total,
            average_consumption: average_consumption(&recent),
        })
    }

    pub async fn owner_summary(&self, owner_id: &str) -> Result<OwnerSummary> {
        let vehicles = self.store.list_vehicles(owner_id).await?;
        let mut summary = OwnerSummary {
            vehicles: vehicles.len(),
            ..OwnerSummary::default()
        };
        for vehicle in &vehicles {
            summary.fuel_total += self.store.fuel_cost_total(vehicle.id).await?;
            summary.maintenance_total += self.store.maintenance_cost_total(vehicle.id).await?;
        }
        summary.total = summary.fuel_total + summary.maintenance_total;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refuel(occurred_at: i64, odometer_km: Option<f64>, liters: f64) -> FuelEvent {
        FuelEvent {
            id: 0,
            vehicle_id: 1,
            occurred_at,
            odometer_km,
            liters,
            cost: 0.0,
            fuel_type: None,
        }
    }

    #[test]
    fn consumption_between_two_ordered_events() {
        let earlier = refuel(1, Some(10_000.0), 38.0);
        let later = refuel(2, Some(10_500.0), 10.0);
        assert_eq!(consumption_between(&earlier, &later), Some(2.0));
    }

    #[test]
    fn consumption_is_unavailable_without_increasing_mileage() {
        let earlier = refuel(1, Some(10_500.0), 38.0);
        let later = refuel(2, Some(10_500.0), 10.0);
        assert_eq!(consumption_between(&earlier, &later), None);

        let later_below = refuel(2, Some(10_000.0), 10.0);
        assert_eq!(consumption_between(&earlier, &later_below), None);

        let no_reading = refuel(2, None, 10.0);
        assert_eq!(consumption_between(&earlier, &no_reading), None);
    }

    #[test]
    fn average_skips_gaps_and_resets() {
        let events = vec![
            refuel(1, Some(10_000.0), 40.0),
            refuel(2, Some(10_500.0), 10.0),
            refuel(3, None, 35.0),
            refuel(4, Some(10_400.0), 20.0), // odometer reset, ignored
            refuel(5, Some(10_900.0), 10.0),
        ];
        // two valid legs of 500 km each, 10 l apiece
        assert_eq!(average_consumption(&events), Some(2.0));
    }

    #[test]
    fn average_is_unavailable_for_single_event() {
        let events = vec![refuel(1, Some(10_000.0), 40.0)];
        assert_eq!(average_consumption(&events), None);
    }
}
