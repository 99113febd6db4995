use std::sync::Arc;

use crate::device::{DeviceResult, SocReader};

/// SoC distance within which an observed charger-side SoC counts as a match
/// for a known vehicle.
const SOC_MATCH_TOLERANCE: f64 = 5.0;

/// A known vehicle: an optional SoC source plus per-vehicle charging
/// settings. Bound to at most one loadpoint at a time; rebinding happens
/// only at a tick boundary.
pub struct Vehicle {
    pub name: String,
    pub title: String,
    pub capacity_kwh: f64,
    /// Below this SoC the vehicle charges regardless of surplus.
    pub min_soc_percent: f64,
    /// Default charge target.
    pub limit_soc_percent: f64,
    soc_reader: Option<Arc<dyn SocReader>>,
}

impl Vehicle {
    pub fn new(name: impl Into<String>, title: impl Into<String>, capacity_kwh: f64) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            capacity_kwh,
            min_soc_percent: 0.0,
            limit_soc_percent: 100.0,
            soc_reader: None,
        }
    }

    pub fn with_soc_reader(mut self, reader: Arc<dyn SocReader>) -> Self {
        self.soc_reader = Some(reader);
        self
    }

    pub fn with_min_soc(mut self, percent: f64) -> Self {
        self.min_soc_percent = percent.clamp(0.0, 100.0);
        self
    }

    pub fn with_limit_soc(mut self, percent: f64) -> Self {
        self.limit_soc_percent = percent.clamp(0.0, 100.0);
        self
    }

    pub fn has_soc_reader(&self) -> bool {
        self.soc_reader.is_some()
    }

    pub async fn soc(&self) -> Option<DeviceResult<f64>> {
        match &self.soc_reader {
            Some(reader) => Some(reader.soc().await),
            None => None,
        }
    }
}

impl std::fmt::Debug for Vehicle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vehicle")
            .field("name", &self.name)
            .field("capacity_kwh", &self.capacity_kwh)
            .field("min_soc_percent", &self.min_soc_percent)
            .field("limit_soc_percent", &self.limit_soc_percent)
            .finish()
    }
}

/// Resolve which known vehicle is plugged in.
///
/// Ordering: explicit selection wins, then the first configured vehicle
/// whose last known SoC lies within tolerance of the charger-observed SoC,
/// then the default (first configured). Config order makes overlapping SoC
/// matches deterministic.
pub fn detect_vehicle(
    vehicles: &[(Arc<Vehicle>, Option<f64>)],
    explicit: Option<&str>,
    observed_soc: Option<f64>,
) -> Option<Arc<Vehicle>> {
    if let Some(name) = explicit {
        if let Some((vehicle, _)) = vehicles.iter().find(|(v, _)| v.name == name) {
            return Some(vehicle.clone());
        }
    }

    if let Some(observed) = observed_soc {
        for (vehicle, last_soc) in vehicles {
            if let Some(soc) = last_soc {
                if (soc - observed).abs() <= SOC_MATCH_TOLERANCE {
                    return Some(vehicle.clone());
                }
            }
        }
    }

    vehicles.first().map(|(v, _)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> Vec<(Arc<Vehicle>, Option<f64>)> {
        vec![
            (Arc::new(Vehicle::new("ioniq", "Ioniq 5", 72.6)), Some(40.0)),
            (Arc::new(Vehicle::new("zoe", "Zoe", 52.0)), Some(78.0)),
        ]
    }

    #[test]
    fn explicit_selection_wins() {
        let vehicles = fleet();
        let found = detect_vehicle(&vehicles, Some("zoe"), Some(41.0)).unwrap();
        assert_eq!(found.name, "zoe");
    }

    #[test]
    fn soc_match_beats_default() {
        let vehicles = fleet();
        let found = detect_vehicle(&vehicles, None, Some(76.0)).unwrap();
        assert_eq!(found.name, "zoe");
    }

    #[test]
    fn overlapping_matches_resolve_by_config_order() {
        let mut vehicles = fleet();
        vehicles[1].1 = Some(42.0);
        let found = detect_vehicle(&vehicles, None, Some(41.0)).unwrap();
        assert_eq!(found.name, "ioniq");
    }

    #[test]
    fn falls_back_to_first_configured() {
        let vehicles = fleet();
        let found = detect_vehicle(&vehicles, None, None).unwrap();
        assert_eq!(found.name, "ioniq");
        assert!(detect_vehicle(&[], None, None).is_none());
    }
}
