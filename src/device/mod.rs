pub mod cache;
pub mod simulated;

pub use cache::Cached;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rates::RateWindow;

/// Adapter failure taxonomy. The core never aborts a tick on adapter
/// failure; each kind maps to a degradation policy.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// One-off failure; retry next tick, last-good value stays usable.
    #[error("transient adapter failure: {0}")]
    Transient(String),
    /// Repeated failures; data older than TTL. Dependent decisions take
    /// their conservative branch.
    #[error("adapter data stale ({age_secs}s old)")]
    Stale { age_secs: u64 },
    /// Adapter is gone; the owning device enters its error state until an
    /// operator resets it.
    #[error("fatal adapter failure: {0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Fatal(_))
    }
}

pub type DeviceResult<T> = Result<T, AdapterError>;

/// Signed instantaneous power in W. Import positive for grid meters,
/// charge positive for batteries.
#[async_trait]
pub trait PowerSource: Send + Sync {
    async fn power(&self) -> DeviceResult<f64>;
}

/// Monotone non-decreasing cumulative energy in kWh.
#[async_trait]
pub trait EnergySource: Send + Sync {
    async fn energy(&self) -> DeviceResult<f64>;
}

/// Per-phase RMS currents in A, positive for import.
#[async_trait]
pub trait PhaseCurrents: Send + Sync {
    async fn currents(&self) -> DeviceResult<[f64; 3]>;
}

/// Vehicle or battery state of charge. May fail transiently; callers cache
/// the last good value with its age.
#[async_trait]
pub trait SocReader: Send + Sync {
    async fn soc(&self) -> DeviceResult<f64>;
    fn capacity_kwh(&self) -> f64;
}

/// IEC 61851 control pilot status as reported by the charger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerStatus {
    /// Disconnected.
    A,
    /// Connected, not charging.
    B,
    /// Charging.
    C,
    /// Error (ventilation / pilot fault).
    E,
    /// Error (no power available).
    F,
}

impl ChargerStatus {
    pub fn connected(self) -> bool {
        matches!(self, ChargerStatus::B | ChargerStatus::C)
    }

    pub fn charging(self) -> bool {
        self == ChargerStatus::C
    }

    pub fn faulted(self) -> bool {
        matches!(self, ChargerStatus::E | ChargerStatus::F)
    }
}

impl std::fmt::Display for ChargerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[async_trait]
pub trait Charger: Send + Sync {
    async fn status(&self) -> DeviceResult<ChargerStatus>;
    async fn enabled(&self) -> DeviceResult<bool>;
    async fn enable(&self, on: bool) -> DeviceResult<()>;
    /// Command the maximum current per phase. The device rounds to its own
    /// resolution; the caller floors beforehand.
    async fn max_current(&self, amps: f64) -> DeviceResult<()>;
}

/// Chargers capable of switching between 1- and 3-phase delivery. The
/// contract mandates the switch completes before the next current command;
/// callers disable the charger and respect the power-off dwell first.
#[async_trait]
pub trait PhaseSwitcher: Send + Sync {
    async fn phases_1p3p(&self, phases: u8) -> DeviceResult<()>;
}

/// Home battery operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatteryMode {
    /// Behave per inverter default.
    Normal,
    /// Neither charge nor discharge.
    Hold,
    /// Charge from any source up to target.
    ForcedCharge,
}

impl std::fmt::Display for BatteryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatteryMode::Normal => write!(f, "normal"),
            BatteryMode::Hold => write!(f, "hold"),
            BatteryMode::ForcedCharge => write!(f, "forcedCharge"),
        }
    }
}

/// Battery mode control. `set_mode` is idempotent and reasserted
/// periodically for devices with a watchdog.
#[async_trait]
pub trait BatteryControl: Send + Sync {
    async fn set_mode(&self, mode: BatteryMode) -> DeviceResult<()>;
}

/// Electricity price intervals, refreshed asynchronously by the provider.
#[async_trait]
pub trait TariffProvider: Send + Sync {
    async fn rates(&self) -> DeviceResult<RateWindow>;
}

/// Solar generation forecast intervals, values in W.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn forecast(&self) -> DeviceResult<RateWindow>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_predicates() {
        assert!(!ChargerStatus::A.connected());
        assert!(ChargerStatus::B.connected());
        assert!(!ChargerStatus::B.charging());
        assert!(ChargerStatus::C.charging());
        assert!(ChargerStatus::C.connected());
        assert!(ChargerStatus::E.faulted());
        assert!(ChargerStatus::F.faulted());
    }

    #[test]
    fn battery_mode_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&BatteryMode::ForcedCharge).unwrap(),
            "\"forcedCharge\""
        );
        assert_eq!(BatteryMode::ForcedCharge.to_string(), "forcedCharge");
    }
}
