//! Simulated devices for the demo binary and the scenario tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    AdapterError, BatteryControl, BatteryMode, Charger, ChargerStatus, DeviceResult, EnergySource,
    ForecastProvider, PhaseCurrents, PhaseSwitcher, PowerSource, SocReader, TariffProvider,
};
use crate::rates::RateWindow;

#[derive(Debug, Default)]
struct MeterState {
    power_w: f64,
    energy_kwh: Option<f64>,
    currents_a: [f64; 3],
    fail_reads: u32,
}

/// A meter with settable readings and injectable read failures.
#[derive(Debug, Default)]
pub struct SimulatedMeter {
    state: Arc<RwLock<MeterState>>,
}

impl SimulatedMeter {
    pub fn new(power_w: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(MeterState {
                power_w,
                ..MeterState::default()
            })),
        }
    }

    pub async fn set_power(&self, power_w: f64) {
        self.state.write().await.power_w = power_w;
    }

    pub async fn set_energy(&self, energy_kwh: f64) {
        self.state.write().await.energy_kwh = Some(energy_kwh);
    }

    pub async fn set_currents(&self, currents_a: [f64; 3]) {
        self.state.write().await.currents_a = currents_a;
    }

    /// Make the next `n` reads fail transiently.
    pub async fn fail_next(&self, n: u32) {
        self.state.write().await.fail_reads = n;
    }

    async fn check_failure(&self) -> DeviceResult<()> {
        let mut state = self.state.write().await;
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(AdapterError::Transient("injected read failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PowerSource for SimulatedMeter {
    async fn power(&self) -> DeviceResult<f64> {
        self.check_failure().await?;
        Ok(self.state.read().await.power_w)
    }
}

#[async_trait]
impl EnergySource for SimulatedMeter {
    async fn energy(&self) -> DeviceResult<f64> {
        self.check_failure().await?;
        self.state
            .read()
            .await
            .energy_kwh
            .ok_or_else(|| AdapterError::Fatal("meter has no energy counter".into()))
    }
}

#[async_trait]
impl PhaseCurrents for SimulatedMeter {
    async fn currents(&self) -> DeviceResult<[f64; 3]> {
        self.check_failure().await?;
        Ok(self.state.read().await.currents_a)
    }
}

#[derive(Debug)]
struct ChargerSimState {
    connected: bool,
    vehicle_ready: bool,
    enabled: bool,
    max_current_a: f64,
    phases: u8,
    energy_kwh: f64,
    faulted: bool,
}

/// A charger following the IEC status model: A when no vehicle, B when
/// connected, C while enabled with a vehicle that accepts charge.
#[derive(Debug)]
pub struct SimulatedCharger {
    state: Arc<RwLock<ChargerSimState>>,
    voltage_v: f64,
}

impl Default for SimulatedCharger {
    fn default() -> Self {
        Self::new(230.0)
    }
}

impl SimulatedCharger {
    pub fn new(voltage_v: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(ChargerSimState {
                connected: false,
                vehicle_ready: true,
                enabled: false,
                max_current_a: 0.0,
                phases: 3,
                energy_kwh: 0.0,
                faulted: false,
            })),
            voltage_v,
        }
    }

    pub async fn connect(&self) {
        self.state.write().await.connected = true;
    }

    pub async fn disconnect(&self) {
        let mut state = self.state.write().await;
        state.connected = false;
        state.enabled = false;
    }

    pub async fn set_vehicle_ready(&self, ready: bool) {
        self.state.write().await.vehicle_ready = ready;
    }

    pub async fn set_faulted(&self, faulted: bool) {
        self.state.write().await.faulted = faulted;
    }

    /// Integrate the charging power over `hours` into the energy counter.
    pub async fn advance(&self, hours: f64) {
        let mut state = self.state.write().await;
        if state.enabled && state.connected && state.vehicle_ready {
            let power_w = state.max_current_a * self.voltage_v * state.phases as f64;
            state.energy_kwh += power_w * hours / 1000.0;
        }
    }

    pub async fn charge_power_w(&self) -> f64 {
        let state = self.state.read().await;
        if state.enabled && state.connected && state.vehicle_ready {
            state.max_current_a * self.voltage_v * state.phases as f64
        } else {
            0.0
        }
    }

    pub async fn active_phases(&self) -> u8 {
        self.state.read().await.phases
    }
}

#[async_trait]
impl Charger for SimulatedCharger {
    async fn status(&self) -> DeviceResult<ChargerStatus> {
        let state = self.state.read().await;
        if state.faulted {
            return Ok(ChargerStatus::F);
        }
        Ok(if !state.connected {
            ChargerStatus::A
        } else if state.enabled && state.vehicle_ready && state.max_current_a > 0.0 {
            ChargerStatus::C
        } else {
            ChargerStatus::B
        })
    }

    async fn enabled(&self) -> DeviceResult<bool> {
        Ok(self.state.read().await.enabled)
    }

    async fn enable(&self, on: bool) -> DeviceResult<()> {
        self.state.write().await.enabled = on;
        Ok(())
    }

    async fn max_current(&self, amps: f64) -> DeviceResult<()> {
        if amps < 0.0 {
            return Err(AdapterError::Transient(format!(
                "current {amps}A out of range"
            )));
        }
        self.state.write().await.max_current_a = amps;
        Ok(())
    }
}

#[async_trait]
impl PowerSource for SimulatedCharger {
    async fn power(&self) -> DeviceResult<f64> {
        Ok(self.charge_power_w().await)
    }
}

#[async_trait]
impl EnergySource for SimulatedCharger {
    async fn energy(&self) -> DeviceResult<f64> {
        Ok(self.state.read().await.energy_kwh)
    }
}

#[async_trait]
impl PhaseSwitcher for SimulatedCharger {
    async fn phases_1p3p(&self, phases: u8) -> DeviceResult<()> {
        if phases != 1 && phases != 3 {
            return Err(AdapterError::Transient(format!("invalid phases {phases}")));
        }
        let mut state = self.state.write().await;
        if state.enabled {
            return Err(AdapterError::Transient(
                "phase switch while enabled refused".into(),
            ));
        }
        state.phases = phases;
        Ok(())
    }
}

#[derive(Debug)]
struct BatterySimState {
    soc_percent: f64,
    power_w: f64,
    mode: BatteryMode,
}

/// A home battery exposing power, SoC, and mode control.
#[derive(Debug)]
pub struct SimulatedBattery {
    state: Arc<RwLock<BatterySimState>>,
    capacity_kwh: f64,
}

impl SimulatedBattery {
    pub fn new(soc_percent: f64, capacity_kwh: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(BatterySimState {
                soc_percent,
                power_w: 0.0,
                mode: BatteryMode::Normal,
            })),
            capacity_kwh,
        }
    }

    pub async fn set_soc(&self, soc_percent: f64) {
        self.state.write().await.soc_percent = soc_percent.clamp(0.0, 100.0);
    }

    pub async fn set_power(&self, power_w: f64) {
        self.state.write().await.power_w = power_w;
    }

    pub async fn mode(&self) -> BatteryMode {
        self.state.read().await.mode
    }
}

#[async_trait]
impl PowerSource for SimulatedBattery {
    async fn power(&self) -> DeviceResult<f64> {
        Ok(self.state.read().await.power_w)
    }
}

#[async_trait]
impl SocReader for SimulatedBattery {
    async fn soc(&self) -> DeviceResult<f64> {
        Ok(self.state.read().await.soc_percent)
    }

    fn capacity_kwh(&self) -> f64 {
        self.capacity_kwh
    }
}

#[async_trait]
impl BatteryControl for SimulatedBattery {
    async fn set_mode(&self, mode: BatteryMode) -> DeviceResult<()> {
        self.state.write().await.mode = mode;
        Ok(())
    }
}

/// A vehicle SoC source with settable readings.
#[derive(Debug)]
pub struct SimulatedVehicleSoc {
    soc_percent: Arc<RwLock<f64>>,
    capacity_kwh: f64,
}

impl SimulatedVehicleSoc {
    pub fn new(soc_percent: f64, capacity_kwh: f64) -> Self {
        Self {
            soc_percent: Arc::new(RwLock::new(soc_percent)),
            capacity_kwh,
        }
    }

    pub async fn set_soc(&self, soc_percent: f64) {
        *self.soc_percent.write().await = soc_percent.clamp(0.0, 100.0);
    }
}

#[async_trait]
impl SocReader for SimulatedVehicleSoc {
    async fn soc(&self) -> DeviceResult<f64> {
        Ok(*self.soc_percent.read().await)
    }

    fn capacity_kwh(&self) -> f64 {
        self.capacity_kwh
    }
}

/// A tariff/forecast source serving a replaceable window snapshot.
#[derive(Debug, Default)]
pub struct StaticRates {
    window: Arc<RwLock<RateWindow>>,
}

impl StaticRates {
    pub fn new(window: RateWindow) -> Self {
        Self {
            window: Arc::new(RwLock::new(window)),
        }
    }

    pub async fn replace(&self, window: RateWindow) {
        *self.window.write().await = window;
    }
}

#[async_trait]
impl TariffProvider for StaticRates {
    async fn rates(&self) -> DeviceResult<RateWindow> {
        Ok(self.window.read().await.clone())
    }
}

#[async_trait]
impl ForecastProvider for StaticRates {
    async fn forecast(&self) -> DeviceResult<RateWindow> {
        Ok(self.window.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn charger_follows_status_model() {
        let charger = SimulatedCharger::default();
        assert_eq!(charger.status().await.unwrap(), ChargerStatus::A);

        charger.connect().await;
        assert_eq!(charger.status().await.unwrap(), ChargerStatus::B);

        charger.enable(true).await.unwrap();
        charger.max_current(16.0).await.unwrap();
        assert_eq!(charger.status().await.unwrap(), ChargerStatus::C);
        assert_eq!(charger.charge_power_w().await, 16.0 * 230.0 * 3.0);

        charger.disconnect().await;
        assert_eq!(charger.status().await.unwrap(), ChargerStatus::A);
    }

    #[tokio::test]
    async fn phase_switch_refused_while_enabled() {
        let charger = SimulatedCharger::default();
        charger.connect().await;
        charger.enable(true).await.unwrap();
        assert!(charger.phases_1p3p(1).await.is_err());

        charger.enable(false).await.unwrap();
        charger.phases_1p3p(1).await.unwrap();
        assert_eq!(charger.active_phases().await, 1);
    }

    #[tokio::test]
    async fn meter_failure_injection() {
        let meter = SimulatedMeter::default();
        meter.set_power(1200.0).await;
        meter.fail_next(1).await;
        assert!(meter.power().await.is_err());
        assert_eq!(meter.power().await.unwrap(), 1200.0);
    }

    #[tokio::test]
    async fn charger_energy_counter_integrates() {
        let charger = SimulatedCharger::default();
        charger.connect().await;
        charger.enable(true).await.unwrap();
        charger.max_current(10.0).await.unwrap();
        charger.advance(1.0).await;
        let energy = charger.energy().await.unwrap();
        assert!((energy - 6.9).abs() < 1e-9);
    }
}
