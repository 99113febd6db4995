#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use chargeflow::bus::EventBus;
use chargeflow::device::simulated::{
    SimulatedBattery, SimulatedCharger, SimulatedMeter, StaticRates,
};
use chargeflow::loadpoint::{ChargeMode, Loadpoint, LoadpointTunables};
use chargeflow::rates::{Rate, RateWindow};
use chargeflow::settings::Settings;
use chargeflow::site::{CommandHandle, Site, SiteBattery, SiteMeter, SiteTunables};

/// A fully simulated site with one loadpoint, one PV meter, one battery,
/// and a static tariff. Tick times are fabricated from a fixed origin so
/// tests control every timer deterministically.
pub struct SimSite {
    pub site: Site,
    pub handle: CommandHandle,
    pub grid: Arc<SimulatedMeter>,
    pub pv: Arc<SimulatedMeter>,
    pub battery: Arc<SimulatedBattery>,
    pub charger: Arc<SimulatedCharger>,
    pub tariff: Arc<StaticRates>,
    pub bus: Arc<EventBus>,
    pub start: Instant,
    pub wall: DateTime<Utc>,
}

pub fn wall_origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

/// Hourly rate window starting at the wall origin.
pub fn hourly_rates(values: &[f64]) -> RateWindow {
    RateWindow::new(
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Rate::new(
                    wall_origin() + chrono::Duration::hours(i as i64),
                    wall_origin() + chrono::Duration::hours(i as i64 + 1),
                    *v,
                )
            })
            .collect(),
    )
    .unwrap()
}

pub fn fast_lp_tunables(mode: ChargeMode) -> LoadpointTunables {
    LoadpointTunables {
        mode,
        phases: 3,
        enable_delay: Duration::ZERO,
        disable_delay: Duration::ZERO,
        ..LoadpointTunables::default()
    }
}

pub async fn build_sim_site(
    tunables: SiteTunables,
    lp_tunables: LoadpointTunables,
    settings: Settings,
) -> SimSite {
    let grid = Arc::new(SimulatedMeter::new(0.0));
    let pv = Arc::new(SimulatedMeter::new(0.0));
    let battery = Arc::new(SimulatedBattery::new(50.0, 10.0));
    let charger = Arc::new(SimulatedCharger::default());
    let tariff = Arc::new(StaticRates::new(RateWindow::empty()));
    let bus = Arc::new(EventBus::default());

    charger.connect().await;

    let loadpoint = Loadpoint::new("garage", charger.clone(), lp_tunables)
        .with_phase_switcher(charger.clone())
        .with_charge_meter(charger.clone())
        .with_energy_meter(charger.clone());

    let (site, handle) = Site::builder(tunables)
        .grid(SiteMeter::new("grid", grid.clone()))
        .pv(SiteMeter::new("pv1", pv.clone()))
        .battery(SiteBattery {
            name: "home".into(),
            power: battery.clone(),
            soc: battery.clone(),
            control: Some(battery.clone()),
        })
        .tariff(tariff.clone())
        .forecast(tariff.clone())
        .loadpoint(loadpoint)
        .build(settings, bus.clone());

    SimSite {
        site,
        handle,
        grid,
        pv,
        battery,
        charger,
        tariff,
        bus,
        start: Instant::now(),
        wall: wall_origin(),
    }
}

impl SimSite {
    /// Run one tick at `offset` past the origin.
    pub async fn tick_at(&mut self, offset: Duration) {
        let wall = self.wall + chrono::Duration::milliseconds(offset.as_millis() as i64);
        self.site.tick(self.start + offset, wall).await;
    }

    /// Model a PV plant exporting `export_w` beyond household needs while
    /// the charger draws whatever it draws: grid and PV readings stay
    /// physically consistent across ticks.
    pub async fn set_export(&self, export_w: f64) {
        let charge = self.charger.charge_power_w().await;
        self.grid.set_power(-export_w + charge).await;
        self.pv.set_power(export_w + charge).await;
    }
}
