use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use chargeflow::config::AppConfig;
use chargeflow::device::simulated::{
    SimulatedBattery, SimulatedCharger, SimulatedMeter, SimulatedVehicleSoc,
};
use chargeflow::loadpoint::Loadpoint;
use chargeflow::settings::Settings;
use chargeflow::site::{Site, SiteBattery, SiteMeter};
use chargeflow::vehicle::Vehicle;
use chargeflow::{telemetry, EventBus};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    telemetry::init_tracing(&cfg.telemetry.log_level);

    let settings = match &cfg.settings_path {
        Some(path) => Settings::open(path),
        None => Settings::open("chargeflow-settings.json"),
    };
    let bus = Arc::new(EventBus::default());

    // Simulated devices stand in for real adapters; the embedding host
    // wires in hardware-backed implementations of the same capabilities.
    let grid = Arc::new(SimulatedMeter::new(-2500.0));
    let pv = Arc::new(SimulatedMeter::new(4000.0));
    let battery = Arc::new(SimulatedBattery::new(65.0, 10.0));

    let mut builder = Site::builder(cfg.site_tunables())
        .grid(SiteMeter::new("grid", grid.clone()))
        .pv(SiteMeter::new("pv1", pv.clone()).with_energy(pv.clone()))
        .battery(SiteBattery {
            name: "home".into(),
            power: battery.clone(),
            soc: battery.clone(),
            control: Some(battery.clone()),
        });

    for vehicle_cfg in &cfg.vehicles {
        let soc = Arc::new(SimulatedVehicleSoc::new(50.0, vehicle_cfg.capacity_kwh));
        builder = builder.vehicle(Arc::new(
            Vehicle::new(
                vehicle_cfg.name.clone(),
                vehicle_cfg.title.clone(),
                vehicle_cfg.capacity_kwh,
            )
            .with_soc_reader(soc)
            .with_min_soc(vehicle_cfg.min_soc_percent)
            .with_limit_soc(vehicle_cfg.limit_soc_percent),
        ));
    }

    for lp_cfg in &cfg.loadpoints {
        let charger = Arc::new(SimulatedCharger::new(lp_cfg.voltage_v));
        charger.connect().await;
        let loadpoint = Loadpoint::new(lp_cfg.name.clone(), charger.clone(), lp_cfg.tunables())
            .with_phase_switcher(charger.clone())
            .with_charge_meter(charger.clone())
            .with_energy_meter(charger);
        builder = builder.loadpoint(loadpoint);
    }

    let (site, _commands) = builder.build(settings, bus.clone());

    // Mirror telemetry to the log so a bare binary shows what it decides.
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(key = %event.key, value = %event.value, "telemetry");
        }
    });

    info!("starting chargeflow site controller");
    site.run(telemetry::shutdown_signal()).await;
    info!("shutdown complete");
    Ok(())
}
