pub mod battery;
pub mod commands;

pub use battery::{BatteryModeConfig, BatteryModeController, BatteryModeInputs};
pub use commands::{command_channel, BatteryModeRequest, Command, CommandHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::device::{
    BatteryControl, BatteryMode, Cached, EnergySource, ForecastProvider, PowerSource, SocReader,
    TariffProvider,
};
use crate::energy::EnergyAccumulator;
use crate::loadpoint::{Loadpoint, LoadpointSnapshot};
use crate::planner::{PlanStrategy, Planner};
use crate::rates::RateWindow;
use crate::settings::{keys, Settings};
use crate::vehicle::{detect_vehicle, Vehicle};

/// Battery watchdog: the active mode is reasserted every this many ticks.
const BATTERY_HEARTBEAT_TICKS: u64 = 30;

/// Site-level tunables.
#[derive(Debug, Clone)]
pub struct SiteTunables {
    /// Configured home baseline subtracted from the measured surplus.
    pub residual_power_w: f64,
    /// Import ceiling for grid-backed allocations.
    pub max_grid_import_w: f64,
    /// Power-balance residual beyond which a snapshot counts as inconsistent.
    pub tolerance_w: f64,
    pub tick: Duration,
    pub read_timeout: Duration,
    pub command_timeout: Duration,
    pub planner_strategy: PlanStrategy,
    /// Battery discharge is held below this SoC while loadpoints charge.
    pub buffer_soc: f64,
    /// Battery discharge supports vehicle charging only above this SoC
    /// (0 = disabled, fall back to `buffer_soc`).
    pub buffer_start_soc: f64,
    /// Below this SoC the home battery outranks loadpoints for surplus.
    pub priority_soc: f64,
    /// Battery mode control enabled at all.
    pub discharge_control: bool,
    pub battery: BatteryModeConfig,
}

impl Default for SiteTunables {
    fn default() -> Self {
        Self {
            residual_power_w: 0.0,
            max_grid_import_w: 25_000.0,
            tolerance_w: 500.0,
            tick: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
            planner_strategy: PlanStrategy::Late,
            buffer_soc: 0.0,
            buffer_start_soc: 0.0,
            priority_soc: 0.0,
            discharge_control: true,
            battery: BatteryModeConfig::default(),
        }
    }
}

/// A named power meter, optionally with a cumulative energy counter.
pub struct SiteMeter {
    pub name: String,
    pub power: Arc<dyn PowerSource>,
    pub energy: Option<Arc<dyn EnergySource>>,
}

impl SiteMeter {
    pub fn new(name: impl Into<String>, power: Arc<dyn PowerSource>) -> Self {
        Self {
            name: name.into(),
            power,
            energy: None,
        }
    }

    pub fn with_energy(mut self, energy: Arc<dyn EnergySource>) -> Self {
        self.energy = Some(energy);
        self
    }
}

/// A home battery aggregate member.
pub struct SiteBattery {
    pub name: String,
    pub power: Arc<dyn PowerSource>,
    pub soc: Arc<dyn SocReader>,
    pub control: Option<Arc<dyn BatteryControl>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct MeterReading {
    power_w: Option<f64>,
    energy_kwh: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatteryReading {
    power_w: Option<f64>,
    soc: Option<f64>,
}

/// Builder for a [`Site`]. `build` materialises the per-meter accumulator
/// slots first and only then restores persisted settings into them.
pub struct SiteBuilder {
    tunables: SiteTunables,
    grid: Option<SiteMeter>,
    pv: Vec<SiteMeter>,
    aux: Vec<SiteMeter>,
    batteries: Vec<SiteBattery>,
    tariff: Option<Arc<dyn TariffProvider>>,
    forecast: Option<Arc<dyn ForecastProvider>>,
    loadpoints: Vec<Loadpoint>,
    vehicles: Vec<Arc<Vehicle>>,
}

impl SiteBuilder {
    pub fn new(tunables: SiteTunables) -> Self {
        Self {
            tunables,
            grid: None,
            pv: Vec::new(),
            aux: Vec::new(),
            batteries: Vec::new(),
            tariff: None,
            forecast: None,
            loadpoints: Vec::new(),
            vehicles: Vec::new(),
        }
    }

    pub fn grid(mut self, meter: SiteMeter) -> Self {
        self.grid = Some(meter);
        self
    }

    pub fn pv(mut self, meter: SiteMeter) -> Self {
        self.pv.push(meter);
        self
    }

    pub fn aux(mut self, meter: SiteMeter) -> Self {
        self.aux.push(meter);
        self
    }

    pub fn battery(mut self, battery: SiteBattery) -> Self {
        self.batteries.push(battery);
        self
    }

    pub fn tariff(mut self, tariff: Arc<dyn TariffProvider>) -> Self {
        self.tariff = Some(tariff);
        self
    }

    pub fn forecast(mut self, forecast: Arc<dyn ForecastProvider>) -> Self {
        self.forecast = Some(forecast);
        self
    }

    pub fn loadpoint(mut self, loadpoint: Loadpoint) -> Self {
        self.loadpoints.push(loadpoint);
        self
    }

    pub fn vehicle(mut self, vehicle: Arc<Vehicle>) -> Self {
        self.vehicles.push(vehicle);
        self
    }

    pub fn build(self, settings: Settings, bus: Arc<EventBus>) -> (Site, CommandHandle) {
        let (handle, cmd_rx) = command_channel(64);

        // Accumulator slots exist per configured PV meter before any
        // restoration runs; the restore step only writes into present slots.
        let pv_energy = self
            .pv
            .iter()
            .map(|m| (m.name.clone(), EnergyAccumulator::new()))
            .collect();

        let battery_mode = BatteryModeController::new(self.tunables.battery.clone());
        let mut site = Site {
            tunables: self.tunables,
            grid: self.grid,
            pv: self.pv,
            aux: self.aux,
            batteries: self.batteries,
            tariff: self.tariff,
            forecast: self.forecast,
            loadpoints: self.loadpoints,
            vehicles: self.vehicles,
            vehicle_socs: Vec::new(),
            planner: Planner::default(),
            battery_mode,
            pv_energy,
            fcst_energy: EnergyAccumulator::new(),
            settings,
            bus,
            cmd_rx,
            tick_counter: 0,
            grid_cache: Cached::new(Duration::from_secs(30)),
            committed_battery_mode: None,
            rates_snapshot: None,
            forecast_snapshot: None,
        };
        site.planner = Planner::new(site.tunables.planner_strategy);
        site.vehicle_socs = vec![None; site.vehicles.len()];
        site.restore_settings();
        (site, handle)
    }
}

/// The site aggregate: once per tick it snapshots all meters, balances
/// power, decides the battery mode, apportions surplus across loadpoints,
/// and commits the resulting setpoints.
pub struct Site {
    tunables: SiteTunables,
    grid: Option<SiteMeter>,
    pv: Vec<SiteMeter>,
    aux: Vec<SiteMeter>,
    batteries: Vec<SiteBattery>,
    tariff: Option<Arc<dyn TariffProvider>>,
    forecast: Option<Arc<dyn ForecastProvider>>,
    loadpoints: Vec<Loadpoint>,
    vehicles: Vec<Arc<Vehicle>>,
    vehicle_socs: Vec<Option<f64>>,

    planner: Planner,
    battery_mode: BatteryModeController,
    pv_energy: HashMap<String, EnergyAccumulator>,
    fcst_energy: EnergyAccumulator,
    settings: Settings,
    bus: Arc<EventBus>,
    cmd_rx: mpsc::Receiver<Command>,

    tick_counter: u64,
    grid_cache: Cached<f64>,
    committed_battery_mode: Option<BatteryMode>,
    rates_snapshot: Option<RateWindow>,
    forecast_snapshot: Option<RateWindow>,
}

impl Site {
    pub fn builder(tunables: SiteTunables) -> SiteBuilder {
        SiteBuilder::new(tunables)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn loadpoints(&self) -> &[Loadpoint] {
        &self.loadpoints
    }

    pub fn battery_mode(&self) -> BatteryMode {
        self.battery_mode.mode()
    }

    pub fn settings(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn fcst_energy_kwh(&self) -> f64 {
        self.fcst_energy.accumulated_kwh()
    }

    pub fn pv_energy_kwh(&self, meter: &str) -> Option<f64> {
        self.pv_energy.get(meter).map(|a| a.accumulated_kwh())
    }

    /// Run the tick loop until `shutdown` resolves. Settings are flushed a
    /// final time on the way out.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.tunables.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            loadpoints = self.loadpoints.len(),
            batteries = self.batteries.len(),
            pv_meters = self.pv.len(),
            tick = ?self.tunables.tick,
            "site controller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Instant::now(), Utc::now()).await;
                }
                _ = &mut shutdown => {
                    info!("shutdown requested, cancelling at tick barrier");
                    break;
                }
            }
        }

        if let Err(err) = self.settings.flush() {
            warn!(%err, "final settings flush failed");
        }
    }

    /// One control tick. Nothing in here aborts: every failure degrades
    /// into a conservative branch.
    pub async fn tick(&mut self, now: Instant, wall: DateTime<Utc>) {
        self.tick_counter += 1;

        // 1. Absorb queued commands; the only mutation entry point.
        self.drain_commands();

        // 2. Read barrier: fan out all device reads, bounded per capability.
        let (grid, pv, aux, batteries, lp_snapshots) = self.read_all().await;
        self.refresh_rates().await;
        self.refresh_vehicle_socs().await;

        match grid {
            Some(power) => self.grid_cache.update(power, now),
            None => {
                self.grid_cache.failure();
            }
        }

        // 3. Accumulate energies.
        self.accumulate(&pv, now, wall);

        // 4. Loadpoint state machines absorb their snapshots.
        for (lp, snapshot) in self.loadpoints.iter_mut().zip(&lp_snapshots) {
            lp.observe(snapshot, now, wall);
        }
        self.bind_vehicles(&lp_snapshots);
        for lp in &mut self.loadpoints {
            lp.replan(&self.planner, self.rates_snapshot.as_ref(), wall);
        }

        // 5. Balance.
        let pv_w: f64 = pv
            .iter()
            .filter_map(|r| r.power_w)
            .map(|p| p.max(0.0))
            .sum();
        let aux_w: f64 = aux.iter().filter_map(|r| r.power_w).sum();
        let battery_w: f64 = batteries.iter().filter_map(|r| r.power_w).sum();
        let battery_soc = self.aggregate_soc(&batteries);
        let lp_power_w: f64 = self.loadpoints.iter().map(Loadpoint::charge_power_w).sum();

        let grid_w = self.grid_cache.get(now).ok();
        let (surplus_w, home_w, conservative) =
            self.balance(grid_w, pv_w, battery_w, lp_power_w);

        // 6. Battery mode.
        let current_price = self
            .rates_snapshot
            .as_ref()
            .and_then(|r| r.at(wall).ok());
        let plan_active = self.loadpoints.iter().any(Loadpoint::plan_active);
        let decided_mode = if self.tunables.discharge_control {
            let inputs = BatteryModeInputs {
                soc: battery_soc,
                current_price,
                rates: self.rates_snapshot.as_ref(),
                plan_active,
                discharging: battery_w < -10.0,
            };
            self.battery_mode.decide(&inputs, wall, now)
        } else {
            BatteryMode::Normal
        };

        // 7. Apportion and commit loadpoint setpoints.
        let surplus_for_lps = self.loadpoint_surplus(surplus_w, battery_w, battery_soc);
        let allocations = self.allocate(surplus_for_lps, grid_w, lp_power_w, conservative);
        for (i, allocated_w) in allocations.iter().enumerate() {
            let lp = &mut self.loadpoints[i];
            let actuation = lp.allocate(*allocated_w, now);
            if !actuation.is_noop() {
                debug!(loadpoint = %lp.name, ?actuation, allocated_w, "commit");
            }
            lp.commit(actuation, self.tunables.command_timeout, now).await;
        }

        // 8. Commit the battery mode on change, reasserted as heartbeat.
        self.commit_battery_mode(decided_mode).await;

        // 9. Publish and persist off the decision path.
        self.publish(grid_w, pv_w, aux_w, battery_w, battery_soc, home_w, wall);
        self.persist();
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.cmd_rx.try_recv() {
            debug!(?command, "command");
            match command {
                Command::SetMode { loadpoint, mode } => {
                    self.with_loadpoint(&loadpoint, |lp| lp.set_mode(mode));
                }
                Command::SetMinCurrent { loadpoint, amps } => {
                    self.with_loadpoint(&loadpoint, |lp| lp.set_min_current(amps));
                }
                Command::SetMaxCurrent { loadpoint, amps } => {
                    self.with_loadpoint(&loadpoint, |lp| lp.set_max_current(amps));
                }
                Command::SetPhases { loadpoint, phases } => {
                    self.with_loadpoint(&loadpoint, |lp| lp.set_phases(phases));
                }
                Command::SetPlan { loadpoint, plan } => {
                    self.with_loadpoint(&loadpoint, |lp| lp.set_plan(plan));
                }
                Command::ClearPlan { loadpoint } => {
                    self.with_loadpoint(&loadpoint, Loadpoint::clear_plan);
                }
                Command::SetPriority { loadpoint, priority } => {
                    self.with_loadpoint(&loadpoint, |lp| lp.set_priority(priority));
                }
                Command::SetBatteryMode { mode } => {
                    self.battery_mode.set_manual(mode.as_override());
                }
                Command::ResetError { loadpoint } => {
                    self.with_loadpoint(&loadpoint, Loadpoint::reset_error);
                }
            }
        }
    }

    fn with_loadpoint(&mut self, name: &str, f: impl FnOnce(&mut Loadpoint)) {
        match self.loadpoints.iter_mut().find(|lp| lp.name == name) {
            Some(lp) => f(lp),
            None => warn!(loadpoint = name, "command for unknown loadpoint"),
        }
    }

    async fn read_all(
        &self,
    ) -> (
        Option<f64>,
        Vec<MeterReading>,
        Vec<MeterReading>,
        Vec<BatteryReading>,
        Vec<LoadpointSnapshot>,
    ) {
        let t = self.tunables.read_timeout;

        let grid_fut = async {
            match &self.grid {
                Some(meter) => read_power(meter.power.as_ref(), t).await,
                None => None,
            }
        };
        let pv_fut = join_all(self.pv.iter().map(|m| read_meter(m, t)));
        let aux_fut = join_all(self.aux.iter().map(|m| read_meter(m, t)));
        let battery_fut = join_all(self.batteries.iter().map(|b| async move {
            BatteryReading {
                power_w: read_power(b.power.as_ref(), t).await,
                soc: match timeout(t, b.soc.soc()).await {
                    Ok(Ok(soc)) => Some(soc),
                    _ => None,
                },
            }
        }));
        let lp_fut = join_all(self.loadpoints.iter().map(|lp| lp.read_devices(t)));

        tokio::join!(grid_fut, pv_fut, aux_fut, battery_fut, lp_fut)
    }

    async fn refresh_rates(&mut self) {
        let t = self.tunables.read_timeout;
        if let Some(tariff) = &self.tariff {
            match timeout(t, tariff.rates()).await {
                Ok(Ok(window)) => self.rates_snapshot = Some(window),
                Ok(Err(err)) => debug!(%err, "tariff refresh failed, keeping snapshot"),
                Err(_) => debug!("tariff refresh timed out, keeping snapshot"),
            }
        }
        if let Some(forecast) = &self.forecast {
            match timeout(t, forecast.forecast()).await {
                Ok(Ok(window)) => self.forecast_snapshot = Some(window),
                Ok(Err(err)) => debug!(%err, "forecast refresh failed, keeping snapshot"),
                Err(_) => debug!("forecast refresh timed out, keeping snapshot"),
            }
        }
    }

    async fn refresh_vehicle_socs(&mut self) {
        let t = self.tunables.read_timeout;
        let socs = join_all(self.vehicles.iter().map(|v| async move {
            match timeout(t, v.soc()).await {
                Ok(Some(Ok(soc))) => Some(soc),
                _ => None,
            }
        }))
        .await;
        for (slot, soc) in self.vehicle_socs.iter_mut().zip(socs) {
            if soc.is_some() {
                *slot = soc;
            }
        }
    }

    /// Bind a detected vehicle to loadpoints that connected without one.
    fn bind_vehicles(&mut self, snapshots: &[LoadpointSnapshot]) {
        if self.vehicles.is_empty() {
            return;
        }
        let candidates: Vec<_> = self
            .vehicles
            .iter()
            .cloned()
            .zip(self.vehicle_socs.iter().copied())
            .collect();
        for (lp, snapshot) in self.loadpoints.iter_mut().zip(snapshots) {
            if lp.connected() && lp.vehicle().is_none() {
                if let Some(vehicle) = detect_vehicle(&candidates, None, snapshot.vehicle_soc) {
                    info!(loadpoint = %lp.name, vehicle = %vehicle.name, "vehicle detected");
                    lp.set_vehicle(Some(vehicle));
                }
            } else if !lp.connected() && lp.vehicle().is_some() {
                lp.set_vehicle(None);
            }
        }
    }

    fn accumulate(&mut self, pv: &[MeterReading], now: Instant, wall: DateTime<Utc>) {
        for (meter, reading) in self.pv.iter().zip(pv) {
            if let Some(acc) = self.pv_energy.get_mut(&meter.name) {
                if reading.power_w.is_some() || reading.energy_kwh.is_some() {
                    acc.update(
                        reading.power_w.unwrap_or(0.0).max(0.0),
                        reading.energy_kwh,
                        now,
                    );
                }
            }
        }
        if let Some(window) = &self.forecast_snapshot {
            if let Ok(power_w) = window.at(wall) {
                self.fcst_energy.update(power_w.max(0.0), None, now);
            }
        }
    }

    /// Power balance and the surplus available if all loadpoints paused.
    fn balance(
        &self,
        grid_w: Option<f64>,
        pv_w: f64,
        battery_w: f64,
        lp_power_w: f64,
    ) -> (f64, f64, bool) {
        let Some(grid_w) = grid_w else {
            warn!("grid meter unavailable, conservative allocation");
            return (0.0, 0.0, true);
        };

        // Derived home consumption absorbs the unaccounted residual.
        let home_w = grid_w + pv_w - battery_w - lp_power_w;
        let inconsistent = home_w < -self.tunables.tolerance_w;
        if inconsistent {
            warn!(
                home_w,
                tolerance_w = self.tunables.tolerance_w,
                "power balance residual beyond tolerance"
            );
        }

        let surplus_w = -grid_w + lp_power_w - self.tunables.residual_power_w;
        (surplus_w, home_w.max(0.0), inconsistent)
    }

    /// Surplus offered to loadpoints after home-battery priority rules.
    fn loadpoint_surplus(&self, surplus_w: f64, battery_w: f64, battery_soc: Option<f64>) -> f64 {
        let mut surplus = surplus_w;
        if let Some(soc) = battery_soc {
            // Below priority SoC the battery keeps the surplus it is
            // charging with.
            if soc < self.tunables.priority_soc && battery_w > 0.0 {
                surplus -= battery_w;
            }
            // Discharge feeds the loadpoints only above the buffer start
            // SoC (or the buffer SoC when no start threshold is set).
            if battery_w < 0.0 {
                let threshold = if self.tunables.buffer_start_soc > 0.0 {
                    self.tunables.buffer_start_soc
                } else {
                    self.tunables.buffer_soc
                };
                if soc < threshold {
                    surplus += battery_w;
                }
            }
        }
        surplus
    }

    /// Apportion power in descending priority, honouring grid-backed
    /// minimums first, then topping up from the PV budget.
    fn allocate(
        &mut self,
        surplus_w: f64,
        grid_w: Option<f64>,
        lp_power_w: f64,
        conservative: bool,
    ) -> Vec<f64> {
        let mut allocations = vec![0.0; self.loadpoints.len()];
        if self.loadpoints.is_empty() {
            return allocations;
        }

        let mut pv_budget = if conservative { 0.0 } else { surplus_w.max(0.0) };
        let house_import = grid_w.map(|g| (g - lp_power_w).max(0.0)).unwrap_or(0.0);
        let mut grid_budget = (self.tunables.max_grid_import_w - house_import).max(0.0);

        let order = self.allocation_order();

        // Guaranteed minimums (emergency, plan windows, `now` mode) may be
        // grid-backed.
        for &i in &order {
            let demand = self.loadpoints[i].demand();
            if demand.min_w <= 0.0 {
                continue;
            }
            let from_pv = demand.min_w.min(pv_budget);
            pv_budget -= from_pv;
            let from_grid = (demand.min_w - from_pv).min(grid_budget);
            grid_budget -= from_grid;
            allocations[i] = from_pv + from_grid;
        }

        // Remaining PV surplus tops the rest up in the same order.
        for &i in &order {
            if pv_budget <= 0.0 {
                break;
            }
            let demand = self.loadpoints[i].demand();
            let headroom = (demand.max_w - allocations[i]).max(0.0);
            let extra = headroom.min(pv_budget);
            allocations[i] += extra;
            pv_budget -= extra;
        }

        allocations
    }

    /// Indices in descending priority; ties rotate across ticks.
    fn allocation_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.loadpoints.len()).collect();
        order.sort_by(|&a, &b| {
            self.loadpoints[b]
                .priority_key()
                .cmp(&self.loadpoints[a].priority_key())
                .then(
                    self.loadpoints[a]
                        .min_current_a()
                        .partial_cmp(&self.loadpoints[b].min_current_a())
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        // Round-robin within equal-priority groups.
        let mut start = 0;
        while start < order.len() {
            let key = self.loadpoints[order[start]].priority_key();
            let mut end = start + 1;
            while end < order.len() && self.loadpoints[order[end]].priority_key() == key {
                end += 1;
            }
            let group = &mut order[start..end];
            if group.len() > 1 {
                group.rotate_left((self.tick_counter as usize) % group.len());
            }
            start = end;
        }
        order
    }

    async fn commit_battery_mode(&mut self, mode: BatteryMode) {
        let changed = self.committed_battery_mode != Some(mode);
        let heartbeat = self.tick_counter % BATTERY_HEARTBEAT_TICKS == 0;
        if !changed && !heartbeat {
            return;
        }
        for battery in &self.batteries {
            let Some(control) = &battery.control else {
                continue;
            };
            match timeout(self.tunables.command_timeout, control.set_mode(mode)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(battery = %battery.name, %err, "battery mode command rejected")
                }
                Err(_) => warn!(battery = %battery.name, "battery mode command timed out"),
            }
        }
        self.committed_battery_mode = Some(mode);
    }

    fn aggregate_soc(&self, readings: &[BatteryReading]) -> Option<f64> {
        let mut weighted = 0.0;
        let mut capacity = 0.0;
        for (battery, reading) in self.batteries.iter().zip(readings) {
            if let Some(soc) = reading.soc {
                let cap = battery.soc.capacity_kwh().max(0.1);
                weighted += soc * cap;
                capacity += cap;
            }
        }
        (capacity > 0.0).then(|| weighted / capacity)
    }

    fn publish(
        &mut self,
        grid_w: Option<f64>,
        pv_w: f64,
        aux_w: f64,
        battery_w: f64,
        battery_soc: Option<f64>,
        home_w: f64,
        wall: DateTime<Utc>,
    ) {
        if let Some(grid_w) = grid_w {
            self.bus.publish("site.grid.power", grid_w);
        }
        self.bus.publish("site.pv.power", pv_w);
        self.bus.publish("site.home.power", home_w);
        if !self.aux.is_empty() {
            self.bus.publish("site.aux.power", aux_w);
        }
        if !self.batteries.is_empty() {
            self.bus.publish("site.battery.power", battery_w);
            if let Some(soc) = battery_soc {
                self.bus.publish("site.battery.soc", soc);
            }
            self.bus
                .publish("site.battery.mode", self.battery_mode.mode());
        }

        if let Some(window) = &self.forecast_snapshot {
            let start_of_day = wall
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or(wall);
            let today = window.slice(start_of_day, start_of_day + chrono::Duration::days(1));
            self.bus
                .publish("site.forecast.today.kWh", today.energy_kwh());
        }
        self.bus.publish(
            "site.accumulated.solarForecast",
            self.fcst_energy.accumulated_kwh(),
        );
        let yields: HashMap<&str, f64> = self
            .pv_energy
            .iter()
            .map(|(name, acc)| (name.as_str(), acc.accumulated_kwh()))
            .collect();
        self.bus.publish("site.accumulated.solarYield", yields);

        for lp in &mut self.loadpoints {
            if let Some(summary) = lp.take_session_summary() {
                self.bus
                    .publish(&format!("loadpoint.{}.session.finished", lp.name), &summary);
                self.settings.delete(&keys::session_energy(&lp.name));
            }
        }
        for lp in &self.loadpoints {
            lp.publish(&self.bus);
        }
    }

    fn persist(&mut self) {
        self.settings
            .set_float(keys::SOLAR_ACC_FORECAST, self.fcst_energy.accumulated_kwh());
        let yields: HashMap<String, f64> = self
            .pv_energy
            .iter()
            .map(|(name, acc)| (name.clone(), acc.accumulated_kwh()))
            .collect();
        if let Err(err) = self.settings.set_json(keys::SOLAR_ACC_YIELD, &yields) {
            warn!(%err, "persisting solar yields failed");
        }
        for lp in &self.loadpoints {
            if let Some(energy) = lp.session_energy_kwh() {
                self.settings
                    .set_float(&keys::session_energy(&lp.name), energy);
            }
        }
        if let Err(err) = self.settings.flush() {
            warn!(%err, "settings flush failed");
        }
    }

    /// Restore persisted state. Accumulator slots for every configured PV
    /// meter already exist at this point; absent keys zero-init with a
    /// warning instead of failing.
    fn restore_settings(&mut self) {
        if let Some(v) = self.settings.float(keys::RESIDUAL_POWER) {
            self.tunables.residual_power_w = v;
        }
        if let Some(v) = self.settings.float(keys::BUFFER_SOC) {
            self.tunables.buffer_soc = v;
        }
        if let Some(v) = self.settings.float(keys::BUFFER_START_SOC) {
            self.tunables.buffer_start_soc = v;
        }
        if let Some(v) = self.settings.float(keys::PRIORITY_SOC) {
            self.tunables.priority_soc = v;
        }
        if let Some(v) = self.settings.bool(keys::DISCHARGE_CONTROL) {
            self.tunables.discharge_control = v;
        }
        if let Some(v) = self.settings.float(keys::GRID_CHARGE_LIMIT) {
            self.battery_mode.set_grid_charge_limit(Some(v));
        }

        match self.settings.float(keys::SOLAR_ACC_FORECAST) {
            Some(v) => self.fcst_energy.restore(v),
            None => warn!("no persisted solar forecast accumulator, starting at zero"),
        }

        match self
            .settings
            .json::<HashMap<String, f64>>(keys::SOLAR_ACC_YIELD)
        {
            Some(yields) => {
                for meter in &self.pv {
                    match yields.get(&meter.name) {
                        Some(kwh) => {
                            // Slot is guaranteed to exist; see SiteBuilder::build.
                            if let Some(acc) = self.pv_energy.get_mut(&meter.name) {
                                acc.restore(*kwh);
                            }
                        }
                        None => warn!(
                            meter = %meter.name,
                            "no persisted yield for configured pv meter, starting at zero"
                        ),
                    }
                }
            }
            None => {
                if !self.pv.is_empty() {
                    warn!("no persisted solar yields, starting at zero");
                }
            }
        }

        let names: Vec<String> = self.loadpoints.iter().map(|lp| lp.name.clone()).collect();
        for name in names {
            if let Some(kwh) = self.settings.float(&keys::session_energy(&name)) {
                self.with_loadpoint(&name, |lp| lp.restore_session_energy(kwh));
            }
        }
    }
}

async fn read_power(source: &dyn PowerSource, t: Duration) -> Option<f64> {
    match timeout(t, source.power()).await {
        Ok(Ok(power)) => Some(power),
        Ok(Err(err)) => {
            debug!(%err, "power read failed");
            None
        }
        Err(_) => {
            debug!("power read timed out");
            None
        }
    }
}

async fn read_meter(meter: &SiteMeter, t: Duration) -> MeterReading {
    let power_w = read_power(meter.power.as_ref(), t).await;
    let energy_kwh = match &meter.energy {
        Some(source) => match timeout(t, source.energy()).await {
            Ok(Ok(energy)) => Some(energy),
            _ => None,
        },
        None => None,
    };
    MeterReading { power_w, energy_kwh }
}
