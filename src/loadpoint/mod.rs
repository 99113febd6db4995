pub mod phases;
pub mod session;

pub use phases::{PhaseLogic, PhaseSwitchConfig};
pub use session::{Session, SessionSummary};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::device::{
    Cached, Charger, ChargerStatus, EnergySource, PhaseCurrents, PhaseSwitcher, PowerSource,
};
use crate::planner::{ChargePlan, Planner, Schedule};
use crate::rates::RateWindow;
use crate::vehicle::Vehicle;

/// How long a loadpoint keeps its setpoint after charger reads go stale
/// before disabling.
const STALE_GRACE: Duration = Duration::from_secs(30);

/// Scheduling mode of a loadpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeMode {
    Off,
    Now,
    MinPv,
    Pv,
}

impl std::fmt::Display for ChargeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChargeMode::Off => write!(f, "off"),
            ChargeMode::Now => write!(f, "now"),
            ChargeMode::MinPv => write!(f, "minpv"),
            ChargeMode::Pv => write!(f, "pv"),
        }
    }
}

/// Observable loadpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadpointState {
    Disconnected,
    /// Connected, not charging.
    Idle,
    Charging,
    /// Fatal charger failure; stays disabled until an operator resets it.
    Error,
}

/// Static tunables, set from configuration and adjustable at runtime
/// through the command surface.
#[derive(Debug, Clone)]
pub struct LoadpointTunables {
    pub title: String,
    pub mode: ChargeMode,
    pub min_current_a: f64,
    pub max_current_a: f64,
    /// 0 = automatic, otherwise 1 or 3.
    pub phases: u8,
    pub voltage_v: f64,
    /// Device current resolution, typically 1 A, optionally 0.1 A.
    pub current_resolution_a: f64,
    pub priority: u32,
    pub enable_delay: Duration,
    pub disable_delay: Duration,
    pub phase_switch: PhaseSwitchConfig,
}

impl Default for LoadpointTunables {
    fn default() -> Self {
        Self {
            title: String::new(),
            mode: ChargeMode::Pv,
            min_current_a: 6.0,
            max_current_a: 16.0,
            phases: 0,
            voltage_v: 230.0,
            current_resolution_a: 1.0,
            priority: 0,
            enable_delay: Duration::from_secs(60),
            disable_delay: Duration::from_secs(180),
            phase_switch: PhaseSwitchConfig::default(),
        }
    }
}

/// Prefetched device readings for one tick. `None` marks a failed read.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadpointSnapshot {
    pub status: Option<ChargerStatus>,
    pub enabled: Option<bool>,
    pub charge_power_w: Option<f64>,
    pub energy_kwh: Option<f64>,
    pub currents_a: Option<[f64; 3]>,
    pub vehicle_soc: Option<f64>,
}

/// Device commands decided this tick, applied at the commit barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Actuation {
    pub enable: Option<bool>,
    pub max_current_a: Option<f64>,
    pub phases: Option<u8>,
}

impl Actuation {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// What a loadpoint wants from the allocator this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerDemand {
    /// Grid-backed guarantee (emergency, plan, or `now` mode).
    pub min_w: f64,
    /// Upper bound the loadpoint can absorb.
    pub max_w: f64,
}

/// Priority sort key, descending: emergency first, then active plans, then
/// the configured priority.
pub type PriorityKey = (bool, bool, u32);

/// Per-charge-point controller: connection lifecycle, mode semantics,
/// phase/current computation, and session bookkeeping.
pub struct Loadpoint {
    pub name: String,
    tunables: LoadpointTunables,

    charger: Arc<dyn Charger>,
    phase_switcher: Option<Arc<dyn PhaseSwitcher>>,
    charge_meter: Option<Arc<dyn PowerSource>>,
    energy_meter: Option<Arc<dyn EnergySource>>,
    phase_meter: Option<Arc<dyn PhaseCurrents>>,

    status_cache: Cached<ChargerStatus>,
    state: LoadpointState,
    enabled: bool,
    observed_enabled: Option<bool>,
    offered_current_a: f64,
    active_phases: u8,
    charge_power_w: f64,

    session: Option<Session>,
    pending_restore_kwh: Option<f64>,
    last_summary: Option<SessionSummary>,

    vehicle: Option<Arc<Vehicle>>,
    vehicle_soc: Cached<f64>,
    plan: Option<ChargePlan>,
    schedule: Option<Schedule>,

    phase_logic: PhaseLogic,
    enable_pending: Option<Instant>,
    disable_pending: Option<Instant>,
}

impl Loadpoint {
    pub fn new(name: impl Into<String>, charger: Arc<dyn Charger>, tunables: LoadpointTunables) -> Self {
        let active_phases = match tunables.phases {
            1 => 1,
            _ => 3,
        };
        Self {
            name: name.into(),
            charger,
            phase_switcher: None,
            charge_meter: None,
            energy_meter: None,
            phase_meter: None,
            status_cache: Cached::new(STALE_GRACE),
            state: LoadpointState::Disconnected,
            enabled: false,
            observed_enabled: None,
            offered_current_a: 0.0,
            active_phases,
            charge_power_w: 0.0,
            session: None,
            pending_restore_kwh: None,
            last_summary: None,
            vehicle: None,
            vehicle_soc: Cached::new(Duration::from_secs(3600)),
            plan: None,
            schedule: None,
            phase_logic: PhaseLogic::default(),
            enable_pending: None,
            disable_pending: None,
            tunables,
        }
    }

    pub fn with_phase_switcher(mut self, switcher: Arc<dyn PhaseSwitcher>) -> Self {
        self.phase_switcher = Some(switcher);
        self
    }

    pub fn with_charge_meter(mut self, meter: Arc<dyn PowerSource>) -> Self {
        self.charge_meter = Some(meter);
        self
    }

    pub fn with_energy_meter(mut self, meter: Arc<dyn EnergySource>) -> Self {
        self.energy_meter = Some(meter);
        self
    }

    pub fn with_phase_meter(mut self, meter: Arc<dyn PhaseCurrents>) -> Self {
        self.phase_meter = Some(meter);
        self
    }

    pub fn with_vehicle(mut self, vehicle: Arc<Vehicle>) -> Self {
        self.vehicle = Some(vehicle);
        self
    }

    // --- command surface -------------------------------------------------

    pub fn set_mode(&mut self, mode: ChargeMode) {
        if self.tunables.mode != mode {
            info!(loadpoint = %self.name, %mode, "mode changed");
            self.tunables.mode = mode;
            self.enable_pending = None;
            self.disable_pending = None;
        }
    }

    pub fn set_min_current(&mut self, amps: f64) {
        self.tunables.min_current_a = amps.max(0.0).min(self.tunables.max_current_a);
    }

    pub fn set_max_current(&mut self, amps: f64) {
        self.tunables.max_current_a = amps.max(self.tunables.min_current_a);
    }

    pub fn set_phases(&mut self, phases: u8) {
        if matches!(phases, 0 | 1 | 3) {
            self.tunables.phases = phases;
            if phases != 0 {
                self.active_phases = phases;
            }
        }
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.tunables.priority = priority;
    }

    pub fn set_plan(&mut self, plan: ChargePlan) {
        info!(loadpoint = %self.name, deadline = %plan.deadline, "plan set");
        self.plan = Some(plan);
        self.schedule = None;
    }

    pub fn clear_plan(&mut self) {
        if self.plan.take().is_some() {
            info!(loadpoint = %self.name, "plan cleared");
        }
        self.schedule = None;
    }

    pub fn set_vehicle(&mut self, vehicle: Option<Arc<Vehicle>>) {
        self.vehicle = vehicle;
    }

    pub fn vehicle(&self) -> Option<&Arc<Vehicle>> {
        self.vehicle.as_ref()
    }

    /// Operator reset after a fatal charger failure.
    pub fn reset_error(&mut self) {
        if self.state == LoadpointState::Error {
            self.state = LoadpointState::Disconnected;
        }
    }

    /// Seed the next session with persisted energy (restart with the
    /// vehicle still connected).
    pub fn restore_session_energy(&mut self, kwh: f64) {
        self.pending_restore_kwh = Some(kwh);
    }

    // --- accessors -------------------------------------------------------

    pub fn mode(&self) -> ChargeMode {
        self.tunables.mode
    }

    pub fn title(&self) -> &str {
        if self.tunables.title.is_empty() {
            &self.name
        } else {
            &self.tunables.title
        }
    }

    pub fn state(&self) -> LoadpointState {
        self.state
    }

    pub fn connected(&self) -> bool {
        matches!(self.state, LoadpointState::Idle | LoadpointState::Charging)
    }

    pub fn charging(&self) -> bool {
        self.state == LoadpointState::Charging
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn offered_current_a(&self) -> f64 {
        self.offered_current_a
    }

    pub fn active_phases(&self) -> u8 {
        if self.tunables.phases != 0 {
            self.tunables.phases
        } else {
            self.active_phases
        }
    }

    pub fn min_current_a(&self) -> f64 {
        self.tunables.min_current_a
    }

    pub fn charge_power_w(&self) -> f64 {
        self.charge_power_w
    }

    pub fn session_energy_kwh(&self) -> Option<f64> {
        self.session.as_ref().map(Session::energy_kwh)
    }

    pub fn take_session_summary(&mut self) -> Option<SessionSummary> {
        self.last_summary.take()
    }

    pub fn plan(&self) -> Option<&ChargePlan> {
        self.plan.as_ref()
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn plan_active(&self) -> bool {
        self.schedule.as_ref().is_some_and(|s| s.active_now)
    }

    pub fn min_power_w(&self) -> f64 {
        self.tunables.min_current_a * self.tunables.voltage_v * self.active_phases() as f64
    }

    pub fn max_power_w(&self) -> f64 {
        self.tunables.max_current_a * self.tunables.voltage_v * self.active_phases() as f64
    }

    /// Vehicle SoC below its configured minimum forces grid-backed charging.
    pub fn emergency(&self) -> bool {
        if !self.connected() {
            return false;
        }
        match (&self.vehicle, self.vehicle_soc.last()) {
            (Some(vehicle), Some(soc)) => {
                vehicle.min_soc_percent > 0.0 && soc < vehicle.min_soc_percent
            }
            _ => false,
        }
    }

    pub fn priority_key(&self) -> PriorityKey {
        (self.emergency(), self.plan_active(), self.tunables.priority)
    }

    // --- per-tick pipeline ----------------------------------------------

    /// Fan-out device reads, each bounded by `read_timeout`.
    pub async fn read_devices(&self, read_timeout: Duration) -> LoadpointSnapshot {
        let mut snapshot = LoadpointSnapshot::default();

        if let Ok(Ok(status)) = timeout(read_timeout, self.charger.status()).await {
            snapshot.status = Some(status);
        }
        if let Ok(Ok(enabled)) = timeout(read_timeout, self.charger.enabled()).await {
            snapshot.enabled = Some(enabled);
        }
        if let Some(meter) = &self.charge_meter {
            if let Ok(Ok(power)) = timeout(read_timeout, meter.power()).await {
                snapshot.charge_power_w = Some(power);
            }
        }
        if let Some(meter) = &self.energy_meter {
            if let Ok(Ok(energy)) = timeout(read_timeout, meter.energy()).await {
                snapshot.energy_kwh = Some(energy);
            }
        }
        if let Some(meter) = &self.phase_meter {
            if let Ok(Ok(currents)) = timeout(read_timeout, meter.currents()).await {
                snapshot.currents_a = Some(currents);
            }
        }
        if let Some(vehicle) = &self.vehicle {
            if let Ok(Some(Ok(soc))) = timeout(read_timeout, vehicle.soc()).await {
                snapshot.vehicle_soc = Some(soc);
            }
        }

        snapshot
    }

    /// Integrate a snapshot: connection lifecycle, session bookkeeping,
    /// measured charge power. Pure with respect to devices.
    pub fn observe(&mut self, snapshot: &LoadpointSnapshot, now: Instant, wall: DateTime<Utc>) {
        match snapshot.status {
            Some(status) => self.status_cache.update(status, now),
            None => {
                let failures = self.status_cache.failure();
                debug!(loadpoint = %self.name, failures, "charger status read failed");
            }
        }

        if let Some(soc) = snapshot.vehicle_soc {
            self.vehicle_soc.update(soc, now);
        } else if self.vehicle.is_some() {
            self.vehicle_soc.failure();
        }
        if snapshot.enabled.is_some() {
            self.observed_enabled = snapshot.enabled;
        }

        let Ok(status) = self.status_cache.get(now) else {
            // Stale charger: state is frozen; allocate() disables once the
            // grace window has passed.
            return;
        };

        if status.faulted() {
            if self.state != LoadpointState::Error {
                error!(loadpoint = %self.name, %status, "charger fault, loadpoint disabled");
                self.state = LoadpointState::Error;
            }
            return;
        }
        if self.state == LoadpointState::Error {
            // Fault cleared on the wire, but the operator has not reset.
            return;
        }

        let was_connected = self.connected();
        match status {
            ChargerStatus::A => {
                if was_connected {
                    self.close_session(wall);
                }
                self.state = LoadpointState::Disconnected;
            }
            ChargerStatus::B | ChargerStatus::C => {
                if !was_connected {
                    self.open_session(wall, snapshot.energy_kwh);
                }
                if status == ChargerStatus::C {
                    self.state = LoadpointState::Charging;
                    if let Some(session) = &mut self.session {
                        session.note_charge_start(wall);
                    }
                } else {
                    self.state = LoadpointState::Idle;
                }
            }
            ChargerStatus::E | ChargerStatus::F => unreachable!("faulted handled above"),
        }

        self.charge_power_w = snapshot.charge_power_w.unwrap_or_else(|| {
            if self.charging() && self.enabled {
                self.offered_current_a * self.tunables.voltage_v * self.active_phases() as f64
            } else {
                0.0
            }
        });

        // Measured phase currents reveal how many phases the vehicle
        // actually draws on; adopt that in automatic mode.
        if let Some(currents) = snapshot.currents_a {
            if self.charging() && self.tunables.phases == 0 && !self.phase_logic.switching() {
                let used = currents.iter().filter(|c| **c > 1.0).count() as u8;
                if (used == 1 || used == 3) && used != self.active_phases {
                    debug!(
                        loadpoint = %self.name,
                        commanded = self.active_phases,
                        used,
                        "measured phase usage differs, adopting"
                    );
                    self.active_phases = used;
                }
            }
        }
        if let Some(session) = &mut self.session {
            session.update(
                snapshot.energy_kwh,
                self.charge_power_w,
                self.state == LoadpointState::Charging,
                now,
            );
        }
    }

    /// Re-run the charge planner against the latest tariff snapshot.
    pub fn replan(&mut self, planner: &Planner, rates: Option<&RateWindow>, wall: DateTime<Utc>) {
        let Some(plan) = &self.plan else {
            self.schedule = None;
            return;
        };
        if !self.connected() {
            self.schedule = None;
            return;
        }

        let vehicle_capacity = self.vehicle.as_ref().map(|v| v.capacity_kwh);
        let Some(required) = plan.required_energy_kwh(self.vehicle_soc.last(), vehicle_capacity)
        else {
            warn!(loadpoint = %self.name, "soc plan without vehicle soc, ignoring plan");
            self.schedule = None;
            return;
        };

        // Energy goals count what the session already delivered.
        let remaining = match plan.goal {
            crate::planner::PlanGoal::Energy(_) => {
                (required - self.session_energy_kwh().unwrap_or(0.0)).max(0.0)
            }
            crate::planner::PlanGoal::Soc(_) => required,
        };

        let empty = RateWindow::empty();
        let rates = rates.unwrap_or(&empty);
        let schedule =
            planner.plan_with_precondition(wall, plan, remaining, self.max_power_w(), rates);
        if schedule.insufficient && !self.schedule.as_ref().is_some_and(|s| s.insufficient) {
            warn!(loadpoint = %self.name, "plan cannot be met before its deadline");
        }
        self.schedule = Some(schedule);
    }

    /// Mode after plan and fault overrides.
    pub fn effective_mode(&self) -> ChargeMode {
        if self.state == LoadpointState::Error {
            return ChargeMode::Off;
        }
        if self.tunables.mode != ChargeMode::Off && self.plan_active() {
            return ChargeMode::Now;
        }
        self.tunables.mode
    }

    /// Power wanted from the allocator under the effective mode.
    pub fn demand(&self) -> PowerDemand {
        if !self.connected() || self.state == LoadpointState::Error {
            return PowerDemand::default();
        }
        match self.effective_mode() {
            ChargeMode::Off => PowerDemand::default(),
            ChargeMode::Now => PowerDemand {
                min_w: self.max_power_w(),
                max_w: self.max_power_w(),
            },
            ChargeMode::MinPv | ChargeMode::Pv => PowerDemand {
                min_w: if self.emergency() { self.min_power_w() } else { 0.0 },
                max_w: self.max_power_w(),
            },
        }
    }

    /// Decide this tick's actuation from the allocated power. Pure; device
    /// commands are issued by `commit`.
    pub fn allocate(&mut self, allocated_w: f64, now: Instant) -> Actuation {
        let mut actuation = Actuation::default();

        // Stale charger: keep the setpoint while the last good reading is
        // younger than the grace window, then force the safe state.
        if self.status_cache.get(now).is_err() {
            let beyond_grace = self
                .status_cache
                .age(now)
                .map(|age| age > STALE_GRACE)
                .unwrap_or(true);
            if beyond_grace && self.enabled {
                warn!(loadpoint = %self.name, "charger stale beyond grace, disabling");
                self.set_enabled(false, &mut actuation);
            }
            return actuation;
        }

        if self.state == LoadpointState::Error || !self.connected() {
            self.offered_current_a = 0.0;
            self.enable_pending = None;
            self.disable_pending = None;
            self.phase_logic.abort();
            if self.enabled {
                self.set_enabled(false, &mut actuation);
            }
            return actuation;
        }

        // A staged phase switch owns the charger until it completes.
        if self.phase_logic.switching() {
            if let Some(target) = self.phase_logic.ready(&self.tunables.phase_switch, now) {
                actuation.phases = Some(target);
            }
            return actuation;
        }

        match self.effective_mode() {
            ChargeMode::Off => {
                self.offered_current_a = 0.0;
                if self.enabled {
                    self.set_enabled(false, &mut actuation);
                }
            }
            ChargeMode::Now => {
                self.maybe_start_phase_switch(allocated_w, now, &mut actuation);
                if !self.phase_logic.switching() {
                    self.set_current(self.tunables.max_current_a, &mut actuation);
                    if !self.enabled {
                        self.set_enabled(true, &mut actuation);
                    }
                }
            }
            mode @ (ChargeMode::MinPv | ChargeMode::Pv) => {
                self.maybe_start_phase_switch(allocated_w, now, &mut actuation);
                if !self.phase_logic.switching() {
                    self.pv_allocate(mode, allocated_w, now, &mut actuation);
                }
            }
        }

        // Actuation lag: a previous command has not taken effect on the
        // device yet, so reassert it.
        if actuation.enable.is_none() {
            if let Some(observed) = self.observed_enabled {
                if observed != self.enabled {
                    debug!(
                        loadpoint = %self.name,
                        desired = self.enabled,
                        observed,
                        "device lags behind enable command, reasserting"
                    );
                    actuation.enable = Some(self.enabled);
                    if self.enabled && actuation.max_current_a.is_none() {
                        actuation.max_current_a = Some(self.offered_current_a);
                    }
                }
            }
        }

        actuation
    }

    fn pv_allocate(&mut self, mode: ChargeMode, allocated_w: f64, now: Instant, actuation: &mut Actuation) {
        let phases = self.active_phases() as f64;
        let raw_a = allocated_w / (self.tunables.voltage_v * phases);
        let min_a = self.tunables.min_current_a;
        let max_a = self.tunables.max_current_a;
        let above_min = raw_a >= min_a;

        if self.enabled {
            self.enable_pending = None;
            if above_min || self.emergency() {
                self.disable_pending = None;
                self.set_current(raw_a.clamp(min_a, max_a), actuation);
            } else {
                // Below threshold: keep charging at minimum current while
                // the disable delay runs.
                let since = *self.disable_pending.get_or_insert(now);
                if now.duration_since(since) >= self.tunables.disable_delay {
                    debug!(loadpoint = %self.name, "surplus below minimum, disabling");
                    self.disable_pending = None;
                    self.offered_current_a = 0.0;
                    self.set_enabled(false, actuation);
                } else {
                    self.set_current(min_a, actuation);
                }
            }
        } else {
            self.disable_pending = None;
            if above_min || self.emergency() {
                // minPV enables as soon as the threshold is met; PV waits
                // out the enable delay.
                let wait = match mode {
                    ChargeMode::Pv => self.tunables.enable_delay,
                    _ => Duration::ZERO,
                };
                let since = *self.enable_pending.get_or_insert(now);
                if now.duration_since(since) >= wait || self.emergency() {
                    self.enable_pending = None;
                    self.set_current(raw_a.clamp(min_a, max_a), actuation);
                    self.set_enabled(true, actuation);
                }
            } else {
                self.enable_pending = None;
            }
        }
    }

    fn maybe_start_phase_switch(&mut self, allocated_w: f64, now: Instant, actuation: &mut Actuation) {
        if self.tunables.phases != 0 || self.phase_switcher.is_none() {
            return;
        }
        let min_1p_w = self.tunables.min_current_a * self.tunables.voltage_v;
        if let Some(target) = self.phase_logic.evaluate(
            &self.tunables.phase_switch,
            self.active_phases,
            allocated_w,
            min_1p_w,
            self.plan_active(),
            now,
        ) {
            info!(loadpoint = %self.name, target, "phase switch started");
            self.phase_logic.begin(target, now);
            self.offered_current_a = 0.0;
            self.set_enabled(false, actuation);
        }
    }

    fn set_enabled(&mut self, on: bool, actuation: &mut Actuation) {
        self.enabled = on;
        actuation.enable = Some(on);
        if !on {
            self.offered_current_a = 0.0;
        }
    }

    fn set_current(&mut self, amps: f64, actuation: &mut Actuation) {
        let resolution = self.tunables.current_resolution_a.max(0.1);
        let floored = (amps / resolution).floor() * resolution;
        if (floored - self.offered_current_a).abs() > f64::EPSILON || !self.enabled {
            self.offered_current_a = floored;
            actuation.max_current_a = Some(floored);
        }
    }

    /// Apply this tick's actuation to the devices, each command bounded by
    /// `command_timeout`. Failures log and decay; the next tick retries
    /// through the regular decision path.
    pub async fn commit(&mut self, actuation: Actuation, command_timeout: Duration, now: Instant) {
        if let Some(amps) = actuation.max_current_a {
            match timeout(command_timeout, self.charger.max_current(amps)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(loadpoint = %self.name, %err, amps, "current command rejected"),
                Err(_) => warn!(loadpoint = %self.name, amps, "current command timed out"),
            }
        }

        if let Some(on) = actuation.enable {
            match timeout(command_timeout, self.charger.enable(on)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(loadpoint = %self.name, %err, on, "enable command rejected"),
                Err(_) => warn!(loadpoint = %self.name, on, "enable command timed out"),
            }
        }

        if let Some(phases) = actuation.phases {
            let Some(switcher) = self.phase_switcher.clone() else {
                return;
            };
            match timeout(command_timeout, switcher.phases_1p3p(phases)).await {
                Ok(Ok(())) => {
                    info!(loadpoint = %self.name, phases, "phase switch completed");
                    self.active_phases = phases;
                    self.phase_logic.complete(now);
                }
                Ok(Err(err)) => {
                    warn!(loadpoint = %self.name, %err, "phase switch rejected, aborting");
                    self.phase_logic.abort();
                }
                Err(_) => {
                    warn!(loadpoint = %self.name, "phase switch timed out, aborting");
                    self.phase_logic.abort();
                }
            }
        }
    }

    /// Publish this loadpoint's telemetry keys.
    pub fn publish(&self, bus: &EventBus) {
        let prefix = format!("loadpoint.{}", self.name);
        bus.publish(&format!("{prefix}.mode"), self.tunables.mode);
        bus.publish(&format!("{prefix}.connected"), self.connected());
        bus.publish(&format!("{prefix}.charging"), self.charging());
        bus.publish(&format!("{prefix}.phases.active"), self.active_phases());
        bus.publish(&format!("{prefix}.current.offered"), self.offered_current_a);
        bus.publish(
            &format!("{prefix}.session.energy"),
            self.session_energy_kwh().unwrap_or(0.0),
        );
        bus.publish(&format!("{prefix}.plan.active"), self.plan_active());
        bus.publish(
            &format!("{prefix}.plan.next"),
            self.schedule.as_ref().and_then(|s| s.next_window),
        );
    }

    fn open_session(&mut self, wall: DateTime<Utc>, counter_kwh: Option<f64>) {
        let mut session = Session::new(wall, counter_kwh);
        if let Some(kwh) = self.pending_restore_kwh.take() {
            session.restore_energy(kwh);
        }
        info!(loadpoint = %self.name, session = %session.id, "vehicle connected, session opened");
        self.session = Some(session);
    }

    fn close_session(&mut self, wall: DateTime<Utc>) {
        self.pending_restore_kwh = None;
        if let Some(session) = self.session.take() {
            let summary = session.finalize(wall);
            info!(
                loadpoint = %self.name,
                session = %summary.id,
                energy_kwh = summary.energy_kwh,
                "vehicle disconnected, session closed"
            );
            self.last_summary = Some(summary);
        }
        // `enabled` is left set so the next allocation issues the disable
        // command to the device.
        self.schedule = None;
        self.phase_logic.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::SimulatedCharger;

    fn zero_delay_tunables(mode: ChargeMode) -> LoadpointTunables {
        LoadpointTunables {
            mode,
            enable_delay: Duration::ZERO,
            disable_delay: Duration::ZERO,
            phases: 3,
            ..LoadpointTunables::default()
        }
    }

    fn connected_snapshot(status: ChargerStatus) -> LoadpointSnapshot {
        LoadpointSnapshot {
            status: Some(status),
            enabled: Some(false),
            ..LoadpointSnapshot::default()
        }
    }

    fn make_loadpoint(mode: ChargeMode) -> Loadpoint {
        Loadpoint::new(
            "garage",
            Arc::new(SimulatedCharger::default()),
            zero_delay_tunables(mode),
        )
    }

    #[test]
    fn surplus_below_minimum_keeps_charger_disabled() {
        // Scenario: 3 kW surplus on a 3-phase loadpoint, min 6 A.
        let mut lp = make_loadpoint(ChargeMode::MinPv);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());

        let actuation = lp.allocate(3000.0, now);
        assert!(!lp.enabled());
        assert_eq!(lp.offered_current_a(), 0.0);
        assert!(actuation.is_noop());
    }

    #[test]
    fn sufficient_surplus_enables_and_floors_current() {
        // 5 kW over 3×230 V is 7.25 A, floored to 7 A.
        let mut lp = make_loadpoint(ChargeMode::MinPv);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());

        let actuation = lp.allocate(5000.0, now);
        assert!(lp.enabled());
        assert_eq!(lp.offered_current_a(), 7.0);
        assert_eq!(actuation.enable, Some(true));
        assert_eq!(actuation.max_current_a, Some(7.0));
    }

    #[test]
    fn off_mode_disables_and_offers_zero() {
        let mut lp = make_loadpoint(ChargeMode::MinPv);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());
        lp.allocate(10_000.0, now);
        assert!(lp.enabled());

        lp.set_mode(ChargeMode::Off);
        let actuation = lp.allocate(10_000.0, now);
        assert!(!lp.enabled());
        assert_eq!(lp.offered_current_a(), 0.0);
        assert_eq!(actuation.enable, Some(false));
    }

    #[test]
    fn now_mode_requests_max_current() {
        let mut lp = make_loadpoint(ChargeMode::Now);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());

        let actuation = lp.allocate(0.0, now);
        assert!(lp.enabled());
        assert_eq!(lp.offered_current_a(), 16.0);
        assert_eq!(actuation.max_current_a, Some(16.0));
    }

    #[test]
    fn offered_current_stays_within_limits() {
        let mut lp = make_loadpoint(ChargeMode::MinPv);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());

        lp.allocate(100_000.0, now);
        assert!(lp.enabled());
        assert!(lp.offered_current_a() <= 16.0);
        assert!(lp.offered_current_a() >= 6.0);
    }

    #[test]
    fn pv_mode_waits_out_the_enable_delay() {
        let mut tunables = zero_delay_tunables(ChargeMode::Pv);
        tunables.enable_delay = Duration::from_secs(60);
        let mut lp = Loadpoint::new("garage", Arc::new(SimulatedCharger::default()), tunables);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());

        lp.allocate(5000.0, now);
        assert!(!lp.enabled());
        lp.allocate(5000.0, now + Duration::from_secs(30));
        assert!(!lp.enabled());
        lp.allocate(5000.0, now + Duration::from_secs(61));
        assert!(lp.enabled());
    }

    #[test]
    fn pv_mode_rides_through_dips_at_min_current() {
        let mut tunables = zero_delay_tunables(ChargeMode::Pv);
        tunables.disable_delay = Duration::from_secs(180);
        let mut lp = Loadpoint::new("garage", Arc::new(SimulatedCharger::default()), tunables);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());
        lp.allocate(5000.0, now);
        assert!(lp.enabled());

        // Surplus collapses: held at min current until the delay expires.
        let actuation = lp.allocate(500.0, now + Duration::from_secs(10));
        assert!(lp.enabled());
        assert_eq!(actuation.max_current_a, Some(6.0));

        let actuation = lp.allocate(500.0, now + Duration::from_secs(200));
        assert!(!lp.enabled());
        assert_eq!(actuation.enable, Some(false));
    }

    #[test]
    fn fatal_status_enters_error_until_reset() {
        let mut lp = make_loadpoint(ChargeMode::Now);
        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::C), now, Utc::now());
        assert!(lp.charging());
        lp.allocate(10_000.0, now);
        assert!(lp.enabled());

        lp.observe(&connected_snapshot(ChargerStatus::F), now, Utc::now());
        assert_eq!(lp.state(), LoadpointState::Error);
        let actuation = lp.allocate(10_000.0, now);
        assert_eq!(actuation.enable, Some(false));
        assert_eq!(lp.demand(), PowerDemand::default());

        lp.reset_error();
        assert_eq!(lp.state(), LoadpointState::Disconnected);
    }

    #[test]
    fn session_opens_and_closes_with_connection() {
        let mut lp = make_loadpoint(ChargeMode::Now);
        let now = Instant::now();
        let wall = Utc::now();

        let mut snapshot = connected_snapshot(ChargerStatus::B);
        snapshot.energy_kwh = Some(100.0);
        lp.observe(&snapshot, now, wall);
        assert!(lp.session_energy_kwh().is_some());

        let mut charging = connected_snapshot(ChargerStatus::C);
        charging.energy_kwh = Some(104.2);
        lp.observe(&charging, now + Duration::from_secs(60), wall);
        assert!((lp.session_energy_kwh().unwrap() - 4.2).abs() < 1e-9);

        lp.observe(
            &connected_snapshot(ChargerStatus::A),
            now + Duration::from_secs(120),
            wall,
        );
        assert!(lp.session_energy_kwh().is_none());
        let summary = lp.take_session_summary().unwrap();
        assert!((summary.energy_kwh - 4.2).abs() < 1e-9);
        assert!(!lp.connected());
    }

    #[test]
    fn session_energy_is_monotone() {
        let mut lp = make_loadpoint(ChargeMode::Now);
        let now = Instant::now();
        let wall = Utc::now();

        let mut snapshot = connected_snapshot(ChargerStatus::C);
        snapshot.energy_kwh = Some(50.0);
        lp.observe(&snapshot, now, wall);

        let mut last = 0.0;
        for (i, counter) in [50.5, 51.0, 50.8, 51.5].iter().enumerate() {
            let mut s = connected_snapshot(ChargerStatus::C);
            s.energy_kwh = Some(*counter);
            lp.observe(&s, now + Duration::from_secs(i as u64), wall);
            let energy = lp.session_energy_kwh().unwrap();
            assert!(energy >= last);
            last = energy;
        }
    }

    #[test]
    fn auto_phase_switch_stages_through_disable_and_dwell() {
        let mut tunables = zero_delay_tunables(ChargeMode::MinPv);
        tunables.phases = 0;
        tunables.phase_switch = PhaseSwitchConfig {
            up_delay: Duration::from_secs(60),
            down_delay: Duration::from_secs(60),
            device_dwell: Duration::from_secs(10),
            min_interval: Duration::ZERO,
        };
        let charger = Arc::new(SimulatedCharger::default());
        let mut lp = Loadpoint::new("garage", charger.clone(), tunables)
            .with_phase_switcher(charger.clone());
        lp.active_phases = 1;

        let now = Instant::now();
        lp.observe(&connected_snapshot(ChargerStatus::B), now, Utc::now());

        // Sustained 4.2 kW surplus exceeds the 3-phase minimum of 4.14 kW.
        lp.allocate(4200.0, now);
        let actuation = lp.allocate(4200.0, now + Duration::from_secs(61));
        assert_eq!(actuation.enable, Some(false));
        assert!(lp.phase_logic.switching());

        // Dwell not yet elapsed: nothing to do.
        let actuation = lp.allocate(4200.0, now + Duration::from_secs(65));
        assert!(actuation.is_noop());

        // Dwell elapsed: the switch command goes out.
        let actuation = lp.allocate(4200.0, now + Duration::from_secs(72));
        assert_eq!(actuation.phases, Some(3));
    }

    #[test]
    fn measured_currents_reveal_single_phase_vehicle() {
        let mut tunables = zero_delay_tunables(ChargeMode::Now);
        tunables.phases = 0;
        let mut lp = Loadpoint::new("garage", Arc::new(SimulatedCharger::default()), tunables);
        assert_eq!(lp.active_phases(), 3);

        // Vehicle only draws on L1 although 3 phases are commanded.
        let snapshot = LoadpointSnapshot {
            status: Some(ChargerStatus::C),
            currents_a: Some([13.2, 0.1, 0.0]),
            ..LoadpointSnapshot::default()
        };
        lp.observe(&snapshot, Instant::now(), Utc::now());
        assert_eq!(lp.active_phases(), 1);
    }

    #[test]
    fn emergency_soc_forces_min_current() {
        let vehicle = Arc::new(
            Vehicle::new("ioniq", "Ioniq 5", 72.0).with_min_soc(20.0),
        );
        let mut lp = make_loadpoint(ChargeMode::Pv).with_vehicle(vehicle);
        let now = Instant::now();
        let mut snapshot = connected_snapshot(ChargerStatus::B);
        snapshot.vehicle_soc = Some(12.0);
        lp.observe(&snapshot, now, Utc::now());

        assert!(lp.emergency());
        let demand = lp.demand();
        assert!((demand.min_w - 6.0 * 230.0 * 3.0).abs() < 1e-9);

        // No surplus at all: still enabled at minimum current.
        lp.allocate(0.0, now);
        assert!(lp.enabled());
        assert_eq!(lp.offered_current_a(), 6.0);
    }
}
