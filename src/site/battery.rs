use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::device::BatteryMode;
use crate::rates::RateWindow;

/// Tunables for the automatic battery mode decision.
#[derive(Debug, Clone)]
pub struct BatteryModeConfig {
    /// Forced charging fills up to this SoC.
    pub charge_soc_limit: f64,
    /// Forced charging engages only below this price.
    pub grid_charge_limit: Option<f64>,
    /// Minimum spacing between mode changes.
    pub mode_dwell: Duration,
    /// A rate this much above the window average counts as a peak.
    pub peak_ratio: f64,
    /// How far ahead peaks are searched for.
    pub peak_horizon: chrono::Duration,
}

impl Default for BatteryModeConfig {
    fn default() -> Self {
        Self {
            charge_soc_limit: 0.0,
            grid_charge_limit: None,
            mode_dwell: Duration::from_secs(300),
            peak_ratio: 1.5,
            peak_horizon: chrono::Duration::hours(6),
        }
    }
}

/// Decision inputs gathered by the site each tick.
#[derive(Debug, Clone, Default)]
pub struct BatteryModeInputs<'a> {
    pub soc: Option<f64>,
    pub current_price: Option<f64>,
    pub rates: Option<&'a RateWindow>,
    /// Any loadpoint has an active plan window this tick.
    pub plan_active: bool,
    /// The battery is currently discharging.
    pub discharging: bool,
}

/// Decides the battery operating mode per tick, with a minimum dwell so
/// modes never flap, and an optional manual override.
#[derive(Debug)]
pub struct BatteryModeController {
    cfg: BatteryModeConfig,
    mode: BatteryMode,
    last_change: Option<Instant>,
    manual: Option<BatteryMode>,
}

impl BatteryModeController {
    pub fn new(cfg: BatteryModeConfig) -> Self {
        Self {
            cfg,
            mode: BatteryMode::Normal,
            last_change: None,
            manual: None,
        }
    }

    pub fn mode(&self) -> BatteryMode {
        self.mode
    }

    pub fn set_grid_charge_limit(&mut self, limit: Option<f64>) {
        self.cfg.grid_charge_limit = limit;
    }

    pub fn grid_charge_limit(&self) -> Option<f64> {
        self.cfg.grid_charge_limit
    }

    /// Manual override; `None` returns control to the automatic rules.
    pub fn set_manual(&mut self, mode: Option<BatteryMode>) {
        self.manual = mode;
    }

    /// Compute this tick's mode. Transitions are spaced by the configured
    /// dwell; an unchanged decision is idempotent.
    pub fn decide(&mut self, inputs: &BatteryModeInputs<'_>, wall: DateTime<Utc>, now: Instant) -> BatteryMode {
        let desired = match self.manual {
            Some(mode) => mode,
            None => self.auto(inputs, wall),
        };

        if desired != self.mode {
            let dwell_over = self
                .last_change
                .map(|at| now.duration_since(at) >= self.cfg.mode_dwell)
                .unwrap_or(true);
            if dwell_over {
                info!(from = %self.mode, to = %desired, "battery mode change");
                self.mode = desired;
                self.last_change = Some(now);
            } else {
                debug!(desired = %desired, "battery mode change deferred by dwell");
            }
        }
        self.mode
    }

    fn auto(&self, inputs: &BatteryModeInputs<'_>, wall: DateTime<Utc>) -> BatteryMode {
        let Some(soc) = inputs.soc else {
            // Unknown SoC: the safe default.
            return BatteryMode::Normal;
        };

        if self.wants_forced_charge(soc, inputs, wall) {
            return BatteryMode::ForcedCharge;
        }

        // Preserve stored energy through price peaks, and keep the battery
        // from discharging into a plan-driven charging session.
        if self.in_peak(inputs.current_price, inputs.rates, wall)
            || (inputs.plan_active && inputs.discharging)
        {
            return BatteryMode::Hold;
        }

        BatteryMode::Normal
    }

    fn wants_forced_charge(&self, soc: f64, inputs: &BatteryModeInputs<'_>, wall: DateTime<Utc>) -> bool {
        if soc >= self.cfg.charge_soc_limit {
            return false;
        }
        if let (Some(price), Some(limit)) = (inputs.current_price, self.cfg.grid_charge_limit) {
            if price < limit {
                return true;
            }
        }
        self.upcoming_peak(inputs.rates, wall)
    }

    fn in_peak(&self, price: Option<f64>, rates: Option<&RateWindow>, wall: DateTime<Utc>) -> bool {
        let (Some(price), Some(rates)) = (price, rates) else {
            return false;
        };
        let Some(avg) = rates.slice(wall, wall + self.cfg.peak_horizon).average() else {
            return false;
        };
        avg > 0.0 && price >= avg * self.cfg.peak_ratio
    }

    fn upcoming_peak(&self, rates: Option<&RateWindow>, wall: DateTime<Utc>) -> bool {
        let Some(rates) = rates else {
            return false;
        };
        let ahead = rates.slice(wall, wall + self.cfg.peak_horizon);
        match (ahead.max_value(), ahead.average()) {
            (Some(max), Some(avg)) => avg > 0.0 && max >= avg * self.cfg.peak_ratio,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::Rate;
    use chrono::TimeZone;

    fn cfg() -> BatteryModeConfig {
        BatteryModeConfig {
            charge_soc_limit: 50.0,
            grid_charge_limit: Some(0.10),
            mode_dwell: Duration::from_secs(60),
            ..BatteryModeConfig::default()
        }
    }

    fn wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn cheap_price_below_limit_forces_charging() {
        let mut ctrl = BatteryModeController::new(cfg());
        let inputs = BatteryModeInputs {
            soc: Some(20.0),
            current_price: Some(0.05),
            ..BatteryModeInputs::default()
        };
        assert_eq!(
            ctrl.decide(&inputs, wall(), Instant::now()),
            BatteryMode::ForcedCharge
        );
    }

    #[test]
    fn forced_charge_releases_on_soc_or_price() {
        let mut ctrl = BatteryModeController::new(cfg());
        let start = Instant::now();
        let engaged = BatteryModeInputs {
            soc: Some(20.0),
            current_price: Some(0.05),
            ..BatteryModeInputs::default()
        };
        ctrl.decide(&engaged, wall(), start);
        assert_eq!(ctrl.mode(), BatteryMode::ForcedCharge);

        // SoC reached the limit: release (after the dwell).
        let full = BatteryModeInputs {
            soc: Some(55.0),
            current_price: Some(0.05),
            ..BatteryModeInputs::default()
        };
        assert_eq!(
            ctrl.decide(&full, wall(), start + Duration::from_secs(61)),
            BatteryMode::Normal
        );

        // Price rose above the limit: release as well.
        ctrl.decide(&engaged, wall(), start + Duration::from_secs(130));
        let pricey = BatteryModeInputs {
            soc: Some(25.0),
            current_price: Some(0.25),
            ..BatteryModeInputs::default()
        };
        assert_eq!(
            ctrl.decide(&pricey, wall(), start + Duration::from_secs(200)),
            BatteryMode::Normal
        );
    }

    #[test]
    fn dwell_prevents_flapping() {
        let mut ctrl = BatteryModeController::new(cfg());
        let start = Instant::now();
        let engaged = BatteryModeInputs {
            soc: Some(20.0),
            current_price: Some(0.05),
            ..BatteryModeInputs::default()
        };
        let released = BatteryModeInputs {
            soc: Some(20.0),
            current_price: Some(0.20),
            ..BatteryModeInputs::default()
        };

        ctrl.decide(&engaged, wall(), start);
        // Release condition arrives inside the dwell: mode holds.
        assert_eq!(
            ctrl.decide(&released, wall(), start + Duration::from_secs(30)),
            BatteryMode::ForcedCharge
        );
        assert_eq!(
            ctrl.decide(&released, wall(), start + Duration::from_secs(61)),
            BatteryMode::Normal
        );
    }

    #[test]
    fn plan_discharge_holds_the_battery() {
        let mut ctrl = BatteryModeController::new(cfg());
        let inputs = BatteryModeInputs {
            soc: Some(80.0),
            current_price: Some(0.15),
            plan_active: true,
            discharging: true,
            ..BatteryModeInputs::default()
        };
        assert_eq!(
            ctrl.decide(&inputs, wall(), Instant::now()),
            BatteryMode::Hold
        );
    }

    #[test]
    fn peak_price_holds_stored_energy() {
        let mut ctrl = BatteryModeController::new(cfg());
        let rates = RateWindow::new(vec![
            Rate::new(wall(), wall() + chrono::Duration::hours(1), 0.60),
            Rate::new(
                wall() + chrono::Duration::hours(1),
                wall() + chrono::Duration::hours(2),
                0.10,
            ),
        ])
        .unwrap();
        let inputs = BatteryModeInputs {
            soc: Some(80.0),
            current_price: Some(0.60),
            rates: Some(&rates),
            ..BatteryModeInputs::default()
        };
        assert_eq!(
            ctrl.decide(&inputs, wall(), Instant::now()),
            BatteryMode::Hold
        );
    }

    #[test]
    fn manual_override_wins_and_auto_returns_control() {
        let mut ctrl = BatteryModeController::new(cfg());
        let start = Instant::now();
        ctrl.set_manual(Some(BatteryMode::Hold));
        let inputs = BatteryModeInputs {
            soc: Some(20.0),
            current_price: Some(0.05),
            ..BatteryModeInputs::default()
        };
        assert_eq!(ctrl.decide(&inputs, wall(), start), BatteryMode::Hold);

        ctrl.set_manual(None);
        assert_eq!(
            ctrl.decide(&inputs, wall(), start + Duration::from_secs(61)),
            BatteryMode::ForcedCharge
        );
    }

    #[test]
    fn unknown_soc_falls_back_to_normal() {
        let mut ctrl = BatteryModeController::new(cfg());
        let inputs = BatteryModeInputs::default();
        assert_eq!(
            ctrl.decide(&inputs, wall(), Instant::now()),
            BatteryMode::Normal
        );
    }
}
