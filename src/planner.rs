use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rates::{Rate, RateWindow};

/// Losses between meter and vehicle battery applied when deriving required
/// energy from a SoC goal.
pub const CHARGE_EFFICIENCY: f64 = 0.95;

/// What a plan commits to deliver by its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanGoal {
    /// Session energy in kWh.
    Energy(f64),
    /// Vehicle SoC in percent; requires a bound vehicle with known capacity.
    Soc(f64),
}

/// A charging commitment: reach the goal by `deadline`. `precondition` is
/// an optional duration immediately before the deadline during which
/// charging runs unconditionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargePlan {
    pub deadline: DateTime<Utc>,
    pub goal: PlanGoal,
    #[serde(default)]
    pub precondition_secs: u64,
}

impl ChargePlan {
    /// Required energy in kWh given the current vehicle state, or `None`
    /// when a SoC goal has no vehicle capacity to resolve against.
    pub fn required_energy_kwh(
        &self,
        vehicle_soc: Option<f64>,
        vehicle_capacity_kwh: Option<f64>,
    ) -> Option<f64> {
        match self.goal {
            PlanGoal::Energy(kwh) => Some(kwh.max(0.0)),
            PlanGoal::Soc(goal) => {
                let (soc, capacity) = (vehicle_soc?, vehicle_capacity_kwh?);
                let delta = (goal - soc).max(0.0) / 100.0 * capacity;
                Some(delta / CHARGE_EFFICIENCY)
            }
        }
    }
}

/// Where a partially used interval anchors its active portion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStrategy {
    /// Active portion ends flush with the interval end (finish at deadline).
    #[default]
    Late,
    /// Active portion extends forward from the interval start.
    Early,
}

/// A contiguous active charging window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PlanWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    pub fn hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }
}

/// Result of one planning pass. Re-running with unchanged inputs yields the
/// identical schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    /// Ordered, merged active windows.
    pub windows: Vec<PlanWindow>,
    /// Whether the current instant falls in an active window.
    pub active_now: bool,
    /// The next active window strictly after now, if any.
    pub next_window: Option<PlanWindow>,
    /// The rate coverage cannot deliver the required energy; charging
    /// proceeds continuously.
    pub insufficient: bool,
    /// Energy the selected windows deliver at max charge power.
    pub planned_energy_kwh: f64,
}

impl Schedule {
    pub fn inactive() -> Self {
        Self {
            windows: Vec::new(),
            active_now: false,
            next_window: None,
            insufficient: false,
            planned_energy_kwh: 0.0,
        }
    }
}

/// Interval-weighted greedy charge planner.
///
/// Intervals are taken cheapest-first with deterministic `(value, start)`
/// ordering; the marginal interval is used partially, anchored according to
/// the configured strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Planner {
    pub strategy: PlanStrategy,
}

impl Planner {
    pub fn new(strategy: PlanStrategy) -> Self {
        Self { strategy }
    }

    pub fn plan(
        &self,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
        required_kwh: f64,
        max_power_w: f64,
        rates: &RateWindow,
    ) -> Schedule {
        if required_kwh <= 0.0 || deadline <= now || max_power_w <= 0.0 {
            return Schedule::inactive();
        }
        let max_power_kw = max_power_w / 1000.0;

        let window = rates.slice(now, deadline);
        if window.is_empty() {
            return self.continuous(now, deadline, required_kwh, max_power_kw);
        }

        // Full-length contribution of every covered interval.
        let feasible_kwh: f64 = window.iter().map(|r| r.hours() * max_power_kw).sum();
        if feasible_kwh + f64::EPSILON < required_kwh {
            warn!(
                required_kwh,
                feasible_kwh, "plan infeasible, charging continuously"
            );
            let windows = merge(window.iter().map(|r| PlanWindow {
                start: r.start,
                end: r.end,
            }));
            return finalize(windows, now, true, feasible_kwh);
        }

        let mut remaining_kwh = required_kwh;
        let mut selected: Vec<PlanWindow> = Vec::new();
        for rate in window.sorted_by_value() {
            if remaining_kwh <= 1e-9 {
                break;
            }
            let need_hours = remaining_kwh / max_power_kw;
            let take_hours = need_hours.min(rate.hours());
            let portion = self.portion(&rate, take_hours);
            remaining_kwh -= take_hours * max_power_kw;
            selected.push(portion);
        }

        selected.sort_by_key(|w| w.start);
        let planned_kwh = required_kwh - remaining_kwh.max(0.0);
        debug!(
            windows = selected.len(),
            planned_kwh, "plan computed"
        );
        finalize(merge(selected.into_iter()), now, false, planned_kwh)
    }

    /// Plan with a precondition: the final stretch before the deadline is
    /// always active, the rest is optimised as usual.
    pub fn plan_with_precondition(
        &self,
        now: DateTime<Utc>,
        plan: &ChargePlan,
        required_kwh: f64,
        max_power_w: f64,
        rates: &RateWindow,
    ) -> Schedule {
        let precondition = Duration::seconds(plan.precondition_secs as i64);
        if precondition <= Duration::zero() {
            return self.plan(now, plan.deadline, required_kwh, max_power_w, rates);
        }

        let forced_start = (plan.deadline - precondition).max(now);
        let forced = PlanWindow {
            start: forced_start,
            end: plan.deadline,
        };
        let forced_kwh = forced.hours() * max_power_w / 1000.0;
        let rest = self.plan(
            now,
            forced_start,
            (required_kwh - forced_kwh).max(0.0),
            max_power_w,
            rates,
        );

        let mut windows = rest.windows;
        windows.push(forced);
        windows.sort_by_key(|w| w.start);
        finalize(
            merge(windows.into_iter()),
            now,
            rest.insufficient,
            rest.planned_energy_kwh + forced_kwh,
        )
    }

    fn portion(&self, rate: &Rate, take_hours: f64) -> PlanWindow {
        let take = Duration::milliseconds((take_hours * 3_600_000.0).round() as i64);
        match self.strategy {
            PlanStrategy::Late => PlanWindow {
                start: rate.end - take,
                end: rate.end,
            },
            PlanStrategy::Early => PlanWindow {
                start: rate.start,
                end: rate.start + take,
            },
        }
    }

    /// No rate data: charge now until the requirement is met.
    fn continuous(
        &self,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
        required_kwh: f64,
        max_power_kw: f64,
    ) -> Schedule {
        let need_hours = required_kwh / max_power_kw;
        let end = now + Duration::milliseconds((need_hours * 3_600_000.0).round() as i64);
        let insufficient = end > deadline;
        if insufficient {
            warn!(required_kwh, "no rates and deadline too close, charging continuously");
        }
        let window = PlanWindow {
            start: now,
            end: end.min(deadline),
        };
        let planned = window.hours() * max_power_kw;
        finalize(vec![window], now, insufficient, planned)
    }
}

fn merge(windows: impl Iterator<Item = PlanWindow>) -> Vec<PlanWindow> {
    let mut merged: Vec<PlanWindow> = Vec::new();
    for window in windows {
        if window.end <= window.start {
            continue;
        }
        match merged.last_mut() {
            Some(last) if window.start <= last.end => {
                last.end = last.end.max(window.end);
            }
            _ => merged.push(window),
        }
    }
    merged
}

fn finalize(
    windows: Vec<PlanWindow>,
    now: DateTime<Utc>,
    insufficient: bool,
    planned_energy_kwh: f64,
) -> Schedule {
    let active_now = windows.iter().any(|w| w.contains(now));
    let next_window = windows.iter().find(|w| w.start > now).copied();
    Schedule {
        windows,
        active_now,
        next_window,
        insufficient,
        planned_energy_kwh,
    }
}
