use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::energy::EnergyAccumulator;

/// One charging session, opened when a vehicle connects and finalized when
/// it disconnects. Session energy is the charger's cumulative counter delta
/// when available, otherwise integrated from measured charge power.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub charge_started_at: Option<DateTime<Utc>>,
    start_counter_kwh: Option<f64>,
    integrator: EnergyAccumulator,
    energy_kwh: f64,
}

/// Published when a session ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub energy_kwh: f64,
}

impl Session {
    pub fn new(started_at: DateTime<Utc>, counter_kwh: Option<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            charge_started_at: None,
            start_counter_kwh: counter_kwh,
            integrator: EnergyAccumulator::new(),
            energy_kwh: 0.0,
        }
    }

    /// Seed session energy from persisted state after a restart.
    pub fn restore_energy(&mut self, kwh: f64) {
        self.energy_kwh = kwh.max(0.0);
        self.integrator.restore(self.energy_kwh);
    }

    pub fn note_charge_start(&mut self, at: DateTime<Utc>) {
        if self.charge_started_at.is_none() {
            self.charge_started_at = Some(at);
        }
    }

    /// Advance session energy. Monotone non-decreasing for the lifetime of
    /// the session.
    pub fn update(
        &mut self,
        counter_kwh: Option<f64>,
        charge_power_w: f64,
        charging: bool,
        now: Instant,
    ) {
        if let Some(counter) = counter_kwh {
            let start = *self.start_counter_kwh.get_or_insert(counter);
            let delta = counter - start;
            if delta > self.energy_kwh {
                self.energy_kwh = delta;
            }
            return;
        }

        let power = if charging { charge_power_w.max(0.0) } else { 0.0 };
        self.integrator.update(power, None, now);
        if self.integrator.accumulated_kwh() > self.energy_kwh {
            self.energy_kwh = self.integrator.accumulated_kwh();
        }
    }

    pub fn energy_kwh(&self) -> f64 {
        self.energy_kwh
    }

    pub fn finalize(self, ended_at: DateTime<Utc>) -> SessionSummary {
        SessionSummary {
            id: self.id,
            started_at: self.started_at,
            ended_at,
            energy_kwh: self.energy_kwh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_delta_drives_session_energy() {
        let mut session = Session::new(Utc::now(), Some(120.0));
        let now = Instant::now();
        session.update(Some(121.5), 0.0, true, now);
        assert!((session.energy_kwh() - 1.5).abs() < 1e-9);

        // A dip in the counter never reduces session energy.
        session.update(Some(121.0), 0.0, true, now);
        assert!((session.energy_kwh() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn integrates_power_without_counter() {
        let mut session = Session::new(Utc::now(), None);
        let start = Instant::now();
        session.update(None, 6900.0, true, start);
        session.update(None, 6900.0, true, start + Duration::from_secs(3600));
        assert!((session.energy_kwh() - 6.9).abs() < 1e-6);
    }

    #[test]
    fn idle_periods_add_nothing() {
        let mut session = Session::new(Utc::now(), None);
        let start = Instant::now();
        session.update(None, 0.0, false, start);
        session.update(None, 0.0, false, start + Duration::from_secs(600));
        assert_eq!(session.energy_kwh(), 0.0);
    }

    #[test]
    fn finalize_reports_totals() {
        let started = Utc::now();
        let mut session = Session::new(started, Some(10.0));
        session.update(Some(14.2), 0.0, true, Instant::now());
        let ended = started + chrono::Duration::hours(2);
        let summary = session.finalize(ended);
        assert_eq!(summary.started_at, started);
        assert_eq!(summary.ended_at, ended);
        assert!((summary.energy_kwh - 4.2).abs() < 1e-9);
    }

    #[test]
    fn restored_energy_stays_monotone() {
        let mut session = Session::new(Utc::now(), None);
        session.restore_energy(3.0);
        let start = Instant::now();
        session.update(None, 1000.0, true, start);
        session.update(None, 1000.0, true, start + Duration::from_secs(360));
        assert!(session.energy_kwh() >= 3.0);
    }
}
