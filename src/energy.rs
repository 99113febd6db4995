use std::time::{Duration, Instant};

use tracing::debug;

/// Interval beyond which a power sample no longer extrapolates; the gap is
/// dropped rather than integrated.
pub const MAX_SAMPLE_GAP: Duration = Duration::from_secs(15 * 60);

/// Per-meter integrator turning instantaneous power samples into cumulative
/// kWh. When the device reports its own cumulative counter the counter delta
/// is preferred over integration; negative counter deltas (meter reset) are
/// ignored.
#[derive(Debug, Clone)]
pub struct EnergyAccumulator {
    accumulated_kwh: f64,
    last_sample: Option<Instant>,
    last_counter_kwh: Option<f64>,
    max_gap: Duration,
}

impl Default for EnergyAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyAccumulator {
    pub fn new() -> Self {
        Self {
            accumulated_kwh: 0.0,
            last_sample: None,
            last_counter_kwh: None,
            max_gap: MAX_SAMPLE_GAP,
        }
    }

    #[cfg(test)]
    fn with_max_gap(max_gap: Duration) -> Self {
        Self {
            max_gap,
            ..Self::new()
        }
    }

    /// Overwrite the accumulated total from persisted settings.
    pub fn restore(&mut self, kwh: f64) {
        self.accumulated_kwh = kwh;
    }

    pub fn accumulated_kwh(&self) -> f64 {
        self.accumulated_kwh
    }

    pub fn reset(&mut self) {
        self.accumulated_kwh = 0.0;
        self.last_counter_kwh = None;
    }

    /// Feed one sample. `power_w` integrates over the monotonic interval
    /// since the previous sample; `counter_kwh`, when present, supersedes
    /// integration for this step.
    pub fn update(&mut self, power_w: f64, counter_kwh: Option<f64>, now: Instant) {
        if let Some(counter) = counter_kwh {
            if let Some(last) = self.last_counter_kwh {
                let delta = counter - last;
                if delta >= 0.0 {
                    self.accumulated_kwh += delta;
                } else {
                    debug!(delta, "ignoring negative counter delta (meter reset)");
                }
            }
            self.last_counter_kwh = Some(counter);
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            let elapsed = now.saturating_duration_since(last);
            if elapsed <= self.max_gap {
                self.accumulated_kwh += power_w * elapsed.as_secs_f64() / 3600.0 / 1000.0;
            } else {
                debug!(gap_secs = elapsed.as_secs(), "sample gap too large, interval discarded");
            }
        }
        self.last_sample = Some(now);
    }
}
