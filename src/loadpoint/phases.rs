use std::time::{Duration, Instant};

/// Timing knobs for automatic 1↔3 phase selection.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSwitchConfig {
    /// Sustained-surplus duration before switching up to 3 phases.
    pub up_delay: Duration,
    /// Sustained-deficit duration before switching down to 1 phase.
    pub down_delay: Duration,
    /// Device power-off dwell between disable and the switch command.
    pub device_dwell: Duration,
    /// Minimum spacing between two completed switches.
    pub min_interval: Duration,
}

impl Default for PhaseSwitchConfig {
    fn default() -> Self {
        Self {
            up_delay: Duration::from_secs(300),
            down_delay: Duration::from_secs(300),
            device_dwell: Duration::from_secs(10),
            min_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingSwitch {
    target: u8,
    disabled_at: Instant,
}

/// Auto phase-switch state: threshold timers plus the staged
/// disable → dwell → switch → re-enable procedure.
///
/// A switch is only started when the minimum interval since the previous
/// switch has passed and no plan window demands uninterrupted charging; the
/// threshold timers keep running while blocked so an expired delay fires as
/// soon as the blocker clears.
#[derive(Debug, Default)]
pub struct PhaseLogic {
    up_since: Option<Instant>,
    down_since: Option<Instant>,
    pending: Option<PendingSwitch>,
    last_switch: Option<Instant>,
}

impl PhaseLogic {
    /// Track thresholds and decide whether to begin a switch. Returns the
    /// target phase count when the staged procedure should start.
    pub fn evaluate(
        &mut self,
        cfg: &PhaseSwitchConfig,
        active_phases: u8,
        surplus_w: f64,
        min_1p_power_w: f64,
        plan_active: bool,
        now: Instant,
    ) -> Option<u8> {
        if self.pending.is_some() {
            return None;
        }

        // 3-phase minimum power is the threshold in both directions; the
        // hysteresis is temporal (distinct up/down delays).
        let threshold_w = 3.0 * min_1p_power_w;

        let target = match active_phases {
            1 if surplus_w >= threshold_w => {
                self.down_since = None;
                let since = *self.up_since.get_or_insert(now);
                (now.duration_since(since) >= cfg.up_delay).then_some(3u8)
            }
            3 if surplus_w < threshold_w => {
                self.up_since = None;
                let since = *self.down_since.get_or_insert(now);
                (now.duration_since(since) >= cfg.down_delay).then_some(1u8)
            }
            _ => {
                self.up_since = None;
                self.down_since = None;
                None
            }
        }?;

        if plan_active {
            return None;
        }
        if let Some(last) = self.last_switch {
            if now.duration_since(last) < cfg.min_interval {
                return None;
            }
        }
        Some(target)
    }

    /// Record that the charger has been disabled for a switch to `target`.
    pub fn begin(&mut self, target: u8, now: Instant) {
        self.pending = Some(PendingSwitch {
            target,
            disabled_at: now,
        });
        self.up_since = None;
        self.down_since = None;
    }

    /// The switch target once the device power-off dwell has elapsed.
    pub fn ready(&self, cfg: &PhaseSwitchConfig, now: Instant) -> Option<u8> {
        self.pending
            .filter(|p| now.duration_since(p.disabled_at) >= cfg.device_dwell)
            .map(|p| p.target)
    }

    pub fn complete(&mut self, now: Instant) {
        self.pending = None;
        self.last_switch = Some(now);
    }

    /// Abort a staged switch (e.g. vehicle disconnected mid-procedure).
    pub fn abort(&mut self) {
        self.pending = None;
    }

    pub fn switching(&self) -> bool {
        self.pending.is_some()
    }
}
