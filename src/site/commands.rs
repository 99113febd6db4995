use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::device::BatteryMode;
use crate::loadpoint::ChargeMode;
use crate::planner::ChargePlan;

/// Requested battery mode; `Auto` returns control to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatteryModeRequest {
    Normal,
    Hold,
    ForcedCharge,
    Auto,
}

impl BatteryModeRequest {
    pub fn as_override(self) -> Option<BatteryMode> {
        match self {
            BatteryModeRequest::Normal => Some(BatteryMode::Normal),
            BatteryModeRequest::Hold => Some(BatteryMode::Hold),
            BatteryModeRequest::ForcedCharge => Some(BatteryMode::ForcedCharge),
            BatteryModeRequest::Auto => None,
        }
    }
}

/// The control surface exposed to the embedding host. Commands are queued
/// and drained at the start of the next tick; no site state mutates outside
/// a tick boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode { loadpoint: String, mode: ChargeMode },
    SetMinCurrent { loadpoint: String, amps: f64 },
    SetMaxCurrent { loadpoint: String, amps: f64 },
    SetPhases { loadpoint: String, phases: u8 },
    SetPlan { loadpoint: String, plan: ChargePlan },
    ClearPlan { loadpoint: String },
    SetPriority { loadpoint: String, priority: u32 },
    SetBatteryMode { mode: BatteryModeRequest },
    /// Operator reset of a faulted loadpoint.
    ResetError { loadpoint: String },
}

/// Cloneable sender half handed to API layers.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<Command>,
}

impl CommandHandle {
    pub async fn send(&self, command: Command) -> bool {
        self.tx.send(command).await.is_ok()
    }

    /// Non-blocking variant for synchronous callers; drops the command when
    /// the queue is full.
    pub fn try_send(&self, command: Command) -> bool {
        self.tx.try_send(command).is_ok()
    }
}

pub fn command_channel(capacity: usize) -> (CommandHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandHandle { tx }, rx)
}
