// Command and status types shared across the runtime
use serde::{Deserialize, Serialize};

use crate::cal::{CalState, RoutineId, Stage};

/// Unicycle velocity command: linear m/s, angular rad/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub linear: f32,
    pub angular: f32,
}

impl VelocityCommand {
    pub fn stop() -> Self {
        Self::default()
    }

    pub fn is_stop(&self) -> bool {
        self.linear == 0.0 && self.angular == 0.0
    }
}

/// Per-wheel counts/sec targets. Calibration routines write these directly,
/// bypassing the unicycle layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelTargets {
    pub left_cps: f32,
    pub right_cps: f32,
}

/// Active-routine snapshot for the console query command.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineReport {
    pub routine: RoutineId,
    pub stage: Stage,
    pub state: CalState,
}

/// Full runtime snapshot printed on query.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub cal_status: u16,
    pub engine: Option<EngineReport>,
    pub moving: bool,
    pub left_cps: f32,
    pub right_cps: f32,
    pub x: f32,
    pub y: f32,
    pub heading: f32,
}
