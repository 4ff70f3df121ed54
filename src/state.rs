use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;

/// Operating mode shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Idle,
    Navigating,
    Arrived,
    Error,
    Patrol,
}

impl Mode {
    /// Modes in which the base is expected to be moving.
    pub fn is_moving(self) -> bool {
        matches!(self, Mode::Navigating | Mode::Patrol)
    }
}

/// A named patrol stop in map coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPose {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    /// Heading in radians. Defaults to 0 when the caller does not care.
    #[serde(default)]
    pub yaw: Option<f64>,
}

/// A user-selected destination, usually a product location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    pub pose: TargetPose,
}

/// Mutable orchestration state, guarded by a single lock in the orchestrator.
#[derive(Debug, Default)]
pub struct OrchestrationState {
    pub mode: Mode,
    pub promotion_active: bool,
    pub promotion_cancelled: bool,
    pub patrolling: bool,
    pub waypoint_index: usize,
    pub returning_to_charger: bool,
    pub recovery_attempts: u32,
    pub navigation_cancelled: bool,
    pub target: Option<Target>,
    pub last_error: Option<String>,
    pub battery_percentage: Option<f32>,
    /// Token of the motion currently allowed to commit results.
    pub motion: Option<CancelToken>,
}

impl OrchestrationState {
    /// Cancels the current motion, if any, and returns whether one was running.
    pub fn take_motion(&mut self) -> bool {
        match self.motion.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            mode: self.mode,
            promotion_active: self.promotion_active,
            patrolling: self.patrolling,
            waypoint_index: self.waypoint_index,
            returning_to_charger: self.returning_to_charger,
            recovery_attempts: self.recovery_attempts,
            target: self.target.clone(),
            last_error: self.last_error.clone(),
            battery_percentage: self.battery_percentage,
        }
    }
}

/// Read-only view served to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub mode: Mode,
    pub promotion_active: bool,
    pub patrolling: bool,
    pub waypoint_index: usize,
    pub returning_to_charger: bool,
    pub recovery_attempts: u32,
    pub target: Option<Target>,
    pub last_error: Option<String>,
    pub battery_percentage: Option<f32>,
}
