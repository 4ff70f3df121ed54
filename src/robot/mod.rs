pub mod slamtec;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::Waypoint;

pub use slamtec::SlamtecBase;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockingStatus {
    OnDock,
    NotOnDock,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerStatus {
    pub battery_percentage: f32,
    #[serde(default)]
    pub docking_status: DockingStatus,
    #[serde(default)]
    pub is_charging: bool,
}

impl PowerStatus {
    pub fn on_dock(&self) -> bool {
        self.docking_status == DockingStatus::OnDock
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub slam_api_available: bool,
    pub has_error: bool,
    pub has_fatal: bool,
    pub emergency_stop: bool,
    pub base_errors: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.slam_api_available
            && !self.has_error
            && !self.has_fatal
            && self.base_errors.is_empty()
    }

    /// Human-readable reason the base is not fit to start.
    pub fn describe(&self) -> String {
        if !self.slam_api_available {
            "Robot base API is not reachable".to_string()
        } else if self.has_fatal {
            "Robot base reports a fatal error".to_string()
        } else if !self.base_errors.is_empty() {
            format!("Robot base errors: {}", self.base_errors.join(", "))
        } else if self.has_error {
            "Robot base reports errors".to_string()
        } else {
            "Robot base is healthy".to_string()
        }
    }
}

/// A point of interest stored on the robot base map.
#[derive(Debug, Clone, PartialEq)]
pub struct Poi {
    pub id: String,
    pub display_name: String,
    pub pose: PoseSample,
}

/// Optional primitives a base may offer for error recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseCapabilities {
    pub relocalize: bool,
    pub reset_connection: bool,
}

/// Motion and status interface of the robot base.
///
/// Motion calls resolve when the base reports the action finished. A failed
/// action is an `Err` whose message is the base's own reason text.
#[async_trait]
pub trait RobotBase: Send + Sync {
    async fn check_health(&self) -> Result<HealthReport>;

    async fn get_current_pose(&self) -> Result<PoseSample>;

    async fn navigate_to(&self, x: f64, y: f64, yaw: f64) -> Result<()>;

    async fn go_home(&self) -> Result<()>;

    async fn stop_navigation(&self) -> Result<()>;

    async fn get_power_status(&self) -> Result<PowerStatus>;

    async fn set_max_speed(&self, speed: f32) -> Result<()>;

    async fn get_pois(&self) -> Result<Vec<Poi>>;

    /// Replaces the base's POIs with one per waypoint.
    async fn reconcile_pois(&self, waypoints: &[Waypoint]) -> Result<()>;

    async fn relocalize(&self) -> Result<()>;

    async fn reset_connection(&self) -> Result<()>;

    fn capabilities(&self) -> BaseCapabilities;
}
