use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::auth::AuthSession;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::patrol::{load_waypoints, reconcile_pois};
use crate::robot::RobotBase;
use crate::state::Waypoint;

#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub timeout: Duration,
    pub require_dock: bool,
    pub dock_poll: Duration,
    pub waypoints_path: PathBuf,
}

impl StartupOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.startup.timeout_secs),
            require_dock: config.startup.require_dock,
            dock_poll: Duration::from_secs(config.startup.dock_poll_secs),
            waypoints_path: PathBuf::from(&config.patrol.waypoints_path),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartupOutcome {
    Ready,
    /// Waypoints are loaded but the route and the base disagree.
    ConfigIssue(OrchestratorError),
    /// The base is unusable or startup ran out of time.
    Degraded(OrchestratorError),
}

impl StartupOutcome {
    pub fn error(&self) -> Option<&OrchestratorError> {
        match self {
            StartupOutcome::Ready => None,
            StartupOutcome::ConfigIssue(e) | StartupOutcome::Degraded(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub struct StartupReport {
    pub outcome: StartupOutcome,
    pub waypoints: Vec<Waypoint>,
}

/// Brings the robot to a known state before the orchestrator takes commands.
///
/// Never blocks longer than `options.timeout`; on timeout the service starts
/// degraded with no route.
pub async fn initialize(
    robot: &dyn RobotBase,
    auth: &AuthSession,
    options: &StartupOptions,
) -> StartupReport {
    match tokio::time::timeout(options.timeout, run_sequence(robot, auth, options)).await {
        Ok(report) => report,
        Err(_) => {
            warn!("Startup did not finish within {:?}", options.timeout);
            StartupReport {
                outcome: StartupOutcome::Degraded(OrchestratorError::Startup(format!(
                    "Startup timed out after {}s",
                    options.timeout.as_secs()
                ))),
                waypoints: Vec::new(),
            }
        }
    }
}

async fn run_sequence(
    robot: &dyn RobotBase,
    auth: &AuthSession,
    options: &StartupOptions,
) -> StartupReport {
    if let Err(e) = check_health(robot).await {
        return StartupReport {
            outcome: StartupOutcome::Degraded(e),
            waypoints: Vec::new(),
        };
    }

    if options.require_dock {
        wait_for_dock(robot, options.dock_poll).await;
    }

    if let Err(e) = auth.authenticate().await {
        warn!(
            "[AUTH] Authentication failed, continuing with limited functionality: {:#}",
            e
        );
    }

    let waypoints = match load_waypoints(&options.waypoints_path).await {
        Ok(waypoints) => waypoints,
        Err(e) => {
            return StartupReport {
                outcome: StartupOutcome::ConfigIssue(OrchestratorError::Config(format!(
                    "{:#}",
                    e
                ))),
                waypoints: Vec::new(),
            }
        }
    };
    if waypoints.is_empty() {
        return StartupReport {
            outcome: StartupOutcome::ConfigIssue(OrchestratorError::no_patrol_points()),
            waypoints,
        };
    }

    let outcome = match reconcile_pois(robot, &waypoints).await {
        Ok(()) => StartupOutcome::Ready,
        Err(e) => StartupOutcome::ConfigIssue(e),
    };
    StartupReport { outcome, waypoints }
}

async fn check_health(robot: &dyn RobotBase) -> Result<(), OrchestratorError> {
    let health = robot
        .check_health()
        .await
        .map_err(|e| OrchestratorError::Startup(format!("Health check failed: {:#}", e)))?;
    if !health.is_healthy() {
        return Err(OrchestratorError::Startup(health.describe()));
    }
    if health.emergency_stop {
        warn!("Robot base emergency stop is engaged");
    }
    info!("Robot base is healthy");
    Ok(())
}

async fn wait_for_dock(robot: &dyn RobotBase, poll: Duration) {
    loop {
        match robot.get_power_status().await {
            Ok(status) if status.on_dock() => {
                info!("[BATTERY] Robot is on dock ({}%)", status.battery_percentage);
                return;
            }
            Ok(status) => info!(
                "[BATTERY] Waiting for robot to dock ({:?})",
                status.docking_status
            ),
            Err(e) => warn!("[BATTERY] Failed to read power status: {}", e),
        }
        tokio::time::sleep(poll).await;
    }
}
