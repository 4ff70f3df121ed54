use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::robot::RobotBase;
use crate::state::{OrchestrationState, Waypoint};

const POI_SETTLE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct WaypointFile {
    patrol_points: Vec<Waypoint>,
}

/// Reads the patrol route from a `{"patrol_points": [...]}` file.
pub async fn load_waypoints(path: impl AsRef<Path>) -> Result<Vec<Waypoint>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read patrol points from {}", path.display()))?;
    let file: WaypointFile = serde_json::from_str(&content)
        .with_context(|| format!("Invalid patrol points file {}", path.display()))?;
    Ok(file.patrol_points)
}

/// Waypoint names missing from the base and POI names the route does not know.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PoiMismatch {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
}

impl PoiMismatch {
    pub fn compare(waypoints: &[Waypoint], poi_names: &[String]) -> Self {
        let expected: BTreeSet<&str> = waypoints
            .iter()
            .map(|w| w.name.trim())
            .filter(|n| !n.is_empty())
            .collect();
        let actual: BTreeSet<&str> = poi_names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect();
        Self {
            missing: expected.difference(&actual).map(|n| n.to_string()).collect(),
            extra: actual.difference(&expected).map(|n| n.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

async fn poi_names(robot: &dyn RobotBase) -> Result<Vec<String>> {
    Ok(robot
        .get_pois()
        .await?
        .into_iter()
        .map(|poi| poi.display_name)
        .collect())
}

/// Makes the base's POIs match the route, rewriting them once if needed.
pub async fn reconcile_pois(
    robot: &dyn RobotBase,
    waypoints: &[Waypoint],
) -> Result<(), OrchestratorError> {
    let config_error = |e: anyhow::Error| OrchestratorError::Config(format!("{:#}", e));

    let mut names = poi_names(robot).await.map_err(config_error)?;
    if names.is_empty() {
        info!("[PATROL] Robot base reports no POIs yet, re-reading");
        tokio::time::sleep(POI_SETTLE_WAIT).await;
        names = poi_names(robot).await.map_err(config_error)?;
    }

    let mismatch = PoiMismatch::compare(waypoints, &names);
    if mismatch.is_empty() {
        info!("[PATROL] {} POIs match patrol points", names.len());
        return Ok(());
    }

    warn!(
        "[PATROL] POI mismatch, missing {:?}, extra {:?}; rewriting POIs",
        mismatch.missing, mismatch.extra
    );
    robot
        .reconcile_pois(waypoints)
        .await
        .map_err(config_error)?;

    let names = poi_names(robot).await.map_err(config_error)?;
    let mismatch = PoiMismatch::compare(waypoints, &names);
    if mismatch.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::Config(format!(
            "POIs do not match patrol points (missing: {}; extra: {})",
            mismatch.missing.join(", "),
            mismatch.extra.join(", ")
        )))
    }
}

/// Cyclic patrol route plus the rules for starting, cancelling and advancing
/// it. Progress flags live in `OrchestrationState`.
#[derive(Debug, Default)]
pub struct PatrolScheduler {
    waypoints: RwLock<Vec<Waypoint>>,
}

impl PatrolScheduler {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self {
            waypoints: RwLock::new(waypoints),
        }
    }

    pub fn set_waypoints(&self, waypoints: Vec<Waypoint>) {
        *self.waypoints.write().unwrap_or_else(PoisonError::into_inner) = waypoints;
    }

    pub fn len(&self) -> usize {
        self.waypoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks patrol as running. A fresh start rewinds to the first waypoint;
    /// otherwise the route resumes where it stopped.
    pub fn start(&self, state: &mut OrchestrationState, fresh: bool) -> Result<(), OrchestratorError> {
        let len = self.len();
        if len == 0 {
            return Err(OrchestratorError::no_patrol_points());
        }
        state.promotion_cancelled = false;
        state.promotion_active = true;
        state.patrolling = true;
        state.navigation_cancelled = false;
        if fresh || state.waypoint_index >= len {
            state.waypoint_index = 0;
        }
        info!(
            "[PATROL] Patrol started at waypoint {} ({})",
            state.waypoint_index,
            if fresh { "fresh" } else { "resume" }
        );
        Ok(())
    }

    /// Stops patrol and withdraws the promotion intent. Repeated calls are no-ops.
    pub fn cancel(&self, state: &mut OrchestrationState, reason: &str) {
        if !state.promotion_cancelled || state.promotion_active || state.patrolling {
            info!("[PATROL] Patrol cancelled: {}", reason);
        }
        state.promotion_cancelled = true;
        state.promotion_active = false;
        state.patrolling = false;
    }

    /// Patrol may take its next step.
    pub fn is_live(state: &OrchestrationState) -> bool {
        state.promotion_active && state.patrolling && !state.promotion_cancelled
    }

    pub fn current_waypoint(&self, state: &OrchestrationState) -> Option<Waypoint> {
        let waypoints = self.waypoints.read().unwrap_or_else(PoisonError::into_inner);
        if waypoints.is_empty() {
            return None;
        }
        waypoints.get(state.waypoint_index % waypoints.len()).cloned()
    }

    /// Moves to the next waypoint, wrapping past the end.
    pub fn advance(&self, state: &mut OrchestrationState) {
        let len = self.len();
        if len > 0 {
            state.waypoint_index = (state.waypoint_index + 1) % len;
        }
    }
}
