use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{BaseCapabilities, HealthReport, Poi, PoseSample, PowerStatus, RobotBase};
use crate::config::RobotConfig;
use crate::state::Waypoint;

const MOVE_TO_ACTION: &str = "slamtec.agent.actions.MoveToAction";
const GO_HOME_ACTION: &str = "slamtec.agent.actions.GoHomeAction";
const RECOVER_LOCALIZATION_ACTION: &str = "slamtec.agent.actions.RecoverLocalizationAction";

/// Action states reported by the base while an action runs.
const ACTION_FINISHED: i64 = 4;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    #[serde(default)]
    has_error: bool,
    #[serde(default)]
    has_fatal: bool,
    #[serde(default)]
    has_system_emergency_stop: bool,
    #[serde(default)]
    base_error: Vec<BaseError>,
}

impl From<HealthResponse> for HealthReport {
    /// Any parsed response means the base answered, whatever it reports.
    fn from(health: HealthResponse) -> Self {
        HealthReport {
            slam_api_available: true,
            has_error: health.has_error,
            has_fatal: health.has_fatal,
            emergency_stop: health.has_system_emergency_stop,
            base_errors: health
                .base_error
                .into_iter()
                .map(|e| format!("{} ({})", e.message, e.error_code))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BaseError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "errorCode")]
    error_code: i64,
}

#[derive(Debug, Deserialize)]
struct ActionCreated {
    action_id: i64,
}

#[derive(Debug, Deserialize)]
struct ActionStatus {
    action_name: Option<String>,
    #[serde(default)]
    state: Option<ActionState>,
}

#[derive(Debug, Deserialize)]
struct ActionState {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    result: i64,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct PoiResponse {
    id: String,
    #[serde(default)]
    metadata: PoiMetadata,
    pose: PoseSample,
}

#[derive(Debug, Default, Deserialize)]
struct PoiMetadata {
    #[serde(default)]
    display_name: String,
}

/// REST adapter for a Slamtec-based robot base.
pub struct SlamtecBase {
    client: Client,
    base_url: String,
    action_poll: Duration,
}

impl SlamtecBase {
    pub fn new(config: &RobotConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build robot base HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            action_poll: Duration::from_millis(config.action_poll_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("Connection error calling {}", path))?;
        if !response.status().is_success() {
            bail!("Request to {} failed with code: {}", path, response.status());
        }
        response
            .json()
            .await
            .with_context(|| format!("Invalid response from {}", path))
    }

    /// Starts an action and waits until the base reports it finished.
    async fn run_action(&self, body: Value) -> Result<()> {
        let response = self
            .client
            .post(self.url("/api/core/motion/v1/actions"))
            .json(&body)
            .send()
            .await
            .context("Connection error starting action")?;
        if !response.status().is_success() {
            bail!("Failed to start action: {}", response.status());
        }
        let created: ActionCreated = response
            .json()
            .await
            .context("Invalid action response")?;
        debug!("[NAV] Action {} started", created.action_id);
        self.monitor_action(created.action_id).await
    }

    async fn monitor_action(&self, action_id: i64) -> Result<()> {
        let path = format!("/api/core/motion/v1/actions/{}", action_id);
        loop {
            let response = self
                .client
                .get(self.url(&path))
                .send()
                .await
                .context("Error monitoring action")?;
            if !response.status().is_success() {
                bail!("Action monitoring failed: {}", response.status());
            }
            let status: ActionStatus = response.json().await.context("Invalid action status")?;

            // The base drops the action name once the action is gone.
            if status.action_name.is_none() {
                return Ok(());
            }
            if let Some(state) = status.state {
                if state.status == ACTION_FINISHED {
                    if state.result < 0 {
                        let reason = if state.reason.is_empty() {
                            format!("Action {} failed with result {}", action_id, state.result)
                        } else {
                            state.reason
                        };
                        bail!(reason);
                    }
                    return Ok(());
                }
            }
            tokio::time::sleep(self.action_poll).await;
        }
    }
}

#[async_trait]
impl RobotBase for SlamtecBase {
    async fn check_health(&self) -> Result<HealthReport> {
        let response = match self
            .client
            .get(self.url("/api/core/system/v1/robot/health"))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("[NAV] Cannot connect to robot: {}", e);
                return Ok(HealthReport::default());
            }
        };
        if response.status() != StatusCode::OK {
            warn!("[NAV] Health check failed with code: {}", response.status());
            return Ok(HealthReport::default());
        }
        let health: HealthResponse = response.json().await.context("Invalid health response")?;
        Ok(health.into())
    }

    async fn get_current_pose(&self) -> Result<PoseSample> {
        self.get_json("/api/core/slam/v1/localization/pose").await
    }

    async fn navigate_to(&self, x: f64, y: f64, yaw: f64) -> Result<()> {
        info!("[NAV] Moving to ({:.2}, {:.2}, yaw {:.2})", x, y, yaw);
        self.run_action(json!({
            "action_name": MOVE_TO_ACTION,
            "options": {
                "target": { "x": x, "y": y, "z": 0 },
                "move_options": {
                    "mode": 0,
                    "flags": ["with_yaw"],
                    "yaw": yaw,
                    "acceptable_precision": 0,
                    "fail_retry_count": 0
                }
            }
        }))
        .await
    }

    async fn go_home(&self) -> Result<()> {
        info!("[NAV] Returning to dock");
        self.run_action(json!({
            "action_name": GO_HOME_ACTION,
            "gohome_options": {
                "flags": "dock",
                "back_to_landing": true,
                "charging_retry_count": 3
            }
        }))
        .await
    }

    async fn stop_navigation(&self) -> Result<()> {
        let response = self
            .client
            .delete(self.url("/api/core/motion/v1/actions/:current"))
            .send()
            .await
            .context("Connection error stopping navigation")?;
        if !response.status().is_success() {
            bail!("Failed to stop navigation: {}", response.status());
        }
        Ok(())
    }

    async fn get_power_status(&self) -> Result<PowerStatus> {
        self.get_json("/api/core/system/v1/power/status").await
    }

    async fn set_max_speed(&self, speed: f32) -> Result<()> {
        let response = self
            .client
            .put(self.url("/api/core/system/v1/parameter"))
            .json(&json!({ "param": "base.max_moving_speed", "value": speed.to_string() }))
            .send()
            .await
            .context("Connection error setting max speed")?;
        if !response.status().is_success() {
            bail!("Failed to set max speed: {}", response.status());
        }
        Ok(())
    }

    async fn get_pois(&self) -> Result<Vec<Poi>> {
        let pois: Vec<PoiResponse> = self.get_json("/api/core/artifact/v1/pois").await?;
        Ok(pois
            .into_iter()
            .map(|poi| Poi {
                id: poi.id,
                display_name: poi.metadata.display_name,
                pose: poi.pose,
            })
            .collect())
    }

    async fn reconcile_pois(&self, waypoints: &[Waypoint]) -> Result<()> {
        let response = self
            .client
            .delete(self.url("/api/core/artifact/v1/pois"))
            .send()
            .await
            .context("Connection error clearing POIs")?;
        if !response.status().is_success() {
            bail!("Failed to clear POIs: {}", response.status());
        }

        for (index, waypoint) in waypoints.iter().enumerate() {
            let body = json!({
                "id": format!("patrol-{}", index),
                "pose": { "x": waypoint.x, "y": waypoint.y, "yaw": waypoint.yaw },
                "metadata": {
                    "display_name": waypoint.name,
                    "type": "",
                    "group": ""
                }
            });
            let response = self
                .client
                .post(self.url("/api/core/artifact/v1/pois"))
                .json(&body)
                .send()
                .await
                .with_context(|| format!("Connection error creating POI {}", waypoint.name))?;
            if !response.status().is_success() {
                return Err(anyhow!(
                    "Failed to create POI {}: {}",
                    waypoint.name,
                    response.status()
                ));
            }
        }
        info!("[PATROL] Uploaded {} POIs to robot base", waypoints.len());
        Ok(())
    }

    async fn relocalize(&self) -> Result<()> {
        self.run_action(json!({
            "action_name": RECOVER_LOCALIZATION_ACTION,
            "options": {}
        }))
        .await
    }

    async fn reset_connection(&self) -> Result<()> {
        bail!("Connection reset is not supported by this robot base")
    }

    fn capabilities(&self) -> BaseCapabilities {
        BaseCapabilities {
            relocalize: true,
            reset_connection: false,
        }
    }
}
