use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::SpeedConfig;
use crate::error::ErrorKind;
use crate::robot::RobotBase;
use crate::state::{TargetPose, Waypoint};

/// Automatic retries allowed for one navigation request.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

const PATH_BLOCKED_WAIT: Duration = Duration::from_secs(5);
const RELOCALIZE_WAIT: Duration = Duration::from_secs(3);
const RECONNECT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedProfile {
    Patrol,
    ProductSearch,
    Default,
}

/// Outcome of charging a failure against the recovery budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    Attempt(u32),
    Exhausted,
}

/// What the caller should do once a recovery strategy ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    ReturnToList,
    /// The motion was superseded while recovering.
    Cancelled,
}

/// Single-command motion layer over the robot base.
pub struct NavigationController {
    robot: Arc<dyn RobotBase>,
    speeds: SpeedConfig,
}

impl NavigationController {
    pub fn new(robot: Arc<dyn RobotBase>, speeds: SpeedConfig) -> Self {
        Self { robot, speeds }
    }

    pub async fn go_to(&self, pose: &TargetPose) -> Result<()> {
        self.robot
            .navigate_to(pose.x, pose.y, pose.yaw.unwrap_or(0.0))
            .await
    }

    pub async fn go_to_waypoint(&self, waypoint: &Waypoint) -> Result<()> {
        self.robot
            .navigate_to(waypoint.x, waypoint.y, waypoint.yaw)
            .await
    }

    pub async fn go_home(&self) -> Result<()> {
        self.robot.go_home().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.robot
            .stop_navigation()
            .await
            .context("Failed to stop navigation")
    }

    /// Applies a speed profile. Failures are logged and never block motion.
    pub async fn set_speed(&self, profile: SpeedProfile) {
        let speed = match profile {
            SpeedProfile::Patrol => self.speeds.patrol,
            SpeedProfile::ProductSearch => self.speeds.product_search,
            SpeedProfile::Default => self.speeds.default,
        };
        match self.robot.set_max_speed(speed).await {
            Ok(()) => info!("[NAV] Max speed set to {} ({:?})", speed, profile),
            Err(e) => warn!("[NAV] Failed to set speed {:?}: {}", profile, e),
        }
    }

    pub fn classify_error(&self, message: &str) -> ErrorKind {
        ErrorKind::classify(message)
    }

    /// Charges one failure against `attempts`. Exhaustion resets the counter so
    /// the next independent request starts with a full budget.
    pub fn begin_recovery(attempts: &mut u32) -> RecoveryPlan {
        if *attempts < MAX_RECOVERY_ATTEMPTS {
            *attempts += 1;
            RecoveryPlan::Attempt(*attempts)
        } else {
            *attempts = 0;
            RecoveryPlan::Exhausted
        }
    }

    /// Stops the base and runs the strategy for `kind`. Waits are cut short
    /// when `cancel` fires.
    pub async fn recover(
        &self,
        kind: ErrorKind,
        has_target: bool,
        cancel: &CancelToken,
    ) -> Result<RecoveryAction> {
        self.stop().await?;
        if cancel.is_cancelled() {
            return Ok(RecoveryAction::Cancelled);
        }

        let capabilities = self.robot.capabilities();
        let wait = match kind {
            ErrorKind::PathBlocked => {
                info!("[NAV] Path blocked, waiting before retry");
                PATH_BLOCKED_WAIT
            }
            ErrorKind::LocalizationLost if capabilities.relocalize => {
                info!("[NAV] Localization lost, relocalizing");
                self.robot
                    .relocalize()
                    .await
                    .context("Relocalization failed")?;
                RELOCALIZE_WAIT
            }
            ErrorKind::NavigationTimeout | ErrorKind::CommunicationError
                if capabilities.reset_connection =>
            {
                info!("[NAV] Resetting connection to robot base");
                self.robot
                    .reset_connection()
                    .await
                    .context("Connection reset failed")?;
                RECONNECT_WAIT
            }
            _ => return Ok(RecoveryAction::ReturnToList),
        };

        if !cancel.sleep(wait).await {
            return Ok(RecoveryAction::Cancelled);
        }
        if has_target {
            Ok(RecoveryAction::Retry)
        } else {
            Ok(RecoveryAction::ReturnToList)
        }
    }

    /// Logs the pose and health of the base to aid post-mortem analysis.
    pub async fn capture_diagnostics(&self, message: &str, kind: ErrorKind) {
        error!("[NAV] Robot base error ({}): {}", kind, message);
        match self.robot.get_current_pose().await {
            Ok(pose) => info!(
                "[NAV] Pose at failure: x={:.2} y={:.2} yaw={:.2}",
                pose.x, pose.y, pose.yaw
            ),
            Err(e) => warn!("[NAV] Pose unavailable at failure: {}", e),
        }
        match self.robot.check_health().await {
            Ok(health) => info!("[NAV] Health at failure: {:?}", health),
            Err(e) => warn!("[NAV] Health unavailable at failure: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRobot, RobotCall};
    use crate::robot::BaseCapabilities;

    fn controller(robot: &Arc<MockRobot>) -> NavigationController {
        NavigationController::new(robot.clone(), SpeedConfig::default())
    }

    #[test]
    fn recovery_budget_resets_on_exhaustion() {
        let mut attempts = 0;
        assert_eq!(
            NavigationController::begin_recovery(&mut attempts),
            RecoveryPlan::Attempt(1)
        );
        NavigationController::begin_recovery(&mut attempts);
        NavigationController::begin_recovery(&mut attempts);
        assert_eq!(attempts, MAX_RECOVERY_ATTEMPTS);
        assert_eq!(
            NavigationController::begin_recovery(&mut attempts),
            RecoveryPlan::Exhausted
        );
        assert_eq!(attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn path_blocked_waits_then_retries() {
        let robot = Arc::new(MockRobot::default());
        let nav = controller(&robot);
        let started = tokio::time::Instant::now();

        let action = nav
            .recover(ErrorKind::PathBlocked, true, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(action, RecoveryAction::Retry);
        assert_eq!(started.elapsed(), PATH_BLOCKED_WAIT);
        assert_eq!(robot.calls(), vec![RobotCall::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn without_target_recovery_returns_to_list() {
        let robot = Arc::new(MockRobot::default());
        let action = controller(&robot)
            .recover(ErrorKind::PathBlocked, false, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(action, RecoveryAction::ReturnToList);
    }

    #[tokio::test(start_paused = true)]
    async fn localization_loss_relocalizes_when_supported() {
        let robot = Arc::new(MockRobot::default());
        let started = tokio::time::Instant::now();
        let action = controller(&robot)
            .recover(ErrorKind::LocalizationLost, true, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(action, RecoveryAction::Retry);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(robot.calls(), vec![RobotCall::Stop, RobotCall::Relocalize]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_primitive_returns_to_list() {
        let robot = Arc::new(MockRobot::with_capabilities(BaseCapabilities::default()));
        let nav = controller(&robot);

        for kind in [
            ErrorKind::LocalizationLost,
            ErrorKind::NavigationTimeout,
            ErrorKind::CommunicationError,
            ErrorKind::HardwareFailure,
            ErrorKind::Unknown,
        ] {
            let action = nav.recover(kind, true, &CancelToken::new()).await.unwrap();
            assert_eq!(action, RecoveryAction::ReturnToList, "{kind}");
        }
        assert_eq!(robot.count(&RobotCall::ResetConnection), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_cuts_recovery_wait_short() {
        let robot = Arc::new(MockRobot::default());
        let nav = Arc::new(controller(&robot));
        let cancel = CancelToken::new();

        let task = tokio::spawn({
            let nav = nav.clone();
            let cancel = cancel.clone();
            async move { nav.recover(ErrorKind::CommunicationError, true, &cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap().unwrap(), RecoveryAction::Cancelled);
        assert_eq!(robot.count(&RobotCall::ResetConnection), 1);
    }

    #[tokio::test]
    async fn speed_profiles_map_to_configured_speeds() {
        let robot = Arc::new(MockRobot::default());
        let nav = controller(&robot);
        nav.set_speed(SpeedProfile::Patrol).await;
        nav.set_speed(SpeedProfile::ProductSearch).await;
        assert_eq!(
            robot.calls(),
            vec![RobotCall::SetSpeed(0.3), RobotCall::SetSpeed(0.7)]
        );
    }
}
