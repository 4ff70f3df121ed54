use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::domain::{DomainClient, DomainPose, PosePayload, UploadMode};
use crate::identity::IdentityStore;
use crate::robot::{PoseSample, RobotBase};
use crate::state::Mode;
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

/// Rotation about the vertical axis only.
pub fn yaw_to_quaternion(yaw: f64) -> Quaternion {
    let half = yaw / 2.0;
    Quaternion {
        x: 0.0,
        y: 0.0,
        z: half.sin(),
        w: half.cos(),
    }
}

/// Maps a map-frame pose into the domain frame: x stays, the ground plane is
/// y = 0, and map y becomes depth z with its sign flipped.
pub fn transform(pose: &PoseSample) -> DomainPose {
    let q = yaw_to_quaternion(pose.yaw);
    DomainPose {
        px: pose.x,
        py: 0.0,
        pz: -pose.y,
        // The domain frame is y-up, so the yaw component lands in ry.
        rx: q.x,
        ry: q.z,
        rz: q.y,
        rw: q.w,
    }
}

/// Periodic pose reporter. Only the latest pose matters: ticks that find an
/// upload in flight or a cooldown running are dropped.
pub struct TelemetryUploader {
    robot: Arc<dyn RobotBase>,
    domain: Arc<dyn DomainClient>,
    identity: Arc<IdentityStore>,
    interval: Duration,
    cooldown: Duration,
    busy: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
}

impl TelemetryUploader {
    pub fn new(
        robot: Arc<dyn RobotBase>,
        domain: Arc<dyn DomainClient>,
        identity: Arc<IdentityStore>,
        interval: Duration,
        cooldown: Duration,
    ) -> Self {
        info!(
            "[POSE] Creating pose uploader for {}",
            identity.identity.device_id
        );
        Self {
            robot,
            domain,
            identity,
            interval,
            cooldown,
            busy: AtomicBool::new(false),
            cooldown_until: Mutex::new(None),
        }
    }

    fn in_cooldown(&self) -> bool {
        let cooldown = self
            .cooldown_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        matches!(*cooldown, Some(until) if Instant::now() < until)
    }

    fn start_cooldown(&self) {
        *self
            .cooldown_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + self.cooldown);
    }

    pub fn build_payload(&self, pose: &PoseSample) -> PosePayload {
        let identity = &self.identity.identity;
        PosePayload {
            name: identity.name.clone(),
            device_id: identity.device_id.clone(),
            device_type: identity.device_type.clone(),
            timestamp: util::now_nanos().to_string(),
            pose: transform(pose),
            mac_address: identity.mac_address.clone(),
        }
    }

    /// Starts one upload unless the previous one is still running or a
    /// cooldown is active. Returns whether an upload was started.
    pub fn tick(self: &Arc<Self>) -> bool {
        if self.in_cooldown() {
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[POSE] Skipping tick: previous upload still in progress");
            return false;
        }

        let uploader = self.clone();
        tokio::spawn(async move {
            if let Err(e) = uploader.upload_once().await {
                warn!("[POSE] Pose sample skipped: {:#}", e);
            }
            uploader.busy.store(false, Ordering::SeqCst);
        });
        true
    }

    async fn upload_once(&self) -> Result<()> {
        let pose = self
            .robot
            .get_current_pose()
            .await
            .context("Failed to read pose")?;
        let payload = self.build_payload(&pose);
        let existing_id = self.identity.pose_data_id()?;

        let result = match existing_id.as_deref() {
            Some(id) => self.domain.upload_pose(&payload, UploadMode::Put, Some(id)).await,
            None => self.domain.upload_pose(&payload, UploadMode::Post, None).await,
        };

        match result {
            Ok(result) => {
                if let Some(data_id) = result.data_id.filter(|_| existing_id.is_none()) {
                    info!("[POSE] Pose record created: {}", data_id);
                    self.identity.set_pose_data_id(data_id)?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[POSE] Error sending pose data, pausing for {:?}: {}",
                    self.cooldown, e
                );
                self.start_cooldown();
                Ok(())
            }
        }
    }

    /// Reports poses while the mode is a moving one, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut mode_rx: watch::Receiver<Mode>, shutdown: CancelToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = mode_rx.wait_for(|mode| mode.is_moving()) => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            info!("[POSE] Pose reporting started");
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("[POSE] Shutting down pose reporting");
                        return;
                    }
                    _ = interval.tick() => {
                        if !mode_rx.borrow().is_moving() {
                            break;
                        }
                        self.tick();
                    }
                }
            }
            info!("[POSE] Pose reporting stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::mock::{MockDomain, MockRobot};
    use anyhow::anyhow;
    use std::f64::consts::PI;

    fn uploader(robot: &Arc<MockRobot>, domain: &Arc<MockDomain>) -> Arc<TelemetryUploader> {
        let identity = DeviceIdentity {
            device_id: "DEV1".to_string(),
            mac_address: "AABBCC".to_string(),
            device_type: "padbot-robot-w3".to_string(),
            name: "PadBot".to_string(),
        };
        Arc::new(TelemetryUploader::new(
            robot.clone(),
            domain.clone(),
            Arc::new(IdentityStore::new(identity)),
            Duration::from_secs(1),
            Duration::from_secs(10),
        ))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn transforms_into_domain_frame() {
        let pose = transform(&PoseSample {
            x: 1.5,
            y: 2.0,
            yaw: PI,
        });
        assert_eq!(pose.px, 1.5);
        assert_eq!(pose.py, 0.0);
        assert_eq!(pose.pz, -2.0);
        assert!((pose.ry - 1.0).abs() < 1e-9);
        assert!(pose.rw.abs() < 1e-9);
        assert_eq!(pose.rx, 0.0);
        assert_eq!(pose.rz, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_upload_posts_then_puts_with_cached_id() {
        let robot = Arc::new(MockRobot::default());
        let domain = Arc::new(MockDomain::default());
        let uploader = uploader(&robot, &domain);

        assert!(uploader.tick());
        settle().await;
        assert!(uploader.tick());
        settle().await;

        let uploads = domain.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].1, UploadMode::Post);
        assert_eq!(uploads[1].1, UploadMode::Put);
        assert_eq!(uploads[1].2.as_deref(), Some("pose-record"));
        assert_eq!(uploads[0].0.device_id, "DEV1");
        assert_eq!(uploads[0].0.pose.pz, -2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn timestamp_is_unix_nanoseconds() {
        let robot = Arc::new(MockRobot::default());
        let domain = Arc::new(MockDomain::default());
        let uploader = uploader(&robot, &domain);

        let before = util::now_nanos();
        assert!(uploader.tick());
        settle().await;
        let after = util::now_nanos();

        let timestamp: i64 = domain.uploads()[0].0.timestamp.parse().unwrap();
        assert!(timestamp > 1_000_000_000_000_000_000, "{timestamp}");
        assert!((before..=after).contains(&timestamp));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_starts_cooldown() {
        let robot = Arc::new(MockRobot::default());
        let domain = Arc::new(MockDomain::default());
        domain.push_upload(Err(anyhow!("503 Service Unavailable")));
        let uploader = uploader(&robot, &domain);

        assert!(uploader.tick());
        settle().await;
        assert!(!uploader.tick());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(uploader.tick());
        settle().await;
        assert_eq!(domain.uploads().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pose_failure_skips_sample_without_cooldown() {
        let robot = Arc::new(MockRobot::default());
        robot.fail_pose("pose service down");
        let domain = Arc::new(MockDomain::default());
        let uploader = uploader(&robot, &domain);

        assert!(uploader.tick());
        settle().await;
        assert!(domain.uploads().is_empty());
        assert!(uploader.tick());
    }

    #[tokio::test]
    async fn busy_flag_drops_overlapping_ticks() {
        let robot = Arc::new(MockRobot::default());
        let domain = Arc::new(MockDomain::default());
        let uploader = uploader(&robot, &domain);

        assert!(uploader.tick());
        assert!(!uploader.tick());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_only_while_moving() {
        let robot = Arc::new(MockRobot::default());
        let domain = Arc::new(MockDomain::default());
        let uploader = uploader(&robot, &domain);
        let (mode_tx, mode_rx) = watch::channel(Mode::Idle);
        let shutdown = CancelToken::new();

        let task = tokio::spawn(uploader.clone().run(mode_rx, shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(domain.uploads().is_empty());

        mode_tx.send_replace(Mode::Patrol);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let moving = domain.uploads().len();
        assert_eq!(moving, 3);

        mode_tx.send_replace(Mode::Arrived);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(domain.uploads().len(), moving);

        shutdown.cancel();
        task.await.unwrap();
    }
}
