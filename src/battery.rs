use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::command::{Command, OrchestratorHandle};
use crate::robot::{PowerStatus, RobotBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryAction {
    None,
    /// Battery is low away from the dock; head home.
    ReturnToCharger,
    /// A return to the charger has reached the dock.
    Docked,
}

/// Polls power status and decides when the robot must go charge.
pub struct BatteryGuard {
    robot: Arc<dyn RobotBase>,
    poll_interval: Duration,
    low_threshold: f32,
}

impl BatteryGuard {
    pub fn new(robot: Arc<dyn RobotBase>, poll_interval: Duration, low_threshold: f32) -> Self {
        Self {
            robot,
            poll_interval,
            low_threshold,
        }
    }

    pub fn assess(&self, status: &PowerStatus, returning_to_charger: bool) -> BatteryAction {
        if status.on_dock() {
            if returning_to_charger {
                BatteryAction::Docked
            } else {
                BatteryAction::None
            }
        } else if status.battery_percentage <= self.low_threshold && !returning_to_charger {
            BatteryAction::ReturnToCharger
        } else {
            BatteryAction::None
        }
    }

    /// Forwards every power reading to the orchestrator until `shutdown` fires.
    pub async fn run(&self, handle: OrchestratorHandle, shutdown: CancelToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("[BATTERY] Monitoring power every {:?}", self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("[BATTERY] Shutting down battery monitor");
                    break;
                }
                _ = interval.tick() => {
                    match self.robot.get_power_status().await {
                        Ok(status) => {
                            debug!(
                                "[BATTERY] {}% ({:?}, charging: {})",
                                status.battery_percentage, status.docking_status, status.is_charging
                            );
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    info!("[BATTERY] Shutting down battery monitor");
                                    break;
                                }
                                sent = handle.send(Command::PowerStatus(status)) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => warn!("[BATTERY] Failed to read power status: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRobot;
    use crate::robot::DockingStatus;
    use tokio::sync::mpsc;

    fn status(battery_percentage: f32, docking_status: DockingStatus) -> PowerStatus {
        PowerStatus {
            battery_percentage,
            docking_status,
            is_charging: false,
        }
    }

    fn guard() -> BatteryGuard {
        BatteryGuard::new(Arc::new(MockRobot::default()), Duration::from_secs(10), 20.0)
    }

    #[test]
    fn low_battery_off_dock_returns_once() {
        let guard = guard();
        let low = status(20.0, DockingStatus::NotOnDock);
        assert_eq!(guard.assess(&low, false), BatteryAction::ReturnToCharger);
        assert_eq!(guard.assess(&low, true), BatteryAction::None);
        assert_eq!(
            guard.assess(&status(21.0, DockingStatus::NotOnDock), false),
            BatteryAction::None
        );
    }

    #[test]
    fn docking_completes_a_return() {
        let guard = guard();
        let docked = status(15.0, DockingStatus::OnDock);
        assert_eq!(guard.assess(&docked, true), BatteryAction::Docked);
        assert_eq!(guard.assess(&docked, false), BatteryAction::None);
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_readings_until_shutdown() {
        let robot = Arc::new(MockRobot::default());
        robot.set_power(42.0, DockingStatus::NotOnDock);
        let guard = Arc::new(BatteryGuard::new(robot, Duration::from_secs(10), 20.0));
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancelToken::new();

        let task = tokio::spawn({
            let guard = guard.clone();
            let shutdown = shutdown.clone();
            async move { guard.run(OrchestratorHandle::new(tx), shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(15)).await;
        shutdown.cancel();
        task.await.unwrap();

        let mut readings = 0;
        while let Ok(command) = rx.try_recv() {
            assert!(matches!(command, Command::PowerStatus(s) if s.battery_percentage == 42.0));
            readings += 1;
        }
        assert_eq!(readings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_not_held_up_by_a_full_queue() {
        let robot = Arc::new(MockRobot::default());
        let guard = Arc::new(BatteryGuard::new(robot, Duration::from_secs(10), 20.0));
        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancelToken::new();

        let task = tokio::spawn({
            let guard = guard.clone();
            let shutdown = shutdown.clone();
            async move { guard.run(OrchestratorHandle::new(tx), shutdown).await }
        });

        // The first reading fills the queue; the second waits for room.
        tokio::time::sleep(Duration::from_secs(15)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("battery monitor stops while its send is pending")
            .unwrap();
        drop(rx);
    }
}
