//! Scripted collaborators for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::domain::{
    Credentials, DomainClient, PosePayload, RobotCallRecord, UploadMode, UploadResult,
};
use crate::robot::{
    BaseCapabilities, DockingStatus, HealthReport, Poi, PoseSample, PowerStatus, RobotBase,
};
use crate::state::Waypoint;

#[derive(Debug, Clone, PartialEq)]
pub enum RobotCall {
    Health,
    Pose,
    NavigateTo { x: f64, y: f64, yaw: f64 },
    GoHome,
    Stop,
    Power,
    SetSpeed(f32),
    GetPois,
    ReconcilePois(usize),
    Relocalize,
    ResetConnection,
}

pub struct MockRobot {
    pub motion_delay: Duration,
    calls: Mutex<Vec<RobotCall>>,
    navigate_results: Mutex<VecDeque<Result<(), String>>>,
    go_home_results: Mutex<VecDeque<Result<(), String>>>,
    pose_results: Mutex<VecDeque<Result<PoseSample, String>>>,
    power: Mutex<PowerStatus>,
    health: Mutex<HealthReport>,
    pois: Mutex<VecDeque<Vec<Poi>>>,
    capabilities: BaseCapabilities,
}

impl Default for MockRobot {
    fn default() -> Self {
        Self::with_capabilities(BaseCapabilities {
            relocalize: true,
            reset_connection: true,
        })
    }
}

impl MockRobot {
    pub fn with_capabilities(capabilities: BaseCapabilities) -> Self {
        Self {
            motion_delay: Duration::from_millis(100),
            calls: Mutex::new(Vec::new()),
            navigate_results: Mutex::new(VecDeque::new()),
            go_home_results: Mutex::new(VecDeque::new()),
            pose_results: Mutex::new(VecDeque::new()),
            power: Mutex::new(PowerStatus {
                battery_percentage: 80.0,
                docking_status: DockingStatus::NotOnDock,
                is_charging: false,
            }),
            health: Mutex::new(HealthReport {
                slam_api_available: true,
                ..Default::default()
            }),
            pois: Mutex::new(VecDeque::new()),
            capabilities,
        }
    }

    fn record(&self, call: RobotCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<RobotCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<(f64, f64)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RobotCall::NavigateTo { x, y, .. } => Some((x, y)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &RobotCall) -> usize {
        self.calls()
            .iter()
            .filter(|call| std::mem::discriminant(*call) == std::mem::discriminant(wanted))
            .count()
    }

    pub fn fail_navigation(&self, message: &str) {
        self.navigate_results
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn fail_go_home(&self, message: &str) {
        self.go_home_results
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn fail_pose(&self, message: &str) {
        self.pose_results
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn set_power(&self, battery_percentage: f32, docking_status: DockingStatus) {
        *self.power.lock().unwrap() = PowerStatus {
            battery_percentage,
            docking_status,
            is_charging: docking_status == DockingStatus::OnDock,
        };
    }

    pub fn set_health(&self, health: HealthReport) {
        *self.health.lock().unwrap() = health;
    }

    /// Queues the POI listings returned by successive `get_pois` calls; the
    /// last one repeats.
    pub fn push_pois(&self, names: &[&str]) {
        let pois = names
            .iter()
            .enumerate()
            .map(|(i, name)| Poi {
                id: i.to_string(),
                display_name: name.to_string(),
                pose: PoseSample {
                    x: 0.0,
                    y: 0.0,
                    yaw: 0.0,
                },
            })
            .collect();
        self.pois.lock().unwrap().push_back(pois);
    }
}

#[async_trait]
impl RobotBase for MockRobot {
    async fn check_health(&self) -> Result<HealthReport> {
        self.record(RobotCall::Health);
        Ok(self.health.lock().unwrap().clone())
    }

    async fn get_current_pose(&self) -> Result<PoseSample> {
        self.record(RobotCall::Pose);
        match self.pose_results.lock().unwrap().pop_front() {
            Some(result) => result.map_err(|e| anyhow!(e)),
            None => Ok(PoseSample {
                x: 1.0,
                y: 2.0,
                yaw: 0.0,
            }),
        }
    }

    async fn navigate_to(&self, x: f64, y: f64, yaw: f64) -> Result<()> {
        self.record(RobotCall::NavigateTo { x, y, yaw });
        tokio::time::sleep(self.motion_delay).await;
        let result = self.navigate_results.lock().unwrap().pop_front();
        result.unwrap_or(Ok(())).map_err(|e| anyhow!(e))
    }

    async fn go_home(&self) -> Result<()> {
        self.record(RobotCall::GoHome);
        tokio::time::sleep(self.motion_delay).await;
        let result = self.go_home_results.lock().unwrap().pop_front();
        result.unwrap_or(Ok(())).map_err(|e| anyhow!(e))
    }

    async fn stop_navigation(&self) -> Result<()> {
        self.record(RobotCall::Stop);
        Ok(())
    }

    async fn get_power_status(&self) -> Result<PowerStatus> {
        self.record(RobotCall::Power);
        Ok(*self.power.lock().unwrap())
    }

    async fn set_max_speed(&self, speed: f32) -> Result<()> {
        self.record(RobotCall::SetSpeed(speed));
        Ok(())
    }

    async fn get_pois(&self) -> Result<Vec<Poi>> {
        self.record(RobotCall::GetPois);
        let mut pois = self.pois.lock().unwrap();
        let next = if pois.len() > 1 {
            pois.pop_front()
        } else {
            pois.front().cloned()
        };
        Ok(next.unwrap_or_default())
    }

    async fn reconcile_pois(&self, waypoints: &[Waypoint]) -> Result<()> {
        self.record(RobotCall::ReconcilePois(waypoints.len()));
        Ok(())
    }

    async fn relocalize(&self) -> Result<()> {
        self.record(RobotCall::Relocalize);
        Ok(())
    }

    async fn reset_connection(&self) -> Result<()> {
        self.record(RobotCall::ResetConnection);
        Ok(())
    }

    fn capabilities(&self) -> BaseCapabilities {
        self.capabilities
    }
}

#[derive(Default)]
pub struct MockDomain {
    validity_results: Mutex<VecDeque<Result<()>>>,
    refreshes: Mutex<VecDeque<Result<()>>>,
    authentications: Mutex<VecDeque<Result<String>>>,
    uploads: Mutex<VecDeque<Result<UploadResult>>>,
    uploaded: Mutex<Vec<(PosePayload, UploadMode, Option<String>)>>,
    robot_calls: Mutex<VecDeque<Result<Option<RobotCallRecord>>>>,
    cleared: Mutex<Vec<Option<String>>>,
    robot_call_reads: AtomicUsize,
    validity_checks: AtomicUsize,
    refresh_calls: AtomicUsize,
    authenticate_calls: AtomicUsize,
}

impl MockDomain {
    pub fn push_validity_check(&self, result: Result<()>) {
        self.validity_results.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: Result<()>) {
        self.refreshes.lock().unwrap().push_back(result);
    }

    pub fn push_authenticate(&self, result: Result<String>) {
        self.authentications.lock().unwrap().push_back(result);
    }

    pub fn push_upload(&self, result: Result<UploadResult>) {
        self.uploads.lock().unwrap().push_back(result);
    }

    /// Queues the result of the next `get_robot_call`; an empty queue reads no call.
    pub fn push_robot_call(&self, result: Result<Option<RobotCallRecord>>) {
        self.robot_calls.lock().unwrap().push_back(result);
    }

    pub fn robot_call_reads(&self) -> usize {
        self.robot_call_reads.load(Ordering::SeqCst)
    }

    /// Data ids passed to `clear_robot_call`, in order.
    pub fn cleared_calls(&self) -> Vec<Option<String>> {
        self.cleared.lock().unwrap().clone()
    }

    pub fn validity_checks(&self) -> usize {
        self.validity_checks.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<(PosePayload, UploadMode, Option<String>)> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl DomainClient for MockDomain {
    async fn authenticate(&self, _credentials: Option<Credentials>) -> Result<String> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.authentications.lock().unwrap().pop_front();
        result.unwrap_or_else(|| Ok("https://domain.example".to_string()))
    }

    async fn refresh_token(&self) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.refreshes.lock().unwrap().pop_front();
        result.unwrap_or(Ok(()))
    }

    async fn test_token_validity(&self) -> Result<()> {
        self.validity_checks.fetch_add(1, Ordering::SeqCst);
        let result = self.validity_results.lock().unwrap().pop_front();
        result.unwrap_or(Ok(()))
    }

    async fn upload_pose(
        &self,
        payload: &PosePayload,
        mode: UploadMode,
        existing_id: Option<&str>,
    ) -> Result<UploadResult> {
        self.uploaded
            .lock()
            .unwrap()
            .push((payload.clone(), mode, existing_id.map(str::to_string)));
        let result = self.uploads.lock().unwrap().pop_front();
        result.unwrap_or_else(|| {
            Ok(UploadResult {
                data_id: match mode {
                    UploadMode::Post => Some("pose-record".to_string()),
                    UploadMode::Put => None,
                },
            })
        })
    }

    async fn get_robot_call(&self) -> Result<Option<RobotCallRecord>> {
        self.robot_call_reads.fetch_add(1, Ordering::SeqCst);
        let result = self.robot_calls.lock().unwrap().pop_front();
        result.unwrap_or(Ok(None))
    }

    async fn clear_robot_call(&self, data_id: Option<&str>) -> Result<()> {
        self.cleared
            .lock()
            .unwrap()
            .push(data_id.map(str::to_string));
        Ok(())
    }
}
