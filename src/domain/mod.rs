pub mod posemesh;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use posemesh::PosemeshClient;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub domain_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Post,
    Put,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResult {
    /// Server-assigned id, present when a new record was created.
    pub data_id: Option<String>,
}

/// Pose in the domain's frame, rotation as a quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainPose {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
    pub rw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosePayload {
    pub name: String,
    pub device_id: String,
    pub device_type: String,
    /// Nanoseconds since the Unix epoch, as a string.
    pub timestamp: String,
    pub pose: DomainPose,
    pub mac_address: String,
}

/// A pending remote summon: the product the robot was called to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotCallRecord {
    pub product_id: String,
    /// Id of the stored record, used to clear it in place.
    pub data_id: Option<String>,
}

/// Authentication and data-upload surface of the spatial domain service.
#[async_trait]
pub trait DomainClient: Send + Sync {
    /// Runs the full sign-in flow and returns the domain server URL.
    /// `None` reuses the stored credentials.
    async fn authenticate(&self, credentials: Option<Credentials>) -> Result<String>;

    async fn refresh_token(&self) -> Result<()>;

    /// Cheap authenticated request used to check the session is still accepted.
    async fn test_token_validity(&self) -> Result<()>;

    async fn upload_pose(
        &self,
        payload: &PosePayload,
        mode: UploadMode,
        existing_id: Option<&str>,
    ) -> Result<UploadResult>;

    /// Reads the pending robot call, `None` when there is none or it was cleared.
    async fn get_robot_call(&self) -> Result<Option<RobotCallRecord>>;

    /// Overwrites the robot call with an empty one.
    async fn clear_robot_call(&self, data_id: Option<&str>) -> Result<()>;
}
