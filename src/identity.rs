use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::RwLock;
use tracing::info;

use crate::config::GeneralConfig;
use crate::util;

/// Who this robot is to the domain service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub mac_address: String,
    pub device_type: String,
    pub name: String,
}

impl DeviceIdentity {
    pub fn from_config(general: &GeneralConfig) -> Self {
        let mac_address = util::get_device_mac();
        let device_id = general
            .device_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| mac_address.clone());
        Self {
            device_id,
            mac_address,
            device_type: general.device_type.clone(),
            name: general.robot_name.clone(),
        }
    }
}

/// Device identity plus the server-assigned pose record id, kept for the
/// process lifetime.
#[derive(Debug)]
pub struct IdentityStore {
    pub identity: DeviceIdentity,
    pose_data_id: RwLock<Option<String>>,
}

impl IdentityStore {
    pub fn new(identity: DeviceIdentity) -> Self {
        info!("Device identity: {} ({})", identity.device_id, identity.device_type);
        Self {
            identity,
            pose_data_id: RwLock::new(None),
        }
    }

    pub fn pose_data_id(&self) -> Result<Option<String>> {
        let id = self
            .pose_data_id
            .read()
            .map_err(|e| anyhow!("Lock error: {}", e))?;
        Ok(id.clone())
    }

    pub fn set_pose_data_id(&self, data_id: String) -> Result<()> {
        let mut id = self
            .pose_data_id
            .write()
            .map_err(|e| anyhow!("Lock error: {}", e))?;
        *id = Some(data_id);
        Ok(())
    }
}
