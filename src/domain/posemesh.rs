use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Credentials, DomainClient, PosePayload, RobotCallRecord, UploadMode, UploadResult};
use crate::config::DomainConfig;

const POSE_DATA_TYPE: &str = "reported_pose_json";
const ROBOT_CALL_DATA_TYPE: &str = "robot_pose_json";
const ROBOT_CALL_NAME: &str = "robot_call";

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DomainServer {
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DomainSession {
    access_token: String,
    domain_server: DomainServer,
    id: String,
}

/// Client for the posemesh account, discovery and domain data services.
pub struct PosemeshClient {
    client: Client,
    api_url: String,
    dds_url: String,
    device_id: String,
    credentials: RwLock<Credentials>,
    session: RwLock<Option<DomainSession>>,
}

impl PosemeshClient {
    pub fn new(config: &DomainConfig, device_id: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build domain HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            dds_url: config.dds_url.trim_end_matches('/').to_string(),
            device_id,
            credentials: RwLock::new(Credentials {
                email: config.email.clone(),
                password: config.password.clone(),
                domain_id: config.domain_id.clone(),
            }),
            session: RwLock::new(None),
        })
    }

    fn stored_credentials(&self) -> Result<Credentials> {
        let credentials = self
            .credentials
            .read()
            .map_err(|e| anyhow!("Lock error: {}", e))?
            .clone();
        if credentials.email.is_empty()
            || credentials.password.is_empty()
            || credentials.domain_id.is_empty()
        {
            bail!("Missing stored credentials");
        }
        Ok(credentials)
    }

    fn current_session(&self) -> Result<DomainSession> {
        self.session
            .read()
            .map_err(|e| anyhow!("Lock error: {}", e))?
            .clone()
            .ok_or_else(|| anyhow!("No domain info available, token missing"))
    }

    fn domain_url(session: &DomainSession) -> String {
        format!(
            "{}/api/v1/domains/{}",
            session.domain_server.url.trim_end_matches('/'),
            session.id
        )
    }

    fn data_url(session: &DomainSession, data_type: &str) -> String {
        format!("{}/data?data_type={}", Self::domain_url(session), data_type)
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<DomainSession> {
        let response = self
            .client
            .post(format!("{}/user/login", self.api_url))
            .json(&json!({ "email": credentials.email, "password": credentials.password }))
            .send()
            .await
            .context("Failed to reach account service")?;
        if !response.status().is_success() {
            bail!("Failed to authenticate posemesh account: {}", response.status());
        }
        let user: AccessToken = response.json().await.context("Invalid login response")?;

        let response = self
            .client
            .post(format!("{}/service/domains-access-token", self.api_url))
            .bearer_auth(&user.access_token)
            .send()
            .await
            .context("Failed to reach discovery service")?;
        if !response.status().is_success() {
            bail!("Failed to get domains access token: {}", response.status());
        }
        let dds: AccessToken = response.json().await.context("Invalid DDS token response")?;

        let response = self
            .client
            .post(format!(
                "{}/api/v1/domains/{}/auth",
                self.dds_url, credentials.domain_id
            ))
            .bearer_auth(&dds.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to reach domain auth")?;
        if !response.status().is_success() {
            bail!("Failed to authenticate domain access: {}", response.status());
        }
        response.json().await.context("Invalid domain auth response")
    }

    fn store_session(&self, session: DomainSession) -> Result<String> {
        let url = session.domain_server.url.clone();
        *self
            .session
            .write()
            .map_err(|e| anyhow!("Lock error: {}", e))? = Some(session);
        Ok(url)
    }
}

/// Pulls the record id out of an upload response: `{"id":..}` or `{"data":[{"id":..}]}`.
fn parse_data_id(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let id = value
        .get("id")
        .or_else(|| value.get("data")?.get(0)?.get("id"))?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Product id of a raw robot call body, `{"id": ..}`. A null id means the
/// call was cleared.
fn parse_call_product(body: &str) -> Result<Option<String>> {
    let value: Value = serde_json::from_str(body.trim()).context("Invalid robot call data")?;
    Ok(match value.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
impl DomainClient for PosemeshClient {
    async fn authenticate(&self, credentials: Option<Credentials>) -> Result<String> {
        let credentials = match credentials {
            Some(credentials) => {
                *self
                    .credentials
                    .write()
                    .map_err(|e| anyhow!("Lock error: {}", e))? = credentials.clone();
                credentials
            }
            None => self.stored_credentials()?,
        };
        let session = self.sign_in(&credentials).await?;
        info!("[AUTH] Authenticated to domain {}", session.id);
        self.store_session(session)
    }

    async fn refresh_token(&self) -> Result<()> {
        let credentials = self.stored_credentials()?;
        let session = self.sign_in(&credentials).await?;
        debug!("[AUTH] Domain token refreshed");
        self.store_session(session)?;
        Ok(())
    }

    async fn test_token_validity(&self) -> Result<()> {
        let session = self.current_session()?;
        let response = self
            .client
            .get(Self::data_url(&session, POSE_DATA_TYPE))
            .bearer_auth(&session.access_token)
            .send()
            .await
            .context("Token validity request failed")?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                bail!("Token rejected: unauthorized (401)")
            }
            status if status.is_success() => Ok(()),
            status => bail!("Token validity check failed: {}", status),
        }
    }

    async fn upload_pose(
        &self,
        payload: &PosePayload,
        mode: UploadMode,
        existing_id: Option<&str>,
    ) -> Result<UploadResult> {
        let session = self.current_session()?;
        let (method, part_name) = match (mode, existing_id) {
            (UploadMode::Put, Some(id)) => (Method::PUT, id.to_string()),
            (UploadMode::Put, None) => (Method::PUT, self.device_id.clone()),
            (UploadMode::Post, _) => (Method::POST, self.device_id.clone()),
        };

        let body = serde_json::to_vec(payload)?;
        let part = Part::bytes(body).mime_str("application/octet-stream")?;
        let form = Form::new().part(part_name, part);

        let response = self
            .client
            .request(method, Self::data_url(&session, POSE_DATA_TYPE))
            .bearer_auth(&session.access_token)
            .multipart(form)
            .send()
            .await
            .context("Pose upload request failed")?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            bail!("Failed to write robot pose data: unauthorized (401)");
        }
        if !status.is_success() {
            bail!("Failed to write robot pose data: {}", status);
        }

        let body = response.text().await.unwrap_or_default();
        let data_id = match mode {
            UploadMode::Post => parse_data_id(&body),
            UploadMode::Put => None,
        };
        Ok(UploadResult { data_id })
    }

    async fn get_robot_call(&self) -> Result<Option<RobotCallRecord>> {
        let session = self.current_session()?;
        let response = self
            .client
            .get(format!(
                "{}/data?name={}&data_type={}",
                Self::domain_url(&session),
                ROBOT_CALL_NAME,
                ROBOT_CALL_DATA_TYPE
            ))
            .bearer_auth(&session.access_token)
            .send()
            .await
            .context("Robot call metadata request failed")?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            bail!("Failed to get robot call metadata: unauthorized (401)");
        }
        if !status.is_success() {
            bail!("Failed to get robot call metadata: {}", status);
        }
        let body = response.text().await.unwrap_or_default();
        let Some(data_id) = parse_data_id(&body) else {
            return Ok(None);
        };

        let response = self
            .client
            .get(format!("{}/data/{}?raw=1", Self::domain_url(&session), data_id))
            .bearer_auth(&session.access_token)
            .header("Accept", "multipart/form-data")
            .send()
            .await
            .context("Robot call data request failed")?;
        if !response.status().is_success() {
            bail!("Failed to get robot call data: {}", response.status());
        }
        let body = response.text().await.context("Invalid robot call response")?;
        Ok(parse_call_product(&body)?.map(|product_id| RobotCallRecord {
            product_id,
            data_id: Some(data_id),
        }))
    }

    async fn clear_robot_call(&self, data_id: Option<&str>) -> Result<()> {
        let session = self.current_session()?;
        let part = Part::bytes(json!({ "id": null }).to_string().into_bytes())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part(data_id.unwrap_or(ROBOT_CALL_NAME).to_string(), part);

        let response = self
            .client
            .put(Self::data_url(&session, ROBOT_CALL_DATA_TYPE))
            .bearer_auth(&session.access_token)
            .multipart(form)
            .send()
            .await
            .context("Robot call clear request failed")?;
        if !response.status().is_success() {
            bail!("Failed to write robot call data: {}", response.status());
        }
        debug!("[CALL] Robot call cleared");
        Ok(())
    }
}
