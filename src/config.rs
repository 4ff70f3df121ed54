use std::time::Duration;

use anyhow::Result;
use config::{Environment, File};
use once_cell::sync::Lazy;
use serde::Deserialize;

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub robot: RobotConfig,
    pub domain: DomainConfig,
    pub patrol: PatrolConfig,
    pub speeds: SpeedConfig,
    pub battery: BatteryConfig,
    pub telemetry: TelemetryConfig,
    pub auth: AuthConfig,
    pub web: WebConfig,
    pub startup: StartupConfig,
    pub robot_call: RobotCallConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Overrides the MAC-derived device id when set.
    pub device_id: Option<String>,
    pub device_type: String,
    pub robot_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub action_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    pub api_url: String,
    pub dds_url: String,
    pub email: String,
    pub password: String,
    pub domain_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatrolConfig {
    pub waypoints_path: String,
    pub auto_start: bool,
    pub auto_promotion: bool,
    pub inactivity_timeout_secs: u64,
    pub arrival_dwell_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SpeedConfig {
    pub patrol: f32,
    pub product_search: f32,
    pub default: f32,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            patrol: 0.3,
            product_search: 0.7,
            default: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryConfig {
    pub poll_interval_secs: u64,
    pub low_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub validation_interval_secs: u64,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartupConfig {
    pub timeout_secs: u64,
    pub require_dock: bool,
    pub dock_poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotCallConfig {
    pub products_path: String,
    pub poll_interval_secs: u64,
    pub cooldown_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = std::env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let config_path = format!("config/{}.toml", env);
        let fallback_path = format!("/etc/wayfinder/{}.toml", env);

        let config_builder = config::Config::builder();
        let config_builder = if std::path::Path::new(&config_path).exists() {
            config_builder.add_source(File::with_name(&config_path))
        } else {
            config_builder.add_source(File::with_name(&fallback_path))
        };

        let settings = config_builder
            .add_source(Environment::with_prefix("WAYFINDER").separator("__"))
            .build()?;
        let config = settings.try_deserialize()?;
        Ok(config)
    }
}

/// Timings and thresholds the orchestrator and its components run with.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub speeds: SpeedConfig,
    pub auto_promotion: bool,
    pub inactivity_timeout: Duration,
    pub arrival_dwell: Duration,
    pub battery_poll_interval: Duration,
    pub low_battery_threshold: f32,
    pub telemetry_interval: Duration,
    pub telemetry_cooldown: Duration,
    pub token_validation_interval: Duration,
    pub token_refresh_interval: Duration,
    pub robot_call_interval: Duration,
    /// Quiet period after a handled robot call, counted from the return to idle.
    pub robot_call_cooldown: Duration,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            speeds: config.speeds,
            auto_promotion: config.patrol.auto_promotion,
            inactivity_timeout: Duration::from_secs(config.patrol.inactivity_timeout_secs),
            arrival_dwell: Duration::from_secs(config.patrol.arrival_dwell_secs),
            battery_poll_interval: Duration::from_secs(config.battery.poll_interval_secs),
            low_battery_threshold: config.battery.low_threshold,
            telemetry_interval: Duration::from_millis(config.telemetry.interval_ms),
            telemetry_cooldown: Duration::from_secs(config.telemetry.cooldown_secs),
            token_validation_interval: Duration::from_secs(config.auth.validation_interval_secs),
            token_refresh_interval: Duration::from_secs(config.auth.refresh_interval_secs),
            robot_call_interval: Duration::from_secs(config.robot_call.poll_interval_secs),
            robot_call_cooldown: Duration::from_secs(config.robot_call.cooldown_secs),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            speeds: SpeedConfig::default(),
            auto_promotion: true,
            inactivity_timeout: Duration::from_secs(20),
            arrival_dwell: Duration::from_secs(5),
            battery_poll_interval: Duration::from_secs(30),
            low_battery_threshold: 20.0,
            telemetry_interval: Duration::from_secs(1),
            telemetry_cooldown: Duration::from_secs(10),
            token_validation_interval: Duration::from_secs(15 * 60),
            token_refresh_interval: Duration::from_secs(55 * 60),
            robot_call_interval: Duration::from_secs(5),
            robot_call_cooldown: Duration::from_secs(60),
        }
    }
}
