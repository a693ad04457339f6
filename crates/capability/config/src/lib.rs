//! 应用运行配置加载。

pub mod devices;

pub use devices::DeviceMap;

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_addr: String,
    pub database_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    /// 发现公告与 state 主题共用的根段。
    pub discovery_prefix: String,
    /// NUT 侧 UPS 名（允许 upsname@host 形式）。
    pub nut_ups_name: String,
    /// 轮询侧设备的总线键。
    pub nut_device_id: String,
    /// 发现公告中的设备显示名。
    pub nut_device_name: String,
    pub poll_interval_seconds: u64,
    pub save_interval_seconds: u64,
    /// 设备未上报额定功率时，负载瓦数换算的回退值。
    pub nominal_power_watts: f64,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("UPSLINK_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("UPSLINK_DATABASE_URL".to_string()))?;
        let http_addr =
            env::var("UPSLINK_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8892".to_string());
        let mqtt_host = env::var("UPSLINK_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("UPSLINK_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("UPSLINK_MQTT_USERNAME");
        let mqtt_password = read_optional("UPSLINK_MQTT_PASSWORD");
        let mqtt_client_id =
            env::var("UPSLINK_MQTT_CLIENT_ID").unwrap_or_else(|_| "upslink-bridge".to_string());
        let discovery_prefix = env::var("UPSLINK_DISCOVERY_PREFIX")
            .unwrap_or_else(|_| "homeassistant".to_string());
        let nut_ups_name =
            env::var("UPSLINK_NUT_UPS_NAME").unwrap_or_else(|_| "ups@localhost".to_string());
        let nut_device_id =
            env::var("UPSLINK_NUT_DEVICE_ID").unwrap_or_else(|_| "ups".to_string());
        let nut_device_name =
            env::var("UPSLINK_NUT_DEVICE_NAME").unwrap_or_else(|_| "UPS".to_string());
        let poll_interval_seconds = read_u64_with_default("UPSLINK_POLL_INTERVAL_SECONDS", 60)?;
        let save_interval_seconds = read_u64_with_default("UPSLINK_SAVE_INTERVAL_SECONDS", 3600)?;
        let nominal_power_watts = read_f64_with_default("UPSLINK_NOMINAL_POWER_WATTS", 600.0)?;

        Ok(Self {
            http_addr,
            database_url,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            discovery_prefix,
            nut_ups_name,
            nut_device_id,
            nut_device_name,
            poll_interval_seconds,
            save_interval_seconds,
            nominal_power_watts,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_f64_with_default(key: &str, default: f64) -> Result<f64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<f64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
