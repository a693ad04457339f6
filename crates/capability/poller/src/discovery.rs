//! 发现公告发布。
//!
//! 按字段目录为每个传感器发布一条保留的 JSON 配置消息，外部消费方
//! 据此自动建立显示实体；同一主题上的空保留消息撤回公告。

use domain::{FIELD_SPECS, FieldSpec, SensorKind};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use upslink_bus::Bus;

const DEFAULT_MANUFACTURER: &str = "American Power Conversion";
const DEFAULT_MODEL: &str = "Back-UPS XS 1000M";

/// 发现公告发布器。
pub struct DiscoveryPublisher {
    bus: Arc<dyn Bus>,
    prefix: String,
    device_id: String,
    device_name: String,
    manufacturer: String,
    model: String,
}

impl DiscoveryPublisher {
    pub fn new(
        bus: Arc<dyn Bus>,
        prefix: impl Into<String>,
        device_id: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            prefix: prefix.into(),
            device_id: device_id.into(),
            device_name: device_name.into(),
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// 发布全部传感器配置；只有全部成功才返回 true。
    pub fn publish_all(&self) -> bool {
        info!(
            target: "upslink.poller",
            device = %self.device_name,
            "discovery_publishing_all"
        );
        let mut all_success = true;
        for spec in FIELD_SPECS {
            if !self.publish_config(spec) {
                all_success = false;
                warn!(
                    target: "upslink.poller",
                    field = spec.name,
                    "discovery_publish_failed"
                );
            }
        }
        all_success
    }

    /// 撤回全部公告（每个配置主题发一条空保留消息）。
    pub fn retract_all(&self) -> bool {
        info!(
            target: "upslink.poller",
            device = %self.device_name,
            "discovery_retracting_all"
        );
        let mut all_success = true;
        for spec in FIELD_SPECS {
            if !self.bus.publish(&self.config_topic(spec), "", 1, true) {
                all_success = false;
            }
        }
        all_success
    }

    fn config_topic(&self, spec: &FieldSpec) -> String {
        let component = match spec.sensor {
            SensorKind::Sensor => "sensor",
            SensorKind::BinarySensor => "binary_sensor",
        };
        format!(
            "{}/{}/{}/{}/config",
            self.prefix, component, self.device_id, spec.name
        )
    }

    fn publish_config(&self, spec: &FieldSpec) -> bool {
        let mut config = json!({
            "name": spec.display_name,
            "unique_id": format!("{}_{}", self.device_id, spec.name),
            // 二元传感器的状态流也走 sensor state 主题
            "state_topic": format!("{}/sensor/{}/{}/state", self.prefix, self.device_id, spec.name),
            "device": {
                "identifiers": [self.device_id],
                "name": self.device_name,
                "manufacturer": self.manufacturer,
                "model": self.model,
            },
        });
        if spec.sensor == SensorKind::BinarySensor {
            config["payload_on"] = json!("1");
            config["payload_off"] = json!("0");
        }
        if !spec.unit.is_empty() {
            config["unit_of_measurement"] = json!(spec.unit);
        }
        if !spec.device_class.is_empty() {
            config["device_class"] = json!(spec.device_class);
        }
        if !spec.state_class.is_empty() {
            config["state_class"] = json!(spec.state_class);
        }
        if !spec.icon.is_empty() {
            config["icon"] = json!(spec.icon);
        }
        self.bus
            .publish(&self.config_topic(spec), &config.to_string(), 1, true)
    }
}
