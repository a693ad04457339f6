//! UPS 样本模型：稀疏字段集合、部分更新合并与有效性规则。

use crate::catalog::{field_spec, FieldKind, FieldSpec, FIELD_SPECS};
use std::collections::{BTreeMap, HashMap};

/// 字段值的数据类型。
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    F64(f64),
    I64(i64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// 渲染为总线 payload 文本。布尔值按 "1"/"0" 投影（binary_sensor 约定）。
    pub fn render(&self) -> String {
        match self {
            FieldValue::F64(v) => v.to_string(),
            FieldValue::I64(v) => v.to_string(),
            FieldValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            FieldValue::Text(v) => v.clone(),
        }
    }
}

/// 总线消息（不可变投影结果）。
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// 单台设备的最新遥测快照。
///
/// 字段缺席表示"未知"，不等于零值。轮询侧一次性填满，
/// 采集侧从空样本开始逐字段合并。
#[derive(Debug, Clone)]
pub struct UpsSample {
    /// 总线侧设备键（state 主题段）。
    pub device_id: String,
    /// 最近一次字段更新的 Unix 毫秒时间戳。
    pub ts_ms: i64,
    pub fields: HashMap<String, FieldValue>,
}

impl UpsSample {
    /// 空样本（采集侧首次观测到设备时分配）。
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ts_ms: now_epoch_ms(),
            fields: HashMap::new(),
        }
    }

    /// 从硬件源变量表一次性构建完整样本。
    ///
    /// 单个字段解析失败只丢弃该字段，不影响其余字段。
    pub fn from_source_variables(
        device_id: impl Into<String>,
        vars: &BTreeMap<String, String>,
        fallback_nominal_watts: f64,
    ) -> Self {
        let mut sample = Self::new(device_id);
        for spec in FIELD_SPECS {
            let Some(var) = spec.source_var else {
                continue;
            };
            let Some(raw) = vars.get(var).filter(|raw| !raw.trim().is_empty()) else {
                continue;
            };
            if let Some(value) = parse_field(spec.kind, raw) {
                sample.fields.insert(spec.name.to_string(), value);
            }
        }
        sample.derive_power_failure();
        sample.derive_load_watts(fallback_nominal_watts);
        sample
    }

    /// 按字段名（或别名）合并一次总线更新。
    ///
    /// 已识别的字段刷新时间戳；解析失败保留旧值；
    /// 未识别的字段名直接忽略。返回是否发生了合并。
    pub fn merge_field(&mut self, field: &str, raw: &str, fallback_nominal_watts: f64) -> bool {
        let Some(spec) = field_spec(field) else {
            return false;
        };
        self.ts_ms = now_epoch_ms();
        if let Some(value) = parse_field(spec.kind, raw) {
            self.fields.insert(spec.name.to_string(), value);
            match spec.name {
                "ups_status" => self.derive_power_failure(),
                "load_percentage" => self.derive_load_watts(fallback_nominal_watts),
                _ => {}
            }
        }
        true
    }

    /// 有效性下限：至少要有电量和状态字符串。
    pub fn is_valid(&self) -> bool {
        self.f64_field("battery_charge").is_some() && self.text_field("ups_status").is_some()
    }

    /// 投影为逐字段 state 消息（QoS 1，不保留）。
    pub fn to_wire_messages(&self, discovery_prefix: &str) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        for spec in FIELD_SPECS {
            let Some(value) = self.fields.get(spec.name) else {
                continue;
            };
            messages.push(WireMessage {
                topic: state_topic(discovery_prefix, &self.device_id, spec),
                payload: value.render(),
                qos: 1,
                retain: false,
            });
        }
        messages
    }

    pub fn f64_field(&self, name: &str) -> Option<f64> {
        match self.fields.get(name) {
            Some(FieldValue::F64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn i64_field(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(FieldValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text_field(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    // 状态串包含 "OB"（On Battery）即视为市电故障。
    fn derive_power_failure(&mut self) {
        if let Some(status) = self.text_field("ups_status") {
            let failure = status.contains("OB");
            self.fields
                .insert("power_failure".to_string(), FieldValue::Bool(failure));
        }
    }

    // 负载瓦数优先按设备上报的额定功率换算，缺席时退回配置默认值。
    fn derive_load_watts(&mut self, fallback_nominal_watts: f64) {
        if let Some(pct) = self.f64_field("load_percentage") {
            let nominal = self
                .f64_field("ups_nominal_power")
                .unwrap_or(fallback_nominal_watts);
            self.fields.insert(
                "load_watts".to_string(),
                FieldValue::F64(pct / 100.0 * nominal),
            );
        }
    }
}

fn state_topic(prefix: &str, device_id: &str, spec: &FieldSpec) -> String {
    format!("{}/sensor/{}/{}/state", prefix, device_id, spec.name)
}

fn parse_field(kind: FieldKind, raw: &str) -> Option<FieldValue> {
    let raw = raw.trim();
    match kind {
        FieldKind::Float => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(FieldValue::F64),
        FieldKind::Int => raw.parse::<i64>().ok().map(FieldValue::I64),
        FieldKind::Bool => Some(FieldValue::Bool(matches!(
            raw.to_ascii_lowercase().as_str(),
            "1" | "true" | "on"
        ))),
        FieldKind::Text => {
            if raw.is_empty() {
                None
            } else {
                Some(FieldValue::Text(raw.to_string()))
            }
        }
    }
}

/// 当前 Unix 毫秒时间戳。
pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
