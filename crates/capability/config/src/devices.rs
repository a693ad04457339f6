//! 设备映射表：总线设备键 ↔ 存储标识 ↔ 显示名。
//!
//! 启动时从环境变量构建一次，之后只读，由 Arc 注入各组件。

use crate::ConfigError;
use std::collections::HashMap;
use std::env;

/// 只读设备映射表。
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    device_ids: Vec<String>,
    wire_to_db: HashMap<String, String>,
    db_to_wire: HashMap<String, String>,
    display_names: HashMap<String, String>,
}

impl DeviceMap {
    /// 显式构建（测试与嵌入场景）。
    pub fn new(
        device_ids: Vec<String>,
        db_mapping: HashMap<String, String>,
        display_names: HashMap<String, String>,
    ) -> Self {
        let mut map = Self {
            device_ids,
            display_names,
            ..Self::default()
        };
        for (wire, db) in db_mapping {
            map.db_to_wire.insert(db.clone(), wire.clone());
            map.wire_to_db.insert(wire, db);
        }
        // 未显式映射的设备按标识自身落库
        for id in &map.device_ids {
            if !map.wire_to_db.contains_key(id) {
                map.wire_to_db.insert(id.clone(), id.clone());
                map.db_to_wire.insert(id.clone(), id.clone());
            }
        }
        map
    }

    /// 从环境变量构建。
    ///
    /// - `UPSLINK_DEVICE_IDS`：逗号分隔的总线设备键，缺省退回 `fallback_device_id`
    /// - `UPSLINK_DEVICE_DB_MAPPING`：JSON 对象，总线键 → 存储标识
    /// - `UPSLINK_DEVICE_NAMES`：JSON 对象，总线键 → 显示名
    pub fn from_env(fallback_device_id: &str) -> Result<Self, ConfigError> {
        let device_ids = match env::var("UPSLINK_DEVICE_IDS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            _ => vec![fallback_device_id.to_string()],
        };
        let db_mapping = read_json_map("UPSLINK_DEVICE_DB_MAPPING")?;
        let display_names = read_json_map("UPSLINK_DEVICE_NAMES")?;
        Ok(Self::new(device_ids, db_mapping, display_names))
    }

    pub fn device_ids(&self) -> &[String] {
        &self.device_ids
    }

    pub fn device_count(&self) -> usize {
        self.device_ids.len()
    }

    pub fn is_known(&self, wire_id: &str) -> bool {
        self.device_ids.iter().any(|id| id == wire_id)
    }

    /// 总线键 → 存储标识；未映射时按原样返回。
    pub fn db_identifier(&self, wire_id: &str) -> String {
        self.wire_to_db
            .get(wire_id)
            .cloned()
            .unwrap_or_else(|| wire_id.to_string())
    }

    /// 存储标识 → 总线键；未映射时按原样返回。
    pub fn wire_id(&self, db_identifier: &str) -> String {
        self.db_to_wire
            .get(db_identifier)
            .cloned()
            .unwrap_or_else(|| db_identifier.to_string())
    }

    /// 显示名；未配置时由设备键派生（下划线转空格、首字母大写）。
    pub fn display_name(&self, wire_id: &str) -> String {
        if let Some(name) = self.display_names.get(wire_id) {
            return name.clone();
        }
        let mut name = wire_id.replace('_', " ");
        if let Some(first) = name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        name
    }
}

fn read_json_map(key: &str) -> Result<HashMap<String, String>, ConfigError> {
    let raw = match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(HashMap::new()),
    };
    serde_json::from_str(&raw).map_err(|_| ConfigError::Invalid(key.to_string(), raw))
}
