//! 稳定的状态查询 / 指标响应契约。

use serde::Serialize;

/// 单个组件的连接或运行状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Connected,
    Disconnected,
    Running,
    Stopped,
}

impl ComponentHealth {
    pub fn connected(up: bool) -> Self {
        if up {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }

    pub fn running(up: bool) -> Self {
        if up {
            Self::Running
        } else {
            Self::Stopped
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Self::Connected | Self::Running)
    }
}

/// 健康检查响应体（GET /health）。
#[derive(Debug, Serialize)]
pub struct BridgeStatus {
    pub service: &'static str,
    pub version: &'static str,
    /// 全部组件在线为 "healthy"，否则 "degraded"。
    pub status: &'static str,
    pub components: BridgeComponents,
    /// 最近一次成功轮询的 Unix 毫秒时间戳；尚未轮询成功为 None。
    pub last_poll_ms: Option<i64>,
    /// 最近一次成功落库的 Unix 毫秒时间戳；尚未落库为 None。
    pub last_save_ms: Option<i64>,
    pub devices_monitored: usize,
}

/// 各组件状态。
#[derive(Debug, Serialize)]
pub struct BridgeComponents {
    pub mqtt: ComponentHealth,
    pub database: ComponentHealth,
    pub poller: ComponentHealth,
    pub collector: ComponentHealth,
}

impl BridgeStatus {
    pub fn is_healthy(&self) -> bool {
        self.components.mqtt.is_up()
            && self.components.database.is_up()
            && self.components.poller.is_up()
            && self.components.collector.is_up()
    }
}

/// 流水线计数器快照响应体（GET /metrics）。
#[derive(Debug, Serialize)]
pub struct MetricsDto {
    pub polls_completed: u64,
    pub polls_skipped: u64,
    pub source_reconnects: u64,
    pub bus_publish_failures: u64,
    pub discovery_publishes: u64,
    pub fields_merged: u64,
    pub dropped_topic_shape: u64,
    pub samples_saved: u64,
    pub saves_skipped_invalid: u64,
    pub save_failures: u64,
    pub store_retries: u64,
    pub store_reconnects: u64,
    pub power_events_logged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_serializes_snake_case() {
        let status = BridgeStatus {
            service: "upslink",
            version: "1.0",
            status: "degraded",
            components: BridgeComponents {
                mqtt: ComponentHealth::Connected,
                database: ComponentHealth::Disconnected,
                poller: ComponentHealth::Running,
                collector: ComponentHealth::Running,
            },
            last_poll_ms: Some(1_700_000_000_000),
            last_save_ms: None,
            devices_monitored: 1,
        };
        assert!(!status.is_healthy());
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["components"]["mqtt"], "connected");
        assert_eq!(json["components"]["database"], "disconnected");
        assert_eq!(json["last_save_ms"], serde_json::Value::Null);
    }
}
