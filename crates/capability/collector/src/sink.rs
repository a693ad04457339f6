//! 样本落库接口。

use async_trait::async_trait;
use domain::UpsSample;
use std::sync::Arc;
use upslink_store::StoreGateway;

/// 聚合器面向存储的窄接口；生产实现为 [`StoreSampleSink`]。
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn insert_sample(&self, sample: &UpsSample, storage_identifier: &str) -> bool;

    async fn resolve_device_key(&self, storage_identifier: &str) -> Option<i32>;

    async fn log_event(
        &self,
        device_key: i32,
        event_type: &str,
        battery_level_start: f64,
        battery_level_end: f64,
        load_at_event: f64,
    ) -> bool;
}

/// 基于存储网关的落库实现。
#[derive(Clone)]
pub struct StoreSampleSink {
    gateway: Arc<StoreGateway>,
}

impl StoreSampleSink {
    pub fn new(gateway: Arc<StoreGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SampleSink for StoreSampleSink {
    async fn insert_sample(&self, sample: &UpsSample, storage_identifier: &str) -> bool {
        self.gateway.insert_sample(sample, storage_identifier).await
    }

    async fn resolve_device_key(&self, storage_identifier: &str) -> Option<i32> {
        self.gateway.resolve_device_key(storage_identifier).await
    }

    async fn log_event(
        &self,
        device_key: i32,
        event_type: &str,
        battery_level_start: f64,
        battery_level_end: f64,
        load_at_event: f64,
    ) -> bool {
        self.gateway
            .log_event(
                device_key,
                event_type,
                battery_level_start,
                battery_level_end,
                load_at_event,
            )
            .await
    }
}
