//! 追踪初始化与流水线计数器。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 流水线计数器快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
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

/// 流水线计数器。
pub struct TelemetryMetrics {
    polls_completed: AtomicU64,
    polls_skipped: AtomicU64,
    source_reconnects: AtomicU64,
    bus_publish_failures: AtomicU64,
    discovery_publishes: AtomicU64,
    fields_merged: AtomicU64,
    dropped_topic_shape: AtomicU64,
    samples_saved: AtomicU64,
    saves_skipped_invalid: AtomicU64,
    save_failures: AtomicU64,
    store_retries: AtomicU64,
    store_reconnects: AtomicU64,
    power_events_logged: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            polls_completed: AtomicU64::new(0),
            polls_skipped: AtomicU64::new(0),
            source_reconnects: AtomicU64::new(0),
            bus_publish_failures: AtomicU64::new(0),
            discovery_publishes: AtomicU64::new(0),
            fields_merged: AtomicU64::new(0),
            dropped_topic_shape: AtomicU64::new(0),
            samples_saved: AtomicU64::new(0),
            saves_skipped_invalid: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
            store_retries: AtomicU64::new(0),
            store_reconnects: AtomicU64::new(0),
            power_events_logged: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls_completed: self.polls_completed.load(Ordering::Relaxed),
            polls_skipped: self.polls_skipped.load(Ordering::Relaxed),
            source_reconnects: self.source_reconnects.load(Ordering::Relaxed),
            bus_publish_failures: self.bus_publish_failures.load(Ordering::Relaxed),
            discovery_publishes: self.discovery_publishes.load(Ordering::Relaxed),
            fields_merged: self.fields_merged.load(Ordering::Relaxed),
            dropped_topic_shape: self.dropped_topic_shape.load(Ordering::Relaxed),
            samples_saved: self.samples_saved.load(Ordering::Relaxed),
            saves_skipped_invalid: self.saves_skipped_invalid.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            store_reconnects: self.store_reconnects.load(Ordering::Relaxed),
            power_events_logged: self.power_events_logged.load(Ordering::Relaxed),
        }
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局计数器实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录一次完整的轮询-发布周期。
pub fn record_poll_completed() {
    metrics().polls_completed.fetch_add(1, Ordering::Relaxed);
}

/// 记录被跳过的轮询周期（无变量或样本无效）。
pub fn record_poll_skipped() {
    metrics().polls_skipped.fetch_add(1, Ordering::Relaxed);
}

/// 记录硬件源重连尝试。
pub fn record_source_reconnect() {
    metrics().source_reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录总线发布失败。
pub fn record_bus_publish_failure() {
    metrics().bus_publish_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录一轮发现公告发布。
pub fn record_discovery_published() {
    metrics().discovery_publishes.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次字段合并。
pub fn record_field_merged() {
    metrics().fields_merged.fetch_add(1, Ordering::Relaxed);
}

/// 记录因主题形状不符被丢弃的消息。
pub fn record_dropped_topic_shape() {
    metrics().dropped_topic_shape.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次成功落库。
pub fn record_sample_saved() {
    metrics().samples_saved.fetch_add(1, Ordering::Relaxed);
}

/// 记录因样本无效被跳过的落库。
pub fn record_save_skipped_invalid() {
    metrics()
        .saves_skipped_invalid
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录落库失败（重试预算耗尽）。
pub fn record_save_failure() {
    metrics().save_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录存储操作重试。
pub fn record_store_retry() {
    metrics().store_retries.fetch_add(1, Ordering::Relaxed);
}

/// 记录存储连接重建。
pub fn record_store_reconnect() {
    metrics().store_reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录一条电源事件落库。
pub fn record_power_event_logged() {
    metrics().power_events_logged.fetch_add(1, Ordering::Relaxed);
}
