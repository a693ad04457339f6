//! 硬件源轮询与发现公告同步。
//!
//! 周期性地从硬件源拉取完整变量集、构建样本、逐字段发布到总线，
//! 并使"可用传感器公告"与总线连通性保持同步：每次总线重连后
//! 恰好重发一次全部公告。

pub mod discovery;
pub mod source;

pub use discovery::DiscoveryPublisher;
pub use source::{SourceError, UpsSource, UpscCommandSource};

use domain::{UpsSample, now_epoch_ms};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use upslink_bus::Bus;
use upslink_telemetry::{
    record_bus_publish_failure, record_discovery_published, record_poll_completed,
    record_poll_skipped, record_source_reconnect,
};

// 硬件源重连退避上限
const MAX_BACKOFF_SECONDS: u64 = 64;

/// 轮询器运行参数。
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub device_id: String,
    pub device_name: String,
    pub discovery_prefix: String,
    pub poll_interval: Duration,
    pub nominal_power_watts: f64,
}

struct PollerInner {
    bus: Arc<dyn Bus>,
    config: PollerConfig,
    running: AtomicBool,
    last_poll_ms: Mutex<Option<i64>>,
}

/// 硬件源轮询服务。
pub struct PollerService {
    inner: Arc<PollerInner>,
    source: Mutex<Option<Box<dyn UpsSource>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollerService {
    pub fn new(bus: Arc<dyn Bus>, source: Box<dyn UpsSource>, config: PollerConfig) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                bus,
                config,
                running: AtomicBool::new(false),
                last_poll_ms: Mutex::new(None),
            }),
            source: Mutex::new(Some(source)),
            handle: Mutex::new(None),
        }
    }

    /// 启动后台轮询循环。
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!(target: "upslink.poller", "poller_already_running");
            return;
        }
        let source = {
            let mut slot = self.source.lock().unwrap_or_else(|err| err.into_inner());
            slot.take()
        };
        let Some(source) = source else {
            warn!(target: "upslink.poller", "poller_source_missing");
            self.inner.running.store(false, Ordering::SeqCst);
            return;
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_poll_loop(inner, source));
        let mut slot = self.handle.lock().unwrap_or_else(|err| err.into_inner());
        *slot = Some(handle);
        info!(target: "upslink.poller", "poller_started");
    }

    /// 停止轮询循环并等待其退出。
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(|err| err.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(target: "upslink.poller", error = %err, "poller_task_join_failed");
            }
        }
        info!(target: "upslink.poller", "poller_stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 最近一次完整轮询-发布周期的 Unix 毫秒时间戳。
    pub fn last_poll_ms(&self) -> Option<i64> {
        let last = self
            .inner
            .last_poll_ms
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *last
    }
}

/// 轮询主循环：维护硬件源自己的退避重连，节拍之间分片睡眠。
async fn run_poll_loop(inner: Arc<PollerInner>, mut source: Box<dyn UpsSource>) {
    info!(target: "upslink.poller", "poller_loop_started");
    let discovery = DiscoveryPublisher::new(
        Arc::clone(&inner.bus),
        inner.config.discovery_prefix.clone(),
        inner.config.device_id.clone(),
        inner.config.device_name.clone(),
    );
    let mut discovery_published = false;
    let mut reconnect_attempts: u32 = 0;

    while inner.running.load(Ordering::SeqCst) {
        if !source.is_connected() {
            match source.connect().await {
                Ok(()) => {
                    reconnect_attempts = 0;
                    info!(target: "upslink.poller", "source_connected");
                }
                Err(err) => {
                    record_source_reconnect();
                    let backoff = backoff_seconds(reconnect_attempts);
                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    warn!(
                        target: "upslink.poller",
                        error = %err,
                        backoff_seconds = backoff,
                        "source_connect_failed"
                    );
                    sleep_sliced(&inner.running, Duration::from_secs(backoff)).await;
                    continue;
                }
            }
        }

        let completed = poll_and_publish(
            &inner.bus,
            &inner.config,
            source.as_mut(),
            &discovery,
            &mut discovery_published,
        )
        .await;
        if completed {
            record_poll_completed();
            let mut last = inner
                .last_poll_ms
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            *last = Some(now_epoch_ms());
        } else {
            record_poll_skipped();
        }

        sleep_sliced(&inner.running, inner.config.poll_interval).await;
    }

    source.disconnect().await;
    info!(target: "upslink.poller", "poller_loop_stopped");
}

/// 单个轮询周期：拉取、建样、公告状态机、逐字段发布。
///
/// 无变量或样本无效按跳过周期处理（不触碰硬件源连接状态）；
/// 返回是否完成了一次全部成功的发布。
async fn poll_and_publish(
    bus: &Arc<dyn Bus>,
    config: &PollerConfig,
    source: &mut dyn UpsSource,
    discovery: &DiscoveryPublisher,
    discovery_published: &mut bool,
) -> bool {
    let variables = match source.fetch_variables().await {
        Ok(variables) => variables,
        Err(err) => {
            warn!(target: "upslink.poller", error = %err, "source_fetch_failed");
            return false;
        }
    };
    if variables.is_empty() {
        warn!(target: "upslink.poller", "source_no_variables");
        return false;
    }

    let sample = UpsSample::from_source_variables(
        &config.device_id,
        &variables,
        config.nominal_power_watts,
    );
    if !sample.is_valid() {
        warn!(target: "upslink.poller", "poller_sample_invalid");
        return false;
    }

    // 公告状态机：NotPublished → Published 仅在总线连通且整批发布成功时；
    // 观测到总线断开即回到 NotPublished，因此每次重连恰好重发一次。
    if bus.is_connected() {
        if !*discovery_published && discovery.publish_all() {
            *discovery_published = true;
            record_discovery_published();
        }
    } else if *discovery_published {
        info!(target: "upslink.poller", "discovery_reset_on_bus_loss");
        *discovery_published = false;
    }

    let messages = sample.to_wire_messages(&config.discovery_prefix);
    let mut all_success = true;
    for message in &messages {
        if !bus.publish(&message.topic, &message.payload, message.qos, message.retain) {
            all_success = false;
            record_bus_publish_failure();
        }
    }
    if all_success {
        info!(
            target: "upslink.poller",
            fields = messages.len(),
            "poller_metrics_published"
        );
    }
    all_success
}

// 指数退避：1,2,4,...,封顶 64 秒
fn backoff_seconds(attempts: u32) -> u64 {
    (1u64 << attempts.min(6)).min(MAX_BACKOFF_SECONDS)
}

/// 分片睡眠：每秒检查一次停机标志。
async fn sleep_sliced(running: &AtomicBool, total: Duration) {
    let mut remaining = total;
    while running.load(Ordering::SeqCst) && !remaining.is_zero() {
        let slice = remaining.min(Duration::from_secs(1));
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
}
