//! 遥测聚合器。
//!
//! 订阅每台已知设备的 state 通配符主题，把零散的逐字段更新合并成
//! 完整样本，并按设备独立的保存间隔刷入存储网关：
//! - 首次观测到的设备立即落库一次（不等完整间隔）
//! - 之后每满一个保存间隔落库一次
//! - 无效样本与失败的落库不清内存，下个调度周期自然重试
//! - 停机时无视间隔做最后一轮同步刷盘

pub mod sink;

pub use sink::{SampleSink, StoreSampleSink};

use domain::{UpsSample, now_epoch_ms};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use upslink_bus::{Bus, MessageCallback};
use upslink_config::DeviceMap;
use upslink_telemetry::{
    record_dropped_topic_shape, record_field_merged, record_power_event_logged,
    record_sample_saved, record_save_failure, record_save_skipped_invalid,
};

// 调度循环唤醒节奏（同时也是停机响应粒度）
const TICK: Duration = Duration::from_secs(1);

/// 聚合器运行参数。
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// state 主题的根段。
    pub discovery_prefix: String,
    /// 同一设备两次落库之间的最小间隔。
    pub save_interval: Duration,
    /// 负载瓦数换算的回退额定功率。
    pub nominal_power_watts: f64,
}

// 完成的停电事件，等待调度循环异步落库
struct PendingPowerEvent {
    identifier: String,
    battery_level_start: f64,
    battery_level_end: f64,
    load_at_event: f64,
}

#[derive(Default)]
struct CollectorState {
    /// 存储标识 → 进行中的样本
    samples: HashMap<String, UpsSample>,
    /// 存储标识 → 最近一次成功落库时刻；缺席表示"从未保存"
    last_saved: HashMap<String, Instant>,
    /// 存储标识 → 停电开始时的电量
    outage_start: HashMap<String, f64>,
    pending_events: Vec<PendingPowerEvent>,
}

struct CollectorInner {
    sink: Arc<dyn SampleSink>,
    devices: Arc<DeviceMap>,
    config: CollectorConfig,
    running: AtomicBool,
    state: Mutex<CollectorState>,
    last_save_ms: Mutex<Option<i64>>,
}

/// 遥测聚合器。
pub struct Collector {
    inner: Arc<CollectorInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(sink: Arc<dyn SampleSink>, devices: Arc<DeviceMap>, config: CollectorConfig) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                sink,
                devices,
                config,
                running: AtomicBool::new(false),
                state: Mutex::new(CollectorState::default()),
                last_save_ms: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    /// 为每台已知设备注册一个 state 通配符订阅。
    ///
    /// 返回是否全部订阅成功；部分失败时已注册的回调保持有效。
    pub fn setup_subscriptions(&self, bus: &Arc<dyn Bus>) -> bool {
        let patterns: Vec<String> = self
            .inner
            .devices
            .device_ids()
            .iter()
            .map(|device_id| {
                format!(
                    "{}/sensor/{}/+/state",
                    self.inner.config.discovery_prefix, device_id
                )
            })
            .collect();
        for pattern in &patterns {
            info!(target: "upslink.collector", pattern = %pattern, "collector_subscribing");
        }
        let inner = Arc::clone(&self.inner);
        let callback: MessageCallback = Arc::new(move |topic, payload| {
            inner.on_bus_message(topic, payload);
        });
        let all_success = bus.subscribe_multiple(&patterns, callback, 1);
        if !all_success {
            warn!(target: "upslink.collector", "collector_subscription_partial_failure");
        }
        all_success
    }

    /// 启动后台刷盘调度循环。
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!(target: "upslink.collector", "collector_already_running");
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_flush_loop(inner));
        let mut slot = self.handle.lock().unwrap_or_else(|err| err.into_inner());
        *slot = Some(handle);
        info!(target: "upslink.collector", "collector_started");
    }

    /// 停止调度循环并做最后一轮刷盘（无视间隔）。
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(|err| err.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(target: "upslink.collector", error = %err, "collector_task_join_failed");
            }
        }
        flush_due(&self.inner, true).await;
        drain_power_events(&self.inner).await;
        info!(target: "upslink.collector", "collector_stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 最近一次成功落库的 Unix 毫秒时间戳。
    pub fn last_save_ms(&self) -> Option<i64> {
        let last = self
            .inner
            .last_save_ms
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *last
    }

    /// 已观测到的设备数。
    pub fn device_count(&self) -> usize {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        state.samples.len()
    }
}

impl CollectorInner {
    /// 总线分发线程上的消息入口：解析主题形状并做字段合并。
    fn on_bus_message(&self, topic: &str, payload: &str) {
        let Some((wire_id, field)) = parse_state_topic(&self.config.discovery_prefix, topic)
        else {
            record_dropped_topic_shape();
            return;
        };
        let identifier = self.devices.db_identifier(wire_id);

        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if !state.samples.contains_key(&identifier) {
            state
                .samples
                .insert(identifier.clone(), UpsSample::new(wire_id));
            // last_saved 有意缺席：调度循环据此立即做首次落库
            info!(
                target: "upslink.collector",
                identifier = %identifier,
                "collector_new_device"
            );
        }
        let nominal = self.config.nominal_power_watts;
        let Some(sample) = state.samples.get_mut(&identifier) else {
            return;
        };
        let failure_before = sample.bool_field("power_failure").unwrap_or(false);
        if sample.merge_field(field, payload, nominal) {
            record_field_merged();
        }
        let failure_after = sample.bool_field("power_failure").unwrap_or(false);
        let battery = sample.f64_field("battery_charge").unwrap_or(0.0);
        let load = sample.f64_field("load_percentage").unwrap_or(0.0);

        if !failure_before && failure_after {
            state.outage_start.insert(identifier.clone(), battery);
            warn!(
                target: "upslink.collector",
                identifier = %identifier,
                battery = battery,
                "collector_power_failure_started"
            );
        } else if failure_before && !failure_after {
            if let Some(battery_level_start) = state.outage_start.remove(&identifier) {
                info!(
                    target: "upslink.collector",
                    identifier = %identifier,
                    battery = battery,
                    "collector_power_restored"
                );
                state.pending_events.push(PendingPowerEvent {
                    identifier,
                    battery_level_start,
                    battery_level_end: battery,
                    load_at_event: load,
                });
            }
        }
    }
}

/// 后台刷盘调度循环。
async fn run_flush_loop(inner: Arc<CollectorInner>) {
    info!(target: "upslink.collector", "collector_scheduler_started");
    while inner.running.load(Ordering::SeqCst) {
        tokio::time::sleep(TICK).await;
        flush_due(&inner, false).await;
        drain_power_events(&inner).await;
    }
    info!(target: "upslink.collector", "collector_scheduler_stopped");
}

/// 刷入所有到期设备的样本。
///
/// 锁内只做快照拷贝，存储调用在锁外进行；落库失败或样本无效都不
/// 清内存，数据留待下个调度周期。`force` 时无视间隔（停机路径）。
async fn flush_due(inner: &Arc<CollectorInner>, force: bool) {
    let due: Vec<(String, UpsSample)> = {
        let state = inner.state.lock().unwrap_or_else(|err| err.into_inner());
        state
            .samples
            .iter()
            .filter(|(identifier, _)| {
                force
                    || match state.last_saved.get(*identifier) {
                        None => true,
                        Some(last) => last.elapsed() >= inner.config.save_interval,
                    }
            })
            .map(|(identifier, sample)| (identifier.clone(), sample.clone()))
            .collect()
    };

    for (identifier, sample) in due {
        if !sample.is_valid() {
            record_save_skipped_invalid();
            info!(
                target: "upslink.collector",
                identifier = %identifier,
                "collector_sample_invalid_skipped"
            );
            continue;
        }
        if inner.sink.insert_sample(&sample, &identifier).await {
            record_sample_saved();
            let mut state = inner.state.lock().unwrap_or_else(|err| err.into_inner());
            state.last_saved.insert(identifier.clone(), Instant::now());
            drop(state);
            let mut last = inner
                .last_save_ms
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            *last = Some(now_epoch_ms());
            info!(
                target: "upslink.collector",
                identifier = %identifier,
                "collector_sample_saved"
            );
        } else {
            record_save_failure();
            warn!(
                target: "upslink.collector",
                identifier = %identifier,
                "collector_save_failed"
            );
        }
    }
}

/// 落库已完成的停电事件。
async fn drain_power_events(inner: &Arc<CollectorInner>) {
    let pending: Vec<PendingPowerEvent> = {
        let mut state = inner.state.lock().unwrap_or_else(|err| err.into_inner());
        std::mem::take(&mut state.pending_events)
    };
    for event in pending {
        let Some(device_key) = inner.sink.resolve_device_key(&event.identifier).await else {
            warn!(
                target: "upslink.collector",
                identifier = %event.identifier,
                "collector_event_device_unknown"
            );
            continue;
        };
        if inner
            .sink
            .log_event(
                device_key,
                "power_failure",
                event.battery_level_start,
                event.battery_level_end,
                event.load_at_event,
            )
            .await
        {
            record_power_event_logged();
        }
    }
}

/// 解析 state 主题：`{prefix}/sensor/{device}/{field}/state`。
///
/// 形状不符（段数、固定段）一律返回 None。
fn parse_state_topic<'t>(prefix: &str, topic: &'t str) -> Option<(&'t str, &'t str)> {
    let prefix_parts: Vec<&str> = prefix.split('/').collect();
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != prefix_parts.len() + 4 {
        return None;
    }
    if parts[..prefix_parts.len()] != prefix_parts[..] {
        return None;
    }
    if parts.get(prefix_parts.len()) != Some(&"sensor") || parts.last() != Some(&"state") {
        return None;
    }
    let device = parts.get(prefix_parts.len() + 1).copied()?;
    let field = parts.get(prefix_parts.len() + 2).copied()?;
    if device.is_empty() || field.is_empty() {
        return None;
    }
    Some((device, field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct RecordingSink {
        saved: Mutex<Vec<(String, UpsSample)>>,
        events: Mutex<Vec<(i32, String, f64, f64, f64)>>,
        fail_saves: AtomicBool,
    }

    #[async_trait]
    impl SampleSink for RecordingSink {
        async fn insert_sample(&self, sample: &UpsSample, storage_identifier: &str) -> bool {
            if self.fail_saves.load(Ordering::SeqCst) {
                return false;
            }
            let mut saved = self.saved.lock().unwrap();
            saved.push((storage_identifier.to_string(), sample.clone()));
            true
        }

        async fn resolve_device_key(&self, _storage_identifier: &str) -> Option<i32> {
            Some(42)
        }

        async fn log_event(
            &self,
            device_key: i32,
            event_type: &str,
            battery_level_start: f64,
            battery_level_end: f64,
            load_at_event: f64,
        ) -> bool {
            let mut events = self.events.lock().unwrap();
            events.push((
                device_key,
                event_type.to_string(),
                battery_level_start,
                battery_level_end,
                load_at_event,
            ));
            true
        }
    }

    struct FakeBus {
        subscriptions: Mutex<Vec<(String, MessageCallback)>>,
    }

    impl FakeBus {
        fn new() -> Self {
            Self {
                subscriptions: Mutex::new(Vec::new()),
            }
        }

        fn deliver(&self, topic: &str, payload: &str) {
            let matched: Vec<MessageCallback> = {
                let subs = self.subscriptions.lock().unwrap();
                subs.iter()
                    .filter(|(pattern, _)| upslink_bus::topic_matches(topic, pattern))
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect()
            };
            for cb in matched {
                cb(topic, payload);
            }
        }
    }

    impl Bus for FakeBus {
        fn is_connected(&self) -> bool {
            true
        }

        fn publish(&self, _topic: &str, _payload: &str, _qos: u8, _retain: bool) -> bool {
            true
        }

        fn subscribe(&self, pattern: &str, callback: MessageCallback, _qos: u8) -> bool {
            let mut subs = self.subscriptions.lock().unwrap();
            subs.push((pattern.to_string(), callback));
            true
        }

        fn subscribe_multiple(
            &self,
            patterns: &[String],
            callback: MessageCallback,
            qos: u8,
        ) -> bool {
            for pattern in patterns {
                self.subscribe(pattern, Arc::clone(&callback), qos);
            }
            true
        }

        fn unsubscribe(&self, _pattern: &str) -> bool {
            true
        }
    }

    fn test_devices() -> Arc<DeviceMap> {
        Arc::new(DeviceMap::new(
            vec!["apc_ups".to_string()],
            StdHashMap::from([("apc_ups".to_string(), "server-ups".to_string())]),
            StdHashMap::new(),
        ))
    }

    fn test_collector(sink: Arc<RecordingSink>, interval: Duration) -> Collector {
        Collector::new(
            sink,
            test_devices(),
            CollectorConfig {
                discovery_prefix: "homeassistant".to_string(),
                save_interval: interval,
                nominal_power_watts: 600.0,
            },
        )
    }

    #[test]
    fn state_topic_shape_is_enforced() {
        assert_eq!(
            parse_state_topic("homeassistant", "homeassistant/sensor/apc_ups/battery_charge/state"),
            Some(("apc_ups", "battery_charge"))
        );
        assert_eq!(
            parse_state_topic(
                "homeassistant",
                "homeassistant/sensor/apc_ups/battery_charge/extra/state"
            ),
            None
        );
        assert_eq!(
            parse_state_topic("homeassistant", "homeassistant/switch/apc_ups/x/state"),
            None
        );
        assert_eq!(
            parse_state_topic("homeassistant", "homeassistant/sensor/apc_ups/x/config"),
            None
        );
    }

    #[tokio::test]
    async fn merged_fields_flush_immediately_for_new_device() {
        let sink = Arc::new(RecordingSink::default());
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        // 直接走消息入口，不经过真实总线
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/battery_charge/state", "88");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/ups_status/state", "OL");
        assert_eq!(collector.device_count(), 1);

        flush_due(&collector.inner, false).await;
        let saved = sink.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        let (identifier, sample) = &saved[0];
        assert_eq!(identifier, "server-ups");
        assert_eq!(sample.f64_field("battery_charge"), Some(88.0));
        assert_eq!(sample.text_field("ups_status"), Some("OL"));
    }

    #[tokio::test]
    async fn interval_gates_subsequent_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/battery_charge/state", "88");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/ups_status/state", "OL");

        flush_due(&collector.inner, false).await;
        flush_due(&collector.inner, false).await;
        assert_eq!(sink.saved.lock().unwrap().len(), 1);

        // force 无视间隔（停机路径）
        flush_due(&collector.inner, true).await;
        assert_eq!(sink.saved.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_sample_is_skipped_until_complete() {
        let sink = Arc::new(RecordingSink::default());
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/ups_status/state", "OL");

        flush_due(&collector.inner, false).await;
        assert!(sink.saved.lock().unwrap().is_empty());

        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/battery_charge/state", "90");
        flush_due(&collector.inner, false).await;
        assert_eq!(sink.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_save_keeps_sample_for_next_tick() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_saves.store(true, Ordering::SeqCst);
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/battery_charge/state", "88");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/ups_status/state", "OL");

        flush_due(&collector.inner, false).await;
        assert!(sink.saved.lock().unwrap().is_empty());
        assert_eq!(collector.device_count(), 1);

        // 存储恢复后，下个调度周期补写同一份数据
        sink.fail_saves.store(false, Ordering::SeqCst);
        flush_due(&collector.inner, false).await;
        assert_eq!(sink.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_topic_is_discarded() {
        let sink = Arc::new(RecordingSink::default());
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/deep/extra/state", "1");
        collector.inner.on_bus_message("short/topic", "1");
        assert_eq!(collector.device_count(), 0);
    }

    #[tokio::test]
    async fn stop_flushes_regardless_of_interval() {
        let sink = Arc::new(RecordingSink::default());
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/battery_charge/state", "88");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/ups_status/state", "OL");
        // 先正常落库一次，让间隔尚未到期
        flush_due(&collector.inner, false).await;
        assert_eq!(sink.saved.lock().unwrap().len(), 1);

        collector.stop().await;
        assert_eq!(sink.saved.lock().unwrap().len(), 2);
        assert!(!collector.is_running());
    }

    #[tokio::test]
    async fn completed_outage_logs_one_power_event() {
        let sink = Arc::new(RecordingSink::default());
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/battery_charge/state", "95");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/load_percentage/state", "40");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/ups_status/state", "OB DISCHRG");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/battery_charge/state", "80");
        collector
            .inner
            .on_bus_message("homeassistant/sensor/apc_ups/ups_status/state", "OL");

        drain_power_events(&collector.inner).await;
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (key, event_type, start, end, load) = &events[0];
        assert_eq!(*key, 42);
        assert_eq!(event_type, "power_failure");
        assert_eq!(*start, 95.0);
        assert_eq!(*end, 80.0);
        assert_eq!(*load, 40.0);
    }

    #[tokio::test]
    async fn delivery_through_bus_pattern_reaches_collector() {
        let sink = Arc::new(RecordingSink::default());
        let collector = test_collector(sink.clone(), Duration::from_secs(3600));
        let bus = Arc::new(FakeBus::new());
        let bus_dyn: Arc<dyn Bus> = bus.clone();
        assert!(collector.setup_subscriptions(&bus_dyn));
        bus.deliver("homeassistant/sensor/apc_ups/battery_charge/state", "77");
        // 其它设备的主题不会命中本设备的模式
        bus.deliver("homeassistant/sensor/other_ups/battery_charge/state", "1");
        assert_eq!(collector.device_count(), 1);
    }
}
