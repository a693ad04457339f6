//! 消息总线适配层。
//!
//! 在 rumqttc 传输层之上提供非阻塞、线程安全的发布/订阅：
//! - 订阅在返回前完成回调登记，SUBACK 即发即忘
//! - 发布在断连时快速失败，连接时仅入队不等待确认
//! - 到达消息按通配符模式分发给所有命中的订阅者
//! - 连接丢失事件异步翻转连接状态，重连由传输层事件循环自行完成

pub mod dispatch;
pub mod pattern;

pub use dispatch::{MessageCallback, SubscriptionTable};
pub use pattern::topic_matches;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// 连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// 总线接入参数。
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
}

/// 组件面向总线的窄接口；生产实现为 [`BusClient`]，测试用假体替换。
pub trait Bus: Send + Sync {
    fn is_connected(&self) -> bool;
    fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> bool;
    fn subscribe(&self, pattern: &str, callback: MessageCallback, qos: u8) -> bool;
    fn subscribe_multiple(&self, patterns: &[String], callback: MessageCallback, qos: u8) -> bool;
    fn unsubscribe(&self, pattern: &str) -> bool;
}

struct BusInner {
    state: Mutex<ConnectionState>,
    table: SubscriptionTable,
    client: AsyncClient,
}

/// rumqttc 之上的总线客户端。
pub struct BusClient {
    inner: Arc<BusInner>,
    // connect 时移交给事件循环任务
    eventloop: Mutex<Option<EventLoop>>,
}

// 启动阶段等待首个 ConnAck 的上限
const CONNECT_WAIT: Duration = Duration::from_secs(10);
// 传输层出错后的轮询间隔（事件循环自身的重连节奏）
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

impl BusClient {
    /// 构建客户端；此时尚未接触 broker。
    pub fn new(config: &BusConfig) -> Self {
        let client_id = format!("{}-{}", config.client_id, Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            options.set_credentials(username, password);
        }
        let (client, eventloop) = AsyncClient::new(options, 64);
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(ConnectionState::Disconnected),
                table: SubscriptionTable::new(),
                client,
            }),
            eventloop: Mutex::new(Some(eventloop)),
        }
    }

    /// 启动传输层事件循环并等待首次连接建立。
    ///
    /// 仅在启动时阻塞（有上限）；失败返回 false 且自身不重试，
    /// 但事件循环已在后台运行，后续由它完成自动重连。
    pub async fn connect(&self) -> bool {
        let eventloop = {
            let mut slot = self.eventloop.lock().unwrap_or_else(|err| err.into_inner());
            slot.take()
        };
        if let Some(eventloop) = eventloop {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(run_event_loop(inner, eventloop));
        }

        let deadline = tokio::time::Instant::now() + CONNECT_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        warn!(target: "upslink.bus", "bus_connect_timeout");
        self.is_connected()
    }

    /// 当前登记的订阅数量。
    pub fn subscription_count(&self) -> usize {
        self.inner.table.len()
    }
}

impl Bus for BusClient {
    fn is_connected(&self) -> bool {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *state == ConnectionState::Connected
    }

    fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self
            .inner
            .client
            .try_publish(topic, qos_from(qos), retain, payload)
        {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "upslink.bus", topic = %topic, error = %err, "bus_publish_failed");
                false
            }
        }
    }

    fn subscribe(&self, pattern: &str, callback: MessageCallback, qos: u8) -> bool {
        // 先登记后订阅：返回时回调必定可被分发命中
        self.inner.table.register(pattern, callback, qos);
        match self.inner.client.try_subscribe(pattern, qos_from(qos)) {
            Ok(()) => {
                info!(target: "upslink.bus", pattern = %pattern, "bus_subscribe_initiated");
                true
            }
            Err(err) => {
                // 登记保留：传输层恢复后由 ConnAck 路径补发订阅
                warn!(target: "upslink.bus", pattern = %pattern, error = %err, "bus_subscribe_failed");
                false
            }
        }
    }

    fn subscribe_multiple(&self, patterns: &[String], callback: MessageCallback, qos: u8) -> bool {
        let mut all_success = true;
        for pattern in patterns {
            if !self.subscribe(pattern, Arc::clone(&callback), qos) {
                all_success = false;
            }
        }
        all_success
    }

    fn unsubscribe(&self, pattern: &str) -> bool {
        if !self.is_connected() {
            warn!(target: "upslink.bus", pattern = %pattern, "bus_unsubscribe_while_disconnected");
            return false;
        }
        match self.inner.client.try_unsubscribe(pattern) {
            Ok(()) => {
                // 仅在传输层受理后移除回调
                self.inner.table.remove(pattern);
                info!(target: "upslink.bus", pattern = %pattern, "bus_unsubscribed");
                true
            }
            Err(err) => {
                warn!(target: "upslink.bus", pattern = %pattern, error = %err, "bus_unsubscribe_failed");
                false
            }
        }
    }
}

/// 传输层事件循环：驱动收发、维护连接状态、分发到达消息。
async fn run_event_loop(inner: Arc<BusInner>, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    set_state(&inner, ConnectionState::Connected);
                    info!(target: "upslink.bus", "bus_connected");
                    // 会话不保留，重连后补发全部既有订阅
                    for (pattern, qos) in inner.table.patterns() {
                        if let Err(err) = inner.client.try_subscribe(&pattern, qos_from(qos)) {
                            warn!(
                                target: "upslink.bus",
                                pattern = %pattern,
                                error = %err,
                                "bus_resubscribe_failed"
                            );
                        }
                    }
                } else {
                    warn!(target: "upslink.bus", code = ?ack.code, "bus_connack_rejected");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match std::str::from_utf8(&publish.payload) {
                    Ok(payload) => inner.table.dispatch(&publish.topic, payload),
                    Err(_) => {
                        warn!(target: "upslink.bus", topic = %publish.topic, "bus_payload_not_utf8");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                if set_state(&inner, ConnectionState::Disconnected) {
                    warn!(target: "upslink.bus", "bus_disconnected_by_broker");
                }
            }
            Ok(_) => {}
            Err(err) => {
                if set_state(&inner, ConnectionState::Disconnected) {
                    warn!(target: "upslink.bus", error = %err, "bus_connection_lost");
                }
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
}

// 返回状态是否发生了变化
fn set_state(inner: &BusInner, next: ConnectionState) -> bool {
    let mut state = inner.state.lock().unwrap_or_else(|err| err.into_inner());
    let changed = *state != next;
    *state = next;
    changed
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> BusConfig {
        BusConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "upslink-test".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_fails_fast_when_disconnected() {
        let bus = BusClient::new(&test_config());
        assert!(!bus.is_connected());
        assert!(!bus.publish("a/b", "1", 1, false));
    }

    #[tokio::test]
    async fn subscribe_registers_callback_without_broker_ack() {
        let bus = BusClient::new(&test_config());
        let counter = Arc::new(AtomicUsize::new(0));
        let cb_counter = counter.clone();
        let accepted = bus.subscribe(
            "root/sensor/+/state",
            Arc::new(move |_t, _p| {
                cb_counter.fetch_add(1, Ordering::SeqCst);
            }),
            1,
        );
        // 无 broker 时订阅请求仍被受理入队，回调立即可分发
        assert!(accepted);
        assert_eq!(bus.subscription_count(), 1);
        bus.inner.table.dispatch("root/sensor/x/state", "5");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_requires_connection() {
        let bus = BusClient::new(&test_config());
        bus.subscribe("a/+", Arc::new(|_t, _p| {}), 1);
        assert!(!bus.unsubscribe("a/+"));
        // 失败时回调保持登记
        assert_eq!(bus.subscription_count(), 1);
    }
}
