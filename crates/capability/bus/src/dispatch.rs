//! 订阅表与消息分发。
//!
//! 回调在注册调用返回前即已入表，分发不依赖 broker 确认。
//! 分发时仅在快照命中回调期间持锁，回调本身在锁外执行，
//! 因此回调内再次 publish/subscribe 不会死锁。

use crate::pattern::topic_matches;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// 消息回调：参数为 (topic, payload)。
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct SubscriptionEntry {
    pattern: String,
    qos: u8,
    callback: MessageCallback,
}

/// 模式 → 回调的订阅表。
#[derive(Default)]
pub struct SubscriptionTable {
    entries: Mutex<Vec<SubscriptionEntry>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册回调；同一模式重复注册时替换旧回调。
    pub fn register(&self, pattern: &str, callback: MessageCallback, qos: u8) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(entry) = entries.iter_mut().find(|entry| entry.pattern == pattern) {
            entry.callback = callback;
            entry.qos = qos;
        } else {
            entries.push(SubscriptionEntry {
                pattern: pattern.to_string(),
                qos,
                callback,
            });
        }
    }

    /// 移除模式；返回是否存在过。
    pub fn remove(&self, pattern: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.pattern != pattern);
        entries.len() != before
    }

    /// 当前全部 (模式, qos)，供重连后恢复订阅。
    pub fn patterns(&self) -> Vec<(String, u8)> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries
            .iter()
            .map(|entry| (entry.pattern.clone(), entry.qos))
            .collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 分发一条到达消息：评估全部模式，逐个调用命中的回调。
    ///
    /// 单个回调 panic 被就地捕获并记录，不影响其余订阅者。
    pub fn dispatch(&self, topic: &str, payload: &str) {
        let matched: Vec<MessageCallback> = {
            let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
            entries
                .iter()
                .filter(|entry| topic_matches(topic, &entry.pattern))
                .map(|entry| Arc::clone(&entry.callback))
                .collect()
        };
        for callback in matched {
            if catch_unwind(AssertUnwindSafe(|| callback(topic, payload))).is_err() {
                warn!(target: "upslink.bus", topic = %topic, "bus_callback_panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> MessageCallback {
        Arc::new(move |_topic, _payload| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn callback_is_dispatchable_immediately_after_register() {
        let table = SubscriptionTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register("root/sensor/+/state", counting_callback(counter.clone()), 1);
        // 注册返回后无需任何确认即可命中
        table.dispatch("root/sensor/battery_charge/state", "42");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_matching_pattern_is_invoked() {
        let table = SubscriptionTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register("root/#", counting_callback(counter.clone()), 1);
        table.register("root/sensor/+/state", counting_callback(counter.clone()), 1);
        table.register("other/#", counting_callback(counter.clone()), 1);
        table.dispatch("root/sensor/a/state", "x");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let table = SubscriptionTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register(
            "root/#",
            Arc::new(|_topic, _payload| panic!("subscriber failure")),
            1,
        );
        table.register("root/+", counting_callback(counter.clone()), 1);
        table.dispatch("root/a", "x");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_same_pattern_replaces_callback() {
        let table = SubscriptionTable::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        table.register("a/b", counting_callback(first.clone()), 1);
        table.register("a/b", counting_callback(second.clone()), 1);
        assert_eq!(table.len(), 1);
        table.dispatch("a/b", "x");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_stops_dispatch() {
        let table = SubscriptionTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register("a/b", counting_callback(counter.clone()), 1);
        assert!(table.remove("a/b"));
        assert!(!table.remove("a/b"));
        table.dispatch("a/b", "x");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
