//! 设备键缓存：存储标识 → 数值设备键。
//!
//! 启动时整表加载，未命中时单条补齐；除进程重启外不失效。
//! 独立于连接锁，缓存读取不会被进行中的写库阻塞。

use std::collections::HashMap;
use std::sync::Mutex;

/// 读穿缓存。
#[derive(Debug, Default)]
pub struct DeviceKeyCache {
    entries: Mutex<HashMap<String, i32>>,
}

impl DeviceKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &str) -> Option<i32> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.get(identifier).copied()
    }

    pub fn insert(&self, identifier: &str, key: i32) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.insert(identifier.to_string(), key);
    }

    /// 整表替换（初始化时的批量加载）。
    pub fn replace_all(&self, loaded: HashMap<String, i32>) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        *entries = loaded;
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_insert_then_hit() {
        let cache = DeviceKeyCache::new();
        assert_eq!(cache.get("ups-1"), None);
        cache.insert("ups-1", 7);
        assert_eq!(cache.get("ups-1"), Some(7));
    }

    #[test]
    fn bulk_load_replaces_existing_entries() {
        let cache = DeviceKeyCache::new();
        cache.insert("stale", 1);
        cache.replace_all(HashMap::from([
            ("ups-1".to_string(), 10),
            ("ups-2".to_string(), 11),
        ]));
        assert_eq!(cache.get("stale"), None);
        assert_eq!(cache.get("ups-2"), Some(11));
        assert_eq!(cache.len(), 2);
    }
}
