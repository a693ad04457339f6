//! 存储层。
//!
//! - [`gateway`]：存储网关（单连接、重试包装、幂等写入、事件追加）
//! - [`cache`]：设备键读穿缓存
//!
//! 表结构由外部协作方负责（DDL 不在本仓库内）：
//! - `ups_devices (device_id int, device_identifier text, ...)`
//! - `ups_metrics (device_id, timestamp, <指标列>)`，
//!   `(device_id, timestamp)` 唯一
//! - `power_events (device_id, event_type, battery_level_start,
//!   battery_level_end, load_at_event)` 仅追加

pub mod cache;
pub mod gateway;

pub use cache::DeviceKeyCache;
pub use gateway::StoreGateway;
