//! 存储网关：单连接、重试包装与幂等落库。

use crate::cache::DeviceKeyCache;
use domain::UpsSample;
use sqlx::{Connection, PgConnection, Row};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use upslink_telemetry::{record_store_reconnect, record_store_retry};

// 单次逻辑操作的重试预算
const MAX_RETRIES: usize = 3;
// 重连失败后的停顿
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
// 两次重试之间的停顿
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// 面向 ups_devices / ups_metrics / power_events 三张表的存储网关。
///
/// 显式构造一次、以 Arc 注入各组件共享；生命周期即进程生命周期。
/// 连接是独占的单条 PostgreSQL 连接（无连接池），语句执行期间
/// 持有连接锁；设备键缓存使用独立的锁，互不阻塞。
pub struct StoreGateway {
    database_url: String,
    conn: Mutex<Option<PgConnection>>,
    cache: DeviceKeyCache,
}

impl StoreGateway {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            conn: Mutex::new(None),
            cache: DeviceKeyCache::new(),
        }
    }

    /// 建立连接并整表加载设备键缓存。
    ///
    /// 失败只留下断连状态的网关，后续操作经重试包装自行重连；
    /// 调用方不应因此退出进程。
    pub async fn initialize(&self) -> bool {
        let mut guard = self.conn.lock().await;
        let mut conn = match PgConnection::connect(&self.database_url).await {
            Ok(conn) => {
                info!(target: "upslink.store", "store_connected");
                conn
            }
            Err(err) => {
                warn!(target: "upslink.store", error = %err, "store_connect_failed");
                return false;
            }
        };
        match load_device_cache(&mut conn).await {
            Ok(entries) => {
                let count = entries.len();
                self.cache.replace_all(entries);
                info!(target: "upslink.store", devices = count, "store_device_cache_loaded");
            }
            Err(err) => {
                warn!(target: "upslink.store", error = %err, "store_device_cache_load_failed");
            }
        }
        *guard = Some(conn);
        true
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// 关闭连接（停机路径）。
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            info!(target: "upslink.store", "store_closed");
        }
    }

    /// 缓存中已知的设备数。
    pub fn cached_device_count(&self) -> usize {
        self.cache.len()
    }

    /// 存储标识 → 数值设备键；缓存优先，未命中时点查补缓存。
    ///
    /// 返回 None 表示标识在库中确实不存在，或重试预算内无法查询。
    pub async fn resolve_device_key(&self, storage_identifier: &str) -> Option<i32> {
        if let Some(key) = self.cache.get(storage_identifier) {
            return Some(key);
        }
        let row = self
            .execute_with_retry("resolve_device_key", |mut conn| {
                let identifier = storage_identifier.to_string();
                async move {
                    let result = sqlx::query(
                        "SELECT device_id FROM ups_devices WHERE device_identifier = $1",
                    )
                    .bind(identifier)
                    .fetch_optional(&mut conn)
                    .await;
                    (conn, result)
                }
            })
            .await??;
        let key: i32 = match row.try_get("device_id") {
            Ok(key) => key,
            Err(err) => {
                warn!(target: "upslink.store", error = %err, "store_device_row_malformed");
                return None;
            }
        };
        self.cache.insert(storage_identifier, key);
        Some(key)
    }

    /// 幂等写入一条指标行。
    ///
    /// (device_id, timestamp) 冲突时按后写覆盖可变指标列，保证同一
    /// 时间点永远只有一行。false 表示这次写入被放弃，数据只存在于
    /// 调用方内存中。
    pub async fn insert_sample(&self, sample: &UpsSample, storage_identifier: &str) -> bool {
        let Some(device_key) = self.resolve_device_key(storage_identifier).await else {
            warn!(
                target: "upslink.store",
                identifier = %storage_identifier,
                "store_device_unknown"
            );
            return false;
        };
        let ts_ms = sample.ts_ms;
        let battery_charge = sample.f64_field("battery_charge");
        let battery_voltage = sample.f64_field("battery_voltage");
        let battery_runtime = sample.i64_field("battery_runtime");
        let battery_low = sample.f64_field("battery_low_charge_threshold");
        let battery_warning = sample.f64_field("battery_warning_charge_threshold");
        let input_voltage = sample.f64_field("input_voltage");
        let input_nominal_voltage = sample.i64_field("input_nominal_voltage");
        let high_voltage_transfer = sample.f64_field("high_voltage_transfer");
        let low_voltage_transfer = sample.f64_field("low_voltage_transfer");
        let input_sensitivity = sample.text_field("input_sensitivity").map(str::to_string);
        let load_percentage = sample.f64_field("load_percentage");
        let load_watts = sample.f64_field("load_watts");
        let ups_status = sample.text_field("ups_status").map(str::to_string);
        let power_failure = sample.bool_field("power_failure");
        let last_transfer_reason = sample.text_field("last_transfer_reason").map(str::to_string);
        let self_test_result = sample.text_field("self_test_result").map(str::to_string);
        let driver_state = sample.text_field("driver_state").map(str::to_string);
        let beeper_status = sample.text_field("beeper_status").map(str::to_string);
        let temperature = sample.f64_field("temperature");
        let output_voltage = sample.f64_field("output_voltage");
        let output_nominal_voltage = sample.i64_field("output_nominal_voltage");

        let written = self
            .execute_with_retry("insert_sample", |mut conn| {
                let input_sensitivity = input_sensitivity.clone();
                let ups_status = ups_status.clone();
                let last_transfer_reason = last_transfer_reason.clone();
                let self_test_result = self_test_result.clone();
                let driver_state = driver_state.clone();
                let beeper_status = beeper_status.clone();
                async move {
                    let result = sqlx::query(INSERT_SAMPLE_SQL)
                        .bind(device_key)
                        .bind(ts_ms as f64)
                        .bind(battery_charge)
                        .bind(battery_voltage)
                        .bind(battery_runtime)
                        .bind(battery_low)
                        .bind(battery_warning)
                        .bind(input_voltage)
                        .bind(input_nominal_voltage)
                        .bind(high_voltage_transfer)
                        .bind(low_voltage_transfer)
                        .bind(input_sensitivity)
                        .bind(load_percentage)
                        .bind(load_watts)
                        .bind(ups_status)
                        .bind(power_failure)
                        .bind(last_transfer_reason)
                        .bind(self_test_result)
                        .bind(driver_state)
                        .bind(beeper_status)
                        .bind(temperature)
                        .bind(output_voltage)
                        .bind(output_nominal_voltage)
                        .execute(&mut conn)
                        .await;
                    (conn, result)
                }
            })
            .await
            .is_some();
        if written {
            info!(
                target: "upslink.store",
                identifier = %storage_identifier,
                ts_ms = ts_ms,
                "store_sample_written"
            );
        }
        written
    }

    /// 追加一条电源事件；每次调用产生一个新行，无冲突处理。
    pub async fn log_event(
        &self,
        device_key: i32,
        event_type: &str,
        battery_level_start: f64,
        battery_level_end: f64,
        load_at_event: f64,
    ) -> bool {
        let logged = self
            .execute_with_retry("log_event", |mut conn| {
                let event_type = event_type.to_string();
                async move {
                    let result = sqlx::query(
                        "INSERT INTO power_events \
                         (device_id, event_type, battery_level_start, battery_level_end, load_at_event) \
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(device_key)
                    .bind(event_type)
                    .bind(battery_level_start)
                    .bind(battery_level_end)
                    .bind(load_at_event)
                    .execute(&mut conn)
                    .await;
                    (conn, result)
                }
            })
            .await
            .is_some();
        if logged {
            info!(
                target: "upslink.store",
                device_id = device_key,
                event_type = %event_type,
                "store_power_event_logged"
            );
        }
        logged
    }

    /// 重试包装：预算内反复尝试一条语句。
    ///
    /// 每次尝试前确保连接存在（缺失则重连，重连失败停顿后消耗这次
    /// 尝试）；操作报出连接断裂类错误时丢弃旧连接并立即重建，再进入
    /// 下一次重试。预算耗尽返回 None，从不升级为进程级错误。
    async fn execute_with_retry<T, F, Fut>(&self, label: &str, operation: F) -> Option<T>
    where
        F: Fn(PgConnection) -> Fut,
        Fut: Future<Output = (PgConnection, Result<T, sqlx::Error>)>,
    {
        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                record_store_retry();
            }
            {
                let mut guard = self.conn.lock().await;
                if guard.is_none() {
                    match PgConnection::connect(&self.database_url).await {
                        Ok(conn) => {
                            record_store_reconnect();
                            info!(target: "upslink.store", "store_reconnected");
                            *guard = Some(conn);
                        }
                        Err(err) => {
                            warn!(
                                target: "upslink.store",
                                operation = label,
                                attempt = attempt,
                                error = %err,
                                "store_reconnect_failed"
                            );
                            drop(guard);
                            tokio::time::sleep(RECONNECT_PAUSE).await;
                            continue;
                        }
                    }
                }
                let Some(conn) = guard.take() else {
                    continue;
                };
                // 语句执行期间连接锁保持持有
                let (conn, result) = operation(conn).await;
                match result {
                    Ok(value) => {
                        *guard = Some(conn);
                        return Some(value);
                    }
                    Err(err) if is_connection_broken(&err) => {
                        drop(conn);
                        warn!(
                            target: "upslink.store",
                            operation = label,
                            attempt = attempt,
                            error = %err,
                            "store_connection_broken"
                        );
                        // 立即重建连接，再进入下一次重试
                        *guard = match PgConnection::connect(&self.database_url).await {
                            Ok(conn) => {
                                record_store_reconnect();
                                info!(target: "upslink.store", "store_reconnected");
                                Some(conn)
                            }
                            Err(reconnect_err) => {
                                warn!(
                                    target: "upslink.store",
                                    error = %reconnect_err,
                                    "store_reconnect_failed"
                                );
                                None
                            }
                        };
                    }
                    Err(err) => {
                        *guard = Some(conn);
                        warn!(
                            target: "upslink.store",
                            operation = label,
                            attempt = attempt,
                            error = %err,
                            "store_operation_failed"
                        );
                    }
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
        warn!(
            target: "upslink.store",
            operation = label,
            attempts = MAX_RETRIES,
            "store_operation_exhausted"
        );
        None
    }
}

const INSERT_SAMPLE_SQL: &str = "INSERT INTO ups_metrics (device_id, timestamp, \
     battery_charge, battery_voltage, battery_runtime, \
     battery_low_charge_threshold, battery_warning_charge_threshold, \
     input_voltage, input_nominal_voltage, \
     high_voltage_transfer, low_voltage_transfer, input_sensitivity, \
     load_percentage, load_watts, ups_status, power_failure, \
     last_transfer_reason, self_test_result, driver_state, \
     beeper_status, temperature, output_voltage, output_nominal_voltage) \
     VALUES ($1, to_timestamp($2 / 1000.0), $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
     $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23) \
     ON CONFLICT (device_id, timestamp) DO UPDATE SET \
     battery_charge = EXCLUDED.battery_charge, \
     battery_voltage = EXCLUDED.battery_voltage, \
     battery_runtime = EXCLUDED.battery_runtime, \
     load_percentage = EXCLUDED.load_percentage, \
     load_watts = EXCLUDED.load_watts, \
     input_voltage = EXCLUDED.input_voltage, \
     ups_status = EXCLUDED.ups_status, \
     power_failure = EXCLUDED.power_failure";

async fn load_device_cache(conn: &mut PgConnection) -> Result<HashMap<String, i32>, sqlx::Error> {
    let rows = sqlx::query("SELECT device_id, device_identifier FROM ups_devices")
        .fetch_all(conn)
        .await?;
    let mut entries = HashMap::with_capacity(rows.len());
    for row in rows {
        let key: i32 = row.try_get("device_id")?;
        let identifier: String = row.try_get("device_identifier")?;
        entries.insert(identifier, key);
    }
    Ok(entries)
}

// 传输层断裂类错误：值得立刻重建连接再试
fn is_connection_broken(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_as_broken_connection() {
        let io = sqlx::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_connection_broken(&io));
        assert!(!is_connection_broken(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn gateway_starts_disconnected() {
        let gateway = StoreGateway::new("postgresql://invalid-host/ups");
        assert!(!gateway.is_connected().await);
        assert_eq!(gateway.cached_device_count(), 0);
    }

    #[test]
    fn upsert_statement_is_idempotent_per_device_and_timestamp() {
        // 幂等性由单条语句承担：冲突键 + 后写覆盖的可变列
        assert!(INSERT_SAMPLE_SQL.contains("ON CONFLICT (device_id, timestamp) DO UPDATE"));
        assert!(INSERT_SAMPLE_SQL.contains("battery_charge = EXCLUDED.battery_charge"));
        assert!(INSERT_SAMPLE_SQL.contains("to_timestamp($2 / 1000.0)"));
    }
}
