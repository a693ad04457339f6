//! upslink-bridge：NUT UPS ↔ MQTT ↔ PostgreSQL 桥接服务。
//!
//! 装配顺序：配置 → 设备映射 → 存储网关 → 总线客户端 → 轮询服务 →
//! 采集聚合 → 健康检查端点。任一外部系统初次连接失败都不退出进程，
//! 各组件用自己的重连/退避继续运行（部分降级优于整体终止）。

use api_contract::{BridgeComponents, BridgeStatus, ComponentHealth, MetricsDto};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use upslink_bus::{Bus, BusClient, BusConfig};
use upslink_collector::{Collector, CollectorConfig, StoreSampleSink};
use upslink_config::{AppConfig, DeviceMap};
use upslink_poller::{PollerConfig, PollerService, UpscCommandSource};
use upslink_store::StoreGateway;
use upslink_telemetry::{init_tracing, metrics};

const SERVICE_NAME: &str = "upslink";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
struct AppState {
    bus: Arc<BusClient>,
    store: Arc<StoreGateway>,
    poller: Arc<PollerService>,
    collector: Arc<Collector>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置；配置不可用是唯一的启动致命错误
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();
    info!(
        target: "upslink",
        version = SERVICE_VERSION,
        nut_ups = %config.nut_ups_name,
        mqtt = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        poll_interval_s = config.poll_interval_seconds,
        save_interval_s = config.save_interval_seconds,
        "upslink_starting"
    );

    // 设备映射表：启动时构建一次，之后只读共享
    let devices = Arc::new(DeviceMap::from_env(&config.nut_device_id)?);
    for device_id in devices.device_ids() {
        info!(
            target: "upslink",
            device = %device_id,
            identifier = %devices.db_identifier(device_id),
            name = %devices.display_name(device_id),
            "device_configured"
        );
    }

    // 存储网关：进程级单实例，显式注入到所有使用方
    let store = Arc::new(StoreGateway::new(config.database_url.clone()));
    if !store.initialize().await {
        warn!(target: "upslink", "store_initial_connect_failed_will_retry_on_demand");
    }

    // 总线客户端：启动事件循环并做一次有上限的首连等待
    let bus_client = Arc::new(BusClient::new(&BusConfig {
        host: config.mqtt_host.clone(),
        port: config.mqtt_port,
        username: config.mqtt_username.clone(),
        password: config.mqtt_password.clone(),
        client_id: config.mqtt_client_id.clone(),
    }));
    if !bus_client.connect().await {
        warn!(target: "upslink", "bus_initial_connect_failed_transport_keeps_retrying");
    }
    let bus: Arc<dyn Bus> = bus_client.clone();

    // 轮询服务：硬件源 → 样本 → 总线
    let source = Box::new(UpscCommandSource::new(config.nut_ups_name.clone()));
    let poller = Arc::new(PollerService::new(
        Arc::clone(&bus),
        source,
        PollerConfig {
            device_id: config.nut_device_id.clone(),
            device_name: config.nut_device_name.clone(),
            discovery_prefix: config.discovery_prefix.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            nominal_power_watts: config.nominal_power_watts,
        },
    ));
    poller.start();

    // 采集聚合：总线 → 样本合并 → 存储
    let sink = Arc::new(StoreSampleSink::new(Arc::clone(&store)));
    let collector = Arc::new(Collector::new(
        sink,
        Arc::clone(&devices),
        CollectorConfig {
            discovery_prefix: config.discovery_prefix.clone(),
            save_interval: Duration::from_secs(config.save_interval_seconds),
            nominal_power_watts: config.nominal_power_watts,
        },
    ));
    collector.setup_subscriptions(&bus);
    collector.start();

    // 健康检查 / 指标端点
    let state = AppState {
        bus: Arc::clone(&bus_client),
        store: Arc::clone(&store),
        poller: Arc::clone(&poller),
        collector: Arc::clone(&collector),
    };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(target: "upslink", addr = %config.http_addr, "upslink_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 有序停机：先停采集（含最后一轮刷盘），再停轮询，最后关存储
    info!(target: "upslink", "upslink_stopping");
    collector.stop().await;
    poller.stop().await;
    store.close().await;
    info!(target: "upslink", "upslink_stopped");
    Ok(())
}

async fn health(State(state): State<AppState>) -> Response {
    let status = build_status(
        state.bus.is_connected(),
        state.store.is_connected().await,
        state.poller.is_running(),
        state.collector.is_running(),
        state.poller.last_poll_ms(),
        state.collector.last_save_ms(),
        state.collector.device_count(),
    );
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

async fn get_metrics() -> Response {
    let snapshot = metrics().snapshot();
    (
        StatusCode::OK,
        Json(MetricsDto {
            polls_completed: snapshot.polls_completed,
            polls_skipped: snapshot.polls_skipped,
            source_reconnects: snapshot.source_reconnects,
            bus_publish_failures: snapshot.bus_publish_failures,
            discovery_publishes: snapshot.discovery_publishes,
            fields_merged: snapshot.fields_merged,
            dropped_topic_shape: snapshot.dropped_topic_shape,
            samples_saved: snapshot.samples_saved,
            saves_skipped_invalid: snapshot.saves_skipped_invalid,
            save_failures: snapshot.save_failures,
            store_retries: snapshot.store_retries,
            store_reconnects: snapshot.store_reconnects,
            power_events_logged: snapshot.power_events_logged,
        }),
    )
        .into_response()
}

fn build_status(
    bus_connected: bool,
    store_connected: bool,
    poller_running: bool,
    collector_running: bool,
    last_poll_ms: Option<i64>,
    last_save_ms: Option<i64>,
    devices_monitored: usize,
) -> BridgeStatus {
    let components = BridgeComponents {
        mqtt: ComponentHealth::connected(bus_connected),
        database: ComponentHealth::connected(store_connected),
        poller: ComponentHealth::running(poller_running),
        collector: ComponentHealth::running(collector_running),
    };
    let healthy = components.mqtt.is_up()
        && components.database.is_up()
        && components.poller.is_up()
        && components.collector.is_up();
    BridgeStatus {
        service: SERVICE_NAME,
        version: SERVICE_VERSION,
        status: if healthy { "healthy" } else { "degraded" },
        components,
        last_poll_ms,
        last_save_ms,
        devices_monitored,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target: "upslink", "shutdown_signal_received");
}
