use upslink_config::AppConfig;

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("UPSLINK_DATABASE_URL", "postgresql://ups:pw@localhost/ups");
        std::env::set_var("UPSLINK_HTTP_ADDR", "127.0.0.1:8893");
        std::env::set_var("UPSLINK_POLL_INTERVAL_SECONDS", "30");
        std::env::set_var("UPSLINK_NOMINAL_POWER_WATTS", "900");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.http_addr, "127.0.0.1:8893");
    assert_eq!(config.poll_interval_seconds, 30);
    assert_eq!(config.save_interval_seconds, 3600);
    assert_eq!(config.nominal_power_watts, 900.0);
    assert_eq!(config.discovery_prefix, "homeassistant");
}
