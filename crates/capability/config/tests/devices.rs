use std::collections::HashMap;
use upslink_config::DeviceMap;

fn map_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn explicit_mapping_round_trips() {
    let devices = DeviceMap::new(
        vec!["apc_ups".to_string()],
        map_of(&[("apc_ups", "server-room-ups")]),
        map_of(&[("apc_ups", "Server Room UPS")]),
    );
    assert!(devices.is_known("apc_ups"));
    assert_eq!(devices.db_identifier("apc_ups"), "server-room-ups");
    assert_eq!(devices.wire_id("server-room-ups"), "apc_ups");
    assert_eq!(devices.display_name("apc_ups"), "Server Room UPS");
}

#[test]
fn unmapped_device_falls_back_to_identity() {
    let devices = DeviceMap::new(
        vec!["rack_ups".to_string()],
        HashMap::new(),
        HashMap::new(),
    );
    assert_eq!(devices.db_identifier("rack_ups"), "rack_ups");
    assert_eq!(devices.wire_id("rack_ups"), "rack_ups");
    // 显示名由设备键派生
    assert_eq!(devices.display_name("rack_ups"), "Rack ups");
    assert!(!devices.is_known("other_ups"));
}

#[test]
fn env_parsing_builds_device_list() {
    unsafe {
        std::env::set_var("UPSLINK_DEVICE_IDS", "apc_ups, rack_ups");
        std::env::set_var("UPSLINK_DEVICE_DB_MAPPING", r#"{"apc_ups":"ups-1"}"#);
        std::env::remove_var("UPSLINK_DEVICE_NAMES");
    }
    let devices = DeviceMap::from_env("ignored").expect("device map");
    assert_eq!(devices.device_ids(), ["apc_ups", "rack_ups"]);
    assert_eq!(devices.db_identifier("apc_ups"), "ups-1");
    assert_eq!(devices.db_identifier("rack_ups"), "rack_ups");
}
