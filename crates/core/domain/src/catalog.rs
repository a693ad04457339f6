//! 字段目录：全部已知 UPS 指标的静态描述表。
//!
//! 解析、合并别名、总线投影、发现公告元数据与落库列选择
//! 都由这张表驱动，新增指标只需要追加一行。

/// 字段值的解析类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Float,
    Int,
    Bool,
    Text,
}

/// 发现公告中的传感器类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Sensor,
    BinarySensor,
}

/// 单个指标的静态描述。
pub struct FieldSpec {
    /// 总线上使用的字段名（state 主题段）。
    pub name: &'static str,
    pub kind: FieldKind,
    /// 硬件源变量名；派生字段（load_watts、power_failure）为 None。
    pub source_var: Option<&'static str>,
    /// 合并时额外接受的字段名（不同上游命名习惯）。
    pub aliases: &'static [&'static str],
    /// 是否落库为 ups_metrics 列（列名与字段名一致）。
    pub stored: bool,
    pub sensor: SensorKind,
    pub display_name: &'static str,
    pub unit: &'static str,
    pub device_class: &'static str,
    pub state_class: &'static str,
    pub icon: &'static str,
}

/// 全部已知字段。顺序即投影与落库的绑定顺序。
pub const FIELD_SPECS: &[FieldSpec] = &[
    // 电池指标
    FieldSpec {
        name: "battery_charge",
        kind: FieldKind::Float,
        source_var: Some("battery.charge"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Battery Charge",
        unit: "%",
        device_class: "battery",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "battery_voltage",
        kind: FieldKind::Float,
        source_var: Some("battery.voltage"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Battery Voltage",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "battery_runtime",
        kind: FieldKind::Int,
        source_var: Some("battery.runtime"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Battery Runtime",
        unit: "min",
        device_class: "duration",
        state_class: "measurement",
        icon: "mdi:timer-outline",
    },
    FieldSpec {
        name: "battery_nominal_voltage",
        kind: FieldKind::Float,
        source_var: Some("battery.voltage.nominal"),
        aliases: &["battery_voltage_nominal"],
        stored: false,
        sensor: SensorKind::Sensor,
        display_name: "Battery Nominal Voltage",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "battery_low_charge_threshold",
        kind: FieldKind::Float,
        source_var: Some("battery.charge.low"),
        aliases: &["battery_charge_low"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Battery Low Charge Threshold",
        unit: "%",
        device_class: "battery",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "battery_warning_charge_threshold",
        kind: FieldKind::Float,
        source_var: Some("battery.charge.warning"),
        aliases: &["battery_charge_warning"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Battery Warning Charge Threshold",
        unit: "%",
        device_class: "battery",
        state_class: "measurement",
        icon: "",
    },
    // 输入指标
    FieldSpec {
        name: "input_voltage",
        kind: FieldKind::Float,
        source_var: Some("input.voltage"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Input Voltage",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "input_nominal_voltage",
        kind: FieldKind::Int,
        source_var: Some("input.voltage.nominal"),
        aliases: &["input_voltage_nominal"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Input Nominal Voltage",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "high_voltage_transfer",
        kind: FieldKind::Float,
        source_var: Some("input.transfer.high"),
        aliases: &["input_transfer_high"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "High Voltage Transfer",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "low_voltage_transfer",
        kind: FieldKind::Float,
        source_var: Some("input.transfer.low"),
        aliases: &["input_transfer_low"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Low Voltage Transfer",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "input_sensitivity",
        kind: FieldKind::Text,
        source_var: Some("input.sensitivity"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Input Sensitivity",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:tune",
    },
    FieldSpec {
        name: "last_transfer_reason",
        kind: FieldKind::Text,
        source_var: Some("input.transfer.reason"),
        aliases: &["input_transfer_reason"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Last Transfer Reason",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:information-outline",
    },
    // 负载与状态
    FieldSpec {
        name: "load_percentage",
        kind: FieldKind::Float,
        source_var: Some("ups.load"),
        aliases: &["load_percent"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Load",
        unit: "%",
        device_class: "power_factor",
        state_class: "measurement",
        icon: "mdi:gauge",
    },
    FieldSpec {
        name: "load_watts",
        kind: FieldKind::Float,
        source_var: None,
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Load Power",
        unit: "W",
        device_class: "power",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "ups_status",
        kind: FieldKind::Text,
        source_var: Some("ups.status"),
        aliases: &["status"],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "UPS Status",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:information",
    },
    FieldSpec {
        name: "power_failure",
        kind: FieldKind::Bool,
        source_var: None,
        aliases: &[],
        stored: true,
        sensor: SensorKind::BinarySensor,
        display_name: "Power Failure",
        unit: "",
        device_class: "power",
        state_class: "",
        icon: "mdi:power-plug-off",
    },
    // UPS 信息
    FieldSpec {
        name: "ups_nominal_power",
        kind: FieldKind::Float,
        source_var: Some("ups.realpower.nominal"),
        aliases: &[],
        stored: false,
        sensor: SensorKind::Sensor,
        display_name: "Nominal Power",
        unit: "W",
        device_class: "power",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "beeper_status",
        kind: FieldKind::Text,
        source_var: Some("ups.beeper.status"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Beeper Status",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:volume-high",
    },
    FieldSpec {
        name: "self_test_result",
        kind: FieldKind::Text,
        source_var: Some("ups.test.result"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Self Test Result",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:clipboard-check",
    },
    FieldSpec {
        name: "firmware_version",
        kind: FieldKind::Text,
        source_var: Some("ups.firmware"),
        aliases: &[],
        stored: false,
        sensor: SensorKind::Sensor,
        display_name: "Firmware Version",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:chip",
    },
    // 驱动信息
    FieldSpec {
        name: "driver_name",
        kind: FieldKind::Text,
        source_var: Some("driver.name"),
        aliases: &[],
        stored: false,
        sensor: SensorKind::Sensor,
        display_name: "Driver Name",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:application",
    },
    FieldSpec {
        name: "driver_version",
        kind: FieldKind::Text,
        source_var: Some("driver.version"),
        aliases: &[],
        stored: false,
        sensor: SensorKind::Sensor,
        display_name: "Driver Version",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:tag",
    },
    FieldSpec {
        name: "driver_state",
        kind: FieldKind::Text,
        source_var: Some("driver.state"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Driver State",
        unit: "",
        device_class: "",
        state_class: "",
        icon: "mdi:state-machine",
    },
    // 温度与输出
    FieldSpec {
        name: "temperature",
        kind: FieldKind::Float,
        source_var: Some("ups.temperature"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Temperature",
        unit: "°C",
        device_class: "temperature",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "output_voltage",
        kind: FieldKind::Float,
        source_var: Some("output.voltage"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Output Voltage",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
    FieldSpec {
        name: "output_nominal_voltage",
        kind: FieldKind::Int,
        source_var: Some("output.voltage.nominal"),
        aliases: &[],
        stored: true,
        sensor: SensorKind::Sensor,
        display_name: "Output Nominal Voltage",
        unit: "V",
        device_class: "voltage",
        state_class: "measurement",
        icon: "",
    },
];

/// 按字段名或别名查找目录项。
pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    FIELD_SPECS
        .iter()
        .find(|spec| spec.name == name || spec.aliases.contains(&name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_alias() {
        assert_eq!(field_spec("battery_charge").map(|s| s.name), Some("battery_charge"));
        assert_eq!(field_spec("load_percent").map(|s| s.name), Some("load_percentage"));
        assert_eq!(field_spec("status").map(|s| s.name), Some("ups_status"));
        assert!(field_spec("no_such_field").is_none());
    }

    #[test]
    fn stored_columns_match_metrics_table() {
        let stored: Vec<&str> = FIELD_SPECS
            .iter()
            .filter(|spec| spec.stored)
            .map(|spec| spec.name)
            .collect();
        assert_eq!(stored.len(), 21);
        assert!(stored.contains(&"ups_status"));
        assert!(!stored.contains(&"firmware_version"));
        assert!(!stored.contains(&"driver_name"));
    }
}
