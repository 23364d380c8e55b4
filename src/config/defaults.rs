use super::*;

pub(super) fn modbus_port() -> u16 {
    502
}

pub(super) fn modbus_unit_id() -> u8 {
    1
}

pub(super) fn register_type() -> MeterRegisterType {
    MeterRegisterType::Int16
}

pub(super) fn register_scale() -> f64 {
    1.0
}

pub(super) fn opendtu_user() -> String {
    "admin".to_string()
}

pub(super) fn simulated_house_load() -> i64 {
    350
}

pub(super) fn simulated_solar() -> i64 {
    800
}

pub(super) fn simulated_panel_voltage() -> f64 {
    48.0
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            loop_interval_seconds: 5,
            poll_interval_seconds: 1,
            set_limit_timeout_seconds: 10,
            set_power_status_delay_seconds: 10,
            max_difference_between_limit_and_output_power_percent: 100,
            set_power_status_count: 0,
            slow_approx_limit_percent: 20,
            slow_approx_factor_percent: 20,
            log_temperature: false,
            set_inverter_to_min_on_powermeter_error: false,
            max_retries: 3,
            retry_backoff_factor: 0.1,
            retry_status_codes: vec![500, 502, 503, 504],
        }
    }
}

impl Default for SetpointConfig {
    fn default() -> Self {
        Self {
            target_point: 0,
            tolerance: 25,
            max_point: 100,
            min_point: -50,
            jump_to_limit_percent: 0,
            fast_limit_decrease: false,
        }
    }
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            serial_number: String::new(),
            enabled: true,
            max_watt: 600,
            inverter_watt: None,
            min_watt_percent: 5,
            compensate_watt_factor: 1.0,
            battery_mode: false,
            battery_priority: 1,
            battery_threshold_off_v: 46.0,
            battery_threshold_reduce_v: 47.0,
            battery_threshold_normal_v: 48.0,
            battery_threshold_on_v: 49.0,
            battery_ignore_panels: Vec::new(),
            battery_average_count: 1,
            battery_normal_watt: None,
            battery_reduce_watt: None,
        }
    }
}

impl Default for PowermeterConfig {
    fn default() -> Self {
        PowermeterConfig::Simulated {
            house_load_w: simulated_house_load(),
        }
    }
}

impl Default for DtuConfig {
    fn default() -> Self {
        DtuConfig::Simulated {
            solar_available_w: simulated_solar(),
            panel_voltage_v: simulated_panel_voltage(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/zerofeed.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_capacity: 256,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            setpoint: SetpointConfig::default(),
            inverters: vec![InverterConfig::default()],
            powermeter: PowermeterConfig::default(),
            intermediate_meter: None,
            dtu: DtuConfig::default(),
            logging: LoggingConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}
