use std::fs;
use std::time::{Duration, SystemTime};
use zerofeed::config::{
    Config, ConfigProvider, DtuConfig, FileConfigProvider, MeterRegisterType, PowermeterConfig,
};

fn touch_later(path: &std::path::Path, secs: u64) {
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .unwrap();
}

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("zerofeed.yaml");

    let mut cfg = Config::default();
    cfg.setpoint.target_point = -30;
    cfg.inverters[0].serial_number = "114182912345".to_string();
    cfg.dtu = DtuConfig::OpenDtu {
        ip: "192.168.1.20".to_string(),
        user: "admin".to_string(),
        password: "secret".to_string(),
    };

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.setpoint.target_point, -30);
    assert_eq!(loaded.inverters[0].serial_number, "114182912345");
    assert!(matches!(loaded.dtu, DtuConfig::OpenDtu { ref ip, .. } if ip == "192.168.1.20"));
}

#[test]
fn partial_yaml_fills_defaults() {
    let yaml = r#"
setpoint:
  target_point: 10
inverters:
  - serial_number: "1161"
    max_watt: 400
    inverter_watt: 800
powermeter:
  type: modbus_tcp
  ip: 192.168.1.30
  register: 19026
  register_type: int32
"#;
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), yaml).unwrap();
    let cfg = Config::from_file(tmp.path()).unwrap();

    assert_eq!(cfg.setpoint.target_point, 10);
    assert_eq!(cfg.setpoint.tolerance, 25);
    assert_eq!(cfg.inverters[0].rated_watt(), 800);
    assert_eq!(cfg.inverters[0].min_watt_percent, 5);
    match cfg.powermeter {
        PowermeterConfig::ModbusTcp {
            port,
            unit_id,
            register_type,
            ..
        } => {
            assert_eq!(port, 502);
            assert_eq!(unit_id, 1);
            assert_eq!(register_type, MeterRegisterType::Int32);
        }
        other => panic!("unexpected meter {:?}", other),
    }
    assert!(cfg.validate().is_ok());
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    cfg.control.poll_interval_seconds = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.control.poll_interval_seconds = 10;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.inverters.clear();
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.inverters[0].battery_priority = 6;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.inverters[0].battery_mode = true;
    cfg.inverters[0].battery_threshold_reduce_v = 45.0;
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("inverters[0]"));
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"setpoint: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("Serialization error"));
}

#[test]
fn load_explicit_path() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let missing = tmp_dir.path().join("missing.yaml");
    assert!(Config::load(Some(missing.to_str().unwrap())).is_err());

    let path = tmp_dir.path().join("present.yaml");
    Config::default().save_to_file(&path).unwrap();
    let (cfg, found) = Config::load(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(found.as_deref(), Some(path.as_path()));
    assert_eq!(cfg.inverters.len(), 1);
}

#[test]
fn file_provider_picks_up_changes() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("zerofeed.yaml");
    let mut cfg = Config::default();
    cfg.save_to_file(&path).unwrap();

    let mut provider = FileConfigProvider::new(&path, &cfg);
    provider.update();
    assert_eq!(provider.target_point(), 0);

    cfg.setpoint.target_point = -40;
    cfg.inverters[0].min_watt_percent = 12;
    cfg.inverters[0].battery_reduce_watt = Some(150);
    cfg.save_to_file(&path).unwrap();
    touch_later(&path, 10);

    provider.update();
    assert_eq!(provider.target_point(), -40);
    assert_eq!(provider.min_watt_percent(0), 12);
    assert_eq!(provider.reduce_watt(0), 150);
}

#[test]
fn file_provider_keeps_values_on_bad_file() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("zerofeed.yaml");
    let mut cfg = Config::default();
    cfg.setpoint.tolerance = 40;
    cfg.save_to_file(&path).unwrap();
    let mut provider = FileConfigProvider::new(&path, &cfg);

    fs::write(&path, "setpoint: [broken").unwrap();
    touch_later(&path, 10);
    provider.update();
    assert_eq!(provider.tolerance(), 40);

    // a valid file with a different inverter count needs a restart
    let mut grown = cfg.clone();
    grown.inverters.push(Default::default());
    grown.setpoint.tolerance = 80;
    grown.save_to_file(&path).unwrap();
    touch_later(&path, 20);
    provider.update();
    assert_eq!(provider.tolerance(), 40);

    grown.inverters.truncate(1);
    grown.save_to_file(&path).unwrap();
    touch_later(&path, 30);
    provider.update();
    assert_eq!(provider.tolerance(), 80);
}

#[test]
fn sample_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/zerofeed.sample.yaml");
    let cfg = Config::from_file(path).unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.inverters.len(), 2);
    assert!(cfg.inverters[1].battery_mode);
    assert!(matches!(cfg.dtu, DtuConfig::OpenDtu { .. }));
    assert!(cfg.intermediate_meter.is_none());
}

#[test]
fn retry_settings_and_ahoy_gateway() {
    let yaml = r#"
control:
  max_retries: 5
  retry_backoff_factor: 0.5
  retry_status_codes: [502, 503]
dtu:
  type: ahoy
  ip: 192.168.1.21
"#;
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), yaml).unwrap();
    let cfg = Config::from_file(tmp.path()).unwrap();

    assert_eq!(cfg.control.max_retries, 5);
    assert_eq!(cfg.control.retry_status_codes, vec![502, 503]);
    assert!(matches!(
        cfg.dtu,
        DtuConfig::Ahoy { ref ip, ref password } if ip == "192.168.1.21" && password.is_empty()
    ));
    assert!(cfg.validate().is_ok());

    let defaults = Config::default();
    assert_eq!(defaults.control.max_retries, 3);
    assert_eq!(defaults.control.retry_status_codes, vec![500, 502, 503, 504]);

    let mut bad = Config::default();
    bad.control.retry_backoff_factor = -0.1;
    let err = bad.validate().unwrap_err();
    assert!(err.to_string().contains("retry_backoff_factor"));
}
