use serde_json::json;
use zerofeed::devices::http_meter::{ValueSource, extract_watts};
use zerofeed::devices::modbus_meter::{RegisterType, decode_register_watts};
use zerofeed::devices::opendtu::{MIN_VERSION, parse_version, relative_limit};

#[test]
fn int16_register_is_signed() {
    assert_eq!(decode_register_watts(&[0xFF38], RegisterType::Int16, 1.0).unwrap(), -200);
    assert_eq!(decode_register_watts(&[0xFF38], RegisterType::Uint16, 1.0).unwrap(), 65336);
}

#[test]
fn int32_register_is_low_word_first() {
    // -70000 = 0xFFFE_EE90
    let regs = [0xEE90u16, 0xFFFEu16];
    assert_eq!(decode_register_watts(&regs, RegisterType::Int32, 1.0).unwrap(), -70000);
    assert_eq!(decode_register_watts(&[1500, 0], RegisterType::Int32, 0.1).unwrap(), 150);
}

#[test]
fn short_or_nonsense_reads_fail() {
    assert!(decode_register_watts(&[1], RegisterType::Int32, 1.0).is_err());
    assert!(decode_register_watts(&[], RegisterType::Int16, 1.0).is_err());
    assert!(decode_register_watts(&[1], RegisterType::Int16, f64::NAN).is_err());
}

#[test]
fn http_power_pointer_accepts_numbers_and_strings() {
    let source = ValueSource::from_pointers(Some("/StatusSNS/ENERGY/Power"), None, None).unwrap();
    let doc = json!({"StatusSNS": {"ENERGY": {"Power": 412.7}}});
    assert_eq!(extract_watts(&doc, &source).unwrap(), 412);

    let doc = json!({"StatusSNS": {"ENERGY": {"Power": " -35 "}}});
    assert_eq!(extract_watts(&doc, &source).unwrap(), -35);
}

#[test]
fn http_import_minus_export() {
    let source =
        ValueSource::from_pointers(None, Some("/import"), Some("/export")).unwrap();
    let doc = json!({"import": 120, "export": 480});
    assert_eq!(extract_watts(&doc, &source).unwrap(), -360);
}

#[test]
fn http_missing_or_invalid_value_fails() {
    let source = ValueSource::from_pointers(Some("/power"), None, None).unwrap();
    let err = extract_watts(&json!({"other": 1}), &source).unwrap_err();
    assert!(err.is_transient());
    assert!(extract_watts(&json!({"power": [1]}), &source).is_err());
    assert!(ValueSource::from_pointers(Some("/a"), Some("/b"), None).is_err());
    assert!(ValueSource::from_pointers(None, None, None).is_err());
}

#[test]
fn opendtu_helpers() {
    assert!(parse_version("v24.2.12").unwrap() >= MIN_VERSION);
    assert!(parse_version("v23.12.24").unwrap() < MIN_VERSION);
    assert_eq!(relative_limit(400, 1600), 25);
}
