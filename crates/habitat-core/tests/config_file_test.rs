//! Config file loading tests.

use std::io::Write;

use habitat_core::config::{BridgeConfig, ConfigError, ProtocolSettings};
use habitat_core::Protocol;

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_json_file() {
    let file = write_temp(
        ".json",
        r#"{
            "adapters": {
                "mock": {"settings": {"protocol": "custom", "name": "mock"}}
            },
            "rate_limiting": {"max_commands_per_device": 2},
            "devices": [
                {"device_id": "D1", "protocol": "mock", "protocol_address": "dev-1"}
            ]
        }"#,
    );

    let config = BridgeConfig::from_file(file.path()).unwrap();
    let mock = config.enabled_adapter(&Protocol::custom("mock")).unwrap();
    assert!(matches!(mock.settings, ProtocolSettings::Custom(_)));
    assert_eq!(config.rate_limiting.max_commands_per_device, 2);
    assert!(config.rate_limiting.enabled);
    assert_eq!(config.devices.len(), 1);
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_toml_file() {
    let file = write_temp(
        ".toml",
        r#"
        [fault_tolerance.circuit_breaker]
        failure_threshold = 2
        recovery_timeout_ms = 500

        [[devices]]
        device_id = "hall_light"
        protocol = "knx"
        protocol_address = "1/1/1"
        "#,
    );

    let config = BridgeConfig::from_file(file.path()).unwrap();
    assert_eq!(config.fault_tolerance.circuit_breaker.failure_threshold, 2);
    assert_eq!(config.fault_tolerance.circuit_breaker.half_open_requests, 3);
    assert_eq!(config.devices[0].protocol, Protocol::Knx);
}

#[test]
fn test_unknown_extension_rejected() {
    let file = write_temp(".yaml", "adapters: {}");
    let err = BridgeConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
}

#[test]
fn test_missing_file() {
    let err = BridgeConfig::from_file("/nonexistent/habitat.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_invalid_json_reported() {
    let file = write_temp(".json", "{ not json");
    let err = BridgeConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Json(_)));
}
