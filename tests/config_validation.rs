//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use mx_ether::config::{EngineConfig, LoggingConfig, MxConfig, NicConfig};
use mx_ether::core::packet::MacAddr;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = MxConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_mac_address() {
    let mut config = MxConfig::default();
    config.nic.mac = "02:00:00:00:00".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid MAC address")));
}

#[test]
fn test_broadcast_mac_rejected() {
    let nic = NicConfig {
        mac: "ff:ff:ff:ff:ff:ff".to_string(),
        ..NicConfig::default()
    };
    let errors = nic.validate();
    assert!(errors.iter().any(|e| e.contains("broadcast")));
}

#[test]
fn test_mac_parses() {
    let nic = NicConfig::default();
    assert_eq!(nic.mac_addr().expect("default MAC"), MacAddr([2, 0, 0, 0, 0, 1]));
}

#[test]
fn test_empty_hostname() {
    let mut config = MxConfig::default();
    config.nic.hostname = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Hostname cannot be empty")));
}

#[test]
fn test_mtu_bounds() {
    let mut config = MxConfig::default();
    config.nic.mtu = 1000;
    assert!(config.validate().iter().any(|e| e.contains("MTU too small")));

    config.nic.mtu = 70_000;
    assert!(config.validate().iter().any(|e| e.contains("MTU too large")));
}

#[test]
fn test_payloads_must_fit_mtu() {
    let mut config = MxConfig::default();
    config.nic.mtu = 1500;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Medium fragment")));
    assert!(errors.iter().any(|e| e.contains("Pull reply")));

    config.engine.medium_frag_size = 1400;
    config.engine.max_reply_payload = 1400;
    assert!(config.validate().is_empty());
}

#[test]
fn test_small_message_must_fit_mtu() {
    let mut config = MxConfig::default();
    config.nic.mtu = 1500;
    config.engine.medium_frag_size = 1400;
    config.engine.max_reply_payload = 1400;
    config.engine.small_max = 4000;

    let errors = config.validate();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("Small message of 4000 bytes"));

    // Header plus payload exactly filling the MTU is accepted.
    config.engine.small_max = 1500 - 22;
    assert!(config.validate().is_empty());
    config.engine.small_max += 1;
    assert!(!config.validate().is_empty());
}

#[test]
fn test_size_classes_must_be_ordered() {
    let engine = EngineConfig {
        tiny_max: 256,
        small_max: 128,
        ..EngineConfig::default()
    };
    assert!(!engine.validate().is_empty());
}

#[test]
fn test_pull_chunk_not_below_reply_payload() {
    let engine = EngineConfig {
        max_pull_chunk: 1024,
        max_reply_payload: 4096,
        ..EngineConfig::default()
    };
    assert!(!engine.validate().is_empty());

    let engine = EngineConfig {
        max_pull_chunk: 0,
        ..EngineConfig::default()
    };
    assert!(!engine.validate().is_empty());
}

#[test]
fn test_pull_contexts_bounded() {
    let engine = EngineConfig {
        max_pull_contexts: 0,
        ..EngineConfig::default()
    };
    assert!(!engine.validate().is_empty());

    let engine = EngineConfig {
        max_pull_contexts: (1 << 16) + 1,
        ..EngineConfig::default()
    };
    assert!(!engine.validate().is_empty());
}

#[test]
fn test_timeouts() {
    let engine = EngineConfig {
        pull_timeout: Duration::from_millis(1),
        ..EngineConfig::default()
    };
    assert!(engine
        .validate()
        .iter()
        .any(|e| e.contains("Pull timeout too short")));

    let engine = EngineConfig {
        notify_timeout: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    assert!(engine.validate().iter().any(|e| e.contains("Notify timeout")));

    let engine = EngineConfig {
        timeout_tick: Duration::ZERO,
        ..EngineConfig::default()
    };
    assert!(engine.validate().iter().any(|e| e.contains("Timeout tick")));
}

#[test]
fn test_empty_app_name() {
    let logging = LoggingConfig {
        app_name: String::new(),
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_bad_subsystem_level() {
    let mut logging = LoggingConfig::default();
    logging
        .subsystem_levels
        .insert("mx::pull".to_string(), "loud".to_string());
    assert!(logging.validate().iter().any(|e| e.contains("mx::pull")));
}

#[test]
fn test_log_to_file_without_path() {
    let logging = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_multiple_errors_collected() {
    let mut config = MxConfig::default();
    config.nic.hostname = String::new();
    config.nic.max_endpoints = 0;
    config.engine.medium_frag_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors.len() >= 4, "expected several errors, got {errors:?}");
}

#[test]
fn test_validate_strict_returns_error() {
    let mut config = MxConfig::default();
    config.nic.max_regions = 0;
    let err = config.validate_strict().expect_err("should fail");
    assert!(err.to_string().contains("Max regions"));
}

#[test]
fn test_toml_round_trip() {
    let mut config = MxConfig::default();
    config.nic.hostname = "compute-7".to_string();
    config.engine.pull_timeout = Duration::from_millis(750);
    config.logging.log_level = Level::DEBUG;

    let text = toml::to_string_pretty(&config).expect("serialize");
    assert!(text.contains("pull_timeout = 750"));
    let parsed = MxConfig::from_toml(&text).expect("parse");
    assert_eq!(parsed.nic.hostname, "compute-7");
    assert_eq!(parsed.engine.pull_timeout, Duration::from_millis(750));
    assert_eq!(parsed.logging.log_level, Level::DEBUG);
}

#[test]
fn test_parsed_config_still_needs_validation() {
    let text = MxConfig::example_config().replace("mtu = 9000", "mtu = 10");
    let parsed = MxConfig::from_toml(&text).expect("well-formed TOML parses");
    assert!(parsed.validate_strict().is_err());
    assert!(MxConfig::from_toml("[nic]\nmtu = \"big\"").is_err());
}

#[test]
fn test_save_and_load() {
    let path = std::env::temp_dir().join(format!("mx-ether-config-{}.toml", std::process::id()));
    let config = MxConfig::default_with_overrides(|c| c.nic.app_key = 42);
    config.save_to_file(&path).expect("save");
    let loaded = MxConfig::from_file(&path).expect("load");
    assert_eq!(loaded.nic.app_key, 42);
    std::fs::remove_file(&path).ok();
}
