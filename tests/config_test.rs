//! Configuration loading from files and environment overrides.

use ghz_bringup::LvdsPolicy;
use ghz_fpga::config::{GhzConfig, TransportMode};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = GhzConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, GhzConfig::default());
}

#[test]
#[serial]
fn test_partial_file_keeps_other_defaults() {
    let file = write_config(
        r#"
        [group]
        name = "Qubits"

        [bringup]
        lvds_policy = "gating"
        fifo_tries = 4

        [[emulator.dacs]]
        number = 3
        build = 12
        "#,
    );
    let config = GhzConfig::load_from(file.path()).unwrap();
    assert_eq!(config.group.name, "Qubits");
    assert_eq!(config.bringup.lvds_policy, LvdsPolicy::Gating);
    assert_eq!(config.bringup.fifo_tries, 4);
    assert_eq!(config.bringup.board_retries, 2);
    assert_eq!(config.emulator.dacs.len(), 1);
    assert_eq!(config.emulator.dacs[0].build, 12);
    assert_eq!(config.transport.mode, TransportMode::Emulated);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(
        r#"
        [application]
        log_level = "info"
        "#,
    );
    std::env::set_var("GHZ_FPGA_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("GHZ_FPGA_TRANSPORT__MODE", "relay");
    let result = GhzConfig::load_from(file.path());
    std::env::remove_var("GHZ_FPGA_APPLICATION__LOG_LEVEL");
    std::env::remove_var("GHZ_FPGA_TRANSPORT__MODE");

    let config = result.unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.transport.mode, TransportMode::Relay);
}

#[test]
#[serial]
fn test_bad_value_is_a_load_error() {
    let file = write_config(
        r#"
        [transport]
        mode = "carrier-pigeon"
        "#,
    );
    assert!(GhzConfig::load_from(file.path()).is_err());
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/ghz-fpga.toml");
    let config = GhzConfig::load_from(path).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.emulator.dacs.len(), 2);
}
