//! Integration tests for configuration parsing
//!
//! Tests driver configuration files, including:
//! - Minimal and full files
//! - Defaults for missing sections
//! - Invalid configuration handling
//! - Save / load through the filesystem

use std::time::Duration;
use tempfile::tempdir;
use xserve_fp::DriverConfig;

const FULL_CONFIG: &str = r#"
[driver]
log_level = "debug"
minor_base = 200
max_devices = 4

[monitor]
enabled = true
poll_interval_ms = 500
event_backlog = 64
"#;

mod parsing {
    use super::*;

    #[test]
    fn test_full_config() {
        let config: DriverConfig = toml::from_str(FULL_CONFIG).unwrap();

        assert_eq!(config.driver.log_level, "debug");
        assert_eq!(config.driver.minor_base, 200);
        assert_eq!(config.driver.max_devices, 4);
        assert!(config.monitor.enabled);
        assert_eq!(config.monitor.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.monitor.event_backlog, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: DriverConfig = toml::from_str("").unwrap();
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn test_partial_section() {
        let config: DriverConfig = toml::from_str("[driver]\nmax_devices = 2\n").unwrap();
        assert_eq!(config.driver.max_devices, 2);
        assert_eq!(config.driver.minor_base, 192);
        assert_eq!(config.driver.log_level, "info");
    }

    #[test]
    fn test_wrong_type_rejected() {
        let result: Result<DriverConfig, _> = toml::from_str("[monitor]\nenabled = \"yes\"\n");
        assert!(result.is_err());
    }
}

mod files {
    use super::*;

    #[test]
    fn test_load_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let config = DriverConfig::load(Some(path)).unwrap();
        assert_eq!(config.driver.minor_base, 200);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("driver.toml");

        let mut config = DriverConfig::default();
        config.monitor.event_backlog = 8;
        config.driver.log_level = "warn".to_string();
        config.save(&path).unwrap();

        assert_eq!(DriverConfig::load(Some(path)).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        let result = DriverConfig::load(Some(dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values_rejected_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        std::fs::write(&path, "[monitor]\nevent_backlog = 0\n").unwrap();

        let err = DriverConfig::load(Some(path)).unwrap_err();
        assert!(err.to_string().contains("event_backlog"));
    }

    #[test]
    fn test_malformed_file_names_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        std::fs::write(&path, "[driver\n").unwrap();

        let err = DriverConfig::load(Some(path.clone())).unwrap_err();
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn test_default_path_location() {
        let path = DriverConfig::default_path();
        assert!(path.ends_with("xserve-fp/driver.toml"));
    }
}
