//! Integration tests for configuration loading and root folder resolution
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate BIDSFORGE_CONFIG or BIDSFORGE_ROOT_FOLDER are marked
//! with #[serial] to ensure they run sequentially, not in parallel.

use bidsforge_common::config::{
    load_config, resolve_root_folder, TomlConfig, CONFIG_ENV_VAR, ROOT_FOLDER_ENV_VAR,
};
use bidsforge_common::Error;
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
#[serial]
fn test_cli_path_loads_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "root_folder = \"/data/sessions\"\n");

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/data/sessions")));
}

#[test]
#[serial]
fn test_missing_cli_path_is_not_found() {
    let err = load_config(Some(Path::new("/nonexistent/bidsforge.toml"))).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
#[serial]
fn test_env_var_config_path() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[supervisor]\npoll_interval_ms = 250\n");
    env::set_var(CONFIG_ENV_VAR, &path);

    let config = load_config(None).unwrap();
    assert_eq!(config.supervisor.poll_interval_ms, 250);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_root_folder_cli_beats_env_and_toml() {
    env::set_var(ROOT_FOLDER_ENV_VAR, "/from/env");
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };

    let resolved = resolve_root_folder(Some(Path::new("/from/cli")), &config);
    assert_eq!(resolved, PathBuf::from("/from/cli"));

    env::remove_var(ROOT_FOLDER_ENV_VAR);
}

#[test]
#[serial]
fn test_root_folder_env_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV_VAR, "/from/env");
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };

    assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/from/env"));

    env::remove_var(ROOT_FOLDER_ENV_VAR);
}

#[test]
#[serial]
fn test_root_folder_falls_back_to_toml_then_default() {
    env::remove_var(ROOT_FOLDER_ENV_VAR);
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };
    assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/from/toml"));

    let fallback = resolve_root_folder(None, &TomlConfig::default());
    assert!(!fallback.as_os_str().is_empty());
}
