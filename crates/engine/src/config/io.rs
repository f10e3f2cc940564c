//! Configuration file loading.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use polystep_util::config_path_from_env;

use super::{EngineConfig, validate_config};

/// Environment override for the configuration file location.
pub const CONFIG_PATH_ENV: &str = "POLYSTEP_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "polystep.yaml";

/// Picks the config file: explicit path, then `POLYSTEP_CONFIG_PATH`, then
/// `./polystep.yaml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    config_path_from_env(CONFIG_PATH_ENV).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Loads the configuration from the resolved path.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let path = resolve_config_path(explicit);
    if explicit.is_some() && !path.exists() {
        anyhow::bail!("Config file {} does not exist", path.display());
    }
    load_config_from_path(&path)
}

/// Loads, path-resolves and validates a config file. A missing file yields
/// the default configuration.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut config = parse_config(path, &content)?;
    let base_dir = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    config.resolve_paths(base_dir.unwrap_or_else(|| Path::new(".")));
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(path: &Path, content: &str) -> anyhow::Result<EngineConfig> {
    let is_json = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    let config = if is_json {
        serde_json::from_str(content).with_context(|| format!("Invalid JSON config {}", path.display()))?
    } else {
        serde_yaml::from_str(content).with_context(|| format!("Invalid YAML config {}", path.display()))?
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_applies_without_explicit_path() {
        temp_env::with_var(CONFIG_PATH_ENV, Some("/etc/polystep/engine.json"), || {
            assert_eq!(resolve_config_path(None), PathBuf::from("/etc/polystep/engine.json"));
            assert_eq!(
                resolve_config_path(Some(Path::new("local.yaml"))),
                PathBuf::from("local.yaml")
            );
        });
        temp_env::with_var_unset(CONFIG_PATH_ENV, || {
            assert_eq!(resolve_config_path(None), PathBuf::from(DEFAULT_CONFIG_FILE));
        });
    }

    #[test]
    fn loads_json_and_yaml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("engine.json");
        fs::write(
            &json_path,
            r#"{"steps": [{"name": "a", "subscribes": ["x"], "filePath": "a.py"}], "tracing": {"enabled": false}}"#,
        )
        .unwrap();
        let config = load_config_from_path(&json_path).unwrap();
        assert!(!config.tracing.enabled);
        assert_eq!(config.steps[0].file_path, Some(dir.path().join("a.py")));

        let yaml_path = dir.path().join("engine.yaml");
        fs::write(&yaml_path, "logs:\n  verbose: true\n").unwrap();
        assert!(load_config_from_path(&yaml_path).unwrap().logs.verbose);
    }

    #[test]
    fn invalid_configs_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("polystep.yaml");
        fs::write(&path, "server:\n  bindAddress: 0.0.0.0:3111\n").unwrap();
        let error = load_config_from_path(&path).unwrap_err();
        assert!(error.to_string().contains("loopback"));

        assert!(load_config(Some(&dir.path().join("missing.yaml"))).is_err());
        assert_eq!(load_config_from_path(&dir.path().join("missing.yaml")).unwrap(), EngineConfig::default());
    }
}
