use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use polystep_types::{StepConfig, StepLanguage};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3111";
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STATE_FILE: &str = ".polystep/state.json";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Interpreter overrides per language; unset languages use the defaults.
    #[serde(default)]
    pub runtimes: IndexMap<StepLanguage, RuntimeCommand>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tracing: TracingConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub logs: LogsConfig,
}

impl EngineConfig {
    /// Command used to run steps of `language`, if it needs an interpreter.
    pub fn runtime_for(&self, language: StepLanguage) -> Option<RuntimeCommand> {
        self.runtimes
            .get(&language)
            .cloned()
            .or_else(|| RuntimeCommand::default_for(language))
    }

    /// Makes step files and the state file relative to `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        for step in &mut self.steps {
            if let Some(path) = &step.file_path
                && path.is_relative()
            {
                step.file_path = Some(base_dir.join(path));
            }
        }
        if let Some(path) = &self.state.path
            && path.is_relative()
        {
            self.state.path = Some(base_dir.join(path));
        }
    }
}

/// Executable plus leading arguments; the step file is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl RuntimeCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn default_for(language: StepLanguage) -> Option<Self> {
        match language {
            StepLanguage::Node => Some(Self::new("node")),
            StepLanguage::Python => Some(Self::new("python3")),
            StepLanguage::Ruby => Some(Self::new("ruby")),
            StepLanguage::Native => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TracingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_trace_groups: Option<usize>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_trace_groups: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RpcConfig {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub adapter: StateBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StateConfig {
    pub fn file_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogsConfig {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            max_entries: default_max_entries(),
        }
    }
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_true() -> bool {
    true
}

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_max_entries() -> usize {
    crate::observability::DEFAULT_MAX_ENTRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_config_fills_defaults() {
        let yaml = r#"
steps:
  - name: process-food-order
    subscribes: [process-food-order]
    emits: [new-order-notification]
    flows: [basic-tutorial]
    filePath: steps/process_food_order.py
runtimes:
  python:
    command: uv
    args: [run]
state:
  adapter: file
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.steps.len(), 1);
        assert_eq!(config.server.bind_address, DEFAULT_BIND_ADDRESS);
        assert!(config.tracing.enabled);
        assert_eq!(config.rpc.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.state.adapter, StateBackend::File);
        assert_eq!(config.logs.max_entries, 5000);

        let python = config.runtime_for(StepLanguage::Python).unwrap();
        assert_eq!(python.command, "uv");
        assert_eq!(config.runtime_for(StepLanguage::Node).unwrap().command, "node");
        assert!(config.runtime_for(StepLanguage::Native).is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<EngineConfig>(r#"{"server": {"bindAddr": "x"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn relative_paths_resolve_against_the_config_dir() {
        let mut config = EngineConfig::default();
        config.steps.push(StepConfig {
            file_path: Some(PathBuf::from("steps/a.py")),
            ..StepConfig::event("a", &["x"])
        });
        config.state.path = Some(PathBuf::from("data/state.json"));
        config.resolve_paths(Path::new("/srv/app"));

        assert_eq!(config.steps[0].file_path, Some(PathBuf::from("/srv/app/steps/a.py")));
        assert_eq!(config.state.path, Some(PathBuf::from("/srv/app/data/state.json")));
    }
}
