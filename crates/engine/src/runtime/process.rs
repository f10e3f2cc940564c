use std::path::PathBuf;

use indexmap::IndexMap;
use polystep_rpc::{Transport, spawn_child};
use polystep_types::{StepConfig, StepLanguage};
use tokio::process::Command;

use super::StepRuntime;
use crate::config::{EngineConfig, RuntimeCommand};
use crate::error::DispatchError;

/// Variable telling a child which step it runs.
pub const STEP_NAME_ENV: &str = "POLYSTEP_STEP";

/// Runs each step in its own child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRuntime {
    runtimes: IndexMap<StepLanguage, RuntimeCommand>,
    working_dir: Option<PathBuf>,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime commands for every language the configuration knows about.
    pub fn from_config(config: &EngineConfig) -> Self {
        let runtimes = [StepLanguage::Node, StepLanguage::Python, StepLanguage::Ruby]
            .into_iter()
            .filter_map(|language| config.runtime_for(language).map(|runtime| (language, runtime)))
            .collect();
        Self {
            runtimes,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    /// Builds the command line for `step`.
    ///
    /// An explicit `command` wins; otherwise the file's language picks the
    /// interpreter, and native files are executed directly.
    pub fn command_for(&self, step: &StepConfig) -> Result<Command, DispatchError> {
        let mut command = if let Some(program) = &step.command {
            let mut command = Command::new(program);
            command.args(&step.args);
            if let Some(path) = &step.file_path {
                command.arg(path);
            }
            command
        } else if let Some(path) = &step.file_path {
            match step.language() {
                StepLanguage::Native => {
                    let mut command = Command::new(path);
                    command.args(&step.args);
                    command
                }
                language => {
                    let runtime = self.runtimes.get(&language).ok_or_else(|| {
                        DispatchError::runtime(&step.name, format!("no runtime configured for {language}"))
                    })?;
                    let mut command = Command::new(&runtime.command);
                    command.args(&runtime.args).arg(path).args(&step.args);
                    command
                }
            }
        } else {
            return Err(DispatchError::runtime(&step.name, "step has neither filePath nor command"));
        };

        command.env(STEP_NAME_ENV, &step.name);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        Ok(command)
    }
}

#[async_trait::async_trait]
impl StepRuntime for ProcessRuntime {
    async fn open(&self, step: &StepConfig) -> Result<Transport, DispatchError> {
        let command = self.command_for(step)?;
        spawn_child(&step.name, command).map_err(|error| DispatchError::runtime(&step.name, error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn program_and_args(command: &Command) -> (String, Vec<String>) {
        let std = command.as_std();
        (
            std.get_program().to_string_lossy().to_string(),
            std.get_args().map(|arg| arg.to_string_lossy().to_string()).collect(),
        )
    }

    #[test]
    fn language_picks_the_interpreter() {
        let runtime = ProcessRuntime::from_config(&EngineConfig::default());
        let step = StepConfig {
            file_path: Some(PathBuf::from("steps/process_food_order.py")),
            args: vec!["--fast".to_string()],
            ..StepConfig::event("process-food-order", &["process-food-order"])
        };

        let command = runtime.command_for(&step).unwrap();
        assert_eq!(
            program_and_args(&command),
            (
                "python3".to_string(),
                vec!["steps/process_food_order.py".to_string(), "--fast".to_string()]
            )
        );
        let env: Vec<_> = command.as_std().get_envs().collect();
        assert!(env.contains(&(OsStr::new(STEP_NAME_ENV), Some(OsStr::new("process-food-order")))));
    }

    #[test]
    fn explicit_command_and_native_files_run_directly() {
        let runtime = ProcessRuntime::new();
        let step = StepConfig {
            command: Some("deno".to_string()),
            args: vec!["run".to_string()],
            file_path: Some(PathBuf::from("step.ts")),
            ..StepConfig::event("a", &["x"])
        };
        assert_eq!(
            program_and_args(&runtime.command_for(&step).unwrap()),
            ("deno".to_string(), vec!["run".to_string(), "step.ts".to_string()])
        );

        let native = StepConfig {
            file_path: Some(PathBuf::from("bin/step")),
            ..StepConfig::event("b", &["x"])
        };
        assert_eq!(program_and_args(&runtime.command_for(&native).unwrap()).0, "bin/step");
    }

    #[test]
    fn missing_binding_or_runtime_is_reported() {
        let runtime = ProcessRuntime::new();
        assert!(runtime.command_for(&StepConfig::event("a", &["x"])).is_err());

        let ruby = StepConfig {
            file_path: Some(PathBuf::from("a.rb")),
            ..StepConfig::event("a", &["x"])
        };
        assert!(matches!(runtime.command_for(&ruby), Err(DispatchError::Runtime { .. })));
    }
}
