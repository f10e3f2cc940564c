//! Configuration validation.

use std::collections::HashSet;
use std::net::SocketAddr;

use polystep_types::{StepConfig, StepType};
use thiserror::Error;
use tracing::debug;

use super::EngineConfig;

/// Validate the entire engine configuration.
pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    validate_steps(&config.steps)?;
    for step in &config.steps {
        validate_runtime(config, step)?;
    }
    validate_bind_address(&config.server.bind_address)?;
    if config.rpc.call_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "rpc.callTimeoutMs".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    if config.logs.max_entries == 0 {
        return Err(ConfigError::InvalidValue {
            field: "logs.maxEntries".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Unique, non-empty names; event steps subscribe to at least one topic.
pub fn validate_steps(steps: &[StepConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(ConfigError::InvalidStep {
                name: step.name.clone(),
                reason: "Step name cannot be empty".to_string(),
            });
        }
        if !seen.insert(step.name.as_str()) {
            return Err(ConfigError::DuplicateStep { name: step.name.clone() });
        }
        if step.step_type == StepType::Event && step.subscribes.is_empty() {
            return Err(ConfigError::InvalidStep {
                name: step.name.clone(),
                reason: "Event steps must subscribe to at least one topic".to_string(),
            });
        }
        debug!(step = %step.name, "Validated step configuration");
    }
    Ok(())
}

fn validate_runtime(config: &EngineConfig, step: &StepConfig) -> Result<(), ConfigError> {
    if step.command.as_deref().is_some_and(|command| command.trim().is_empty()) {
        return Err(ConfigError::InvalidStep {
            name: step.name.clone(),
            reason: "Step command cannot be empty".to_string(),
        });
    }
    if step.command.is_some() || step.file_path.is_none() {
        return Ok(());
    }
    let language = step.language();
    match config.runtime_for(language) {
        Some(runtime) if runtime.command.trim().is_empty() => Err(ConfigError::MissingRuntime {
            step: step.name.clone(),
            language: language.to_string(),
        }),
        _ => Ok(()),
    }
}

/// The HTTP surface only binds to loopback addresses.
pub fn validate_bind_address(address: &str) -> Result<SocketAddr, ConfigError> {
    let parsed: SocketAddr = address.parse().map_err(|_| ConfigError::InvalidBindAddress {
        address: address.to_string(),
        reason: "expected host:port".to_string(),
    })?;
    if !parsed.ip().is_loopback() {
        return Err(ConfigError::InvalidBindAddress {
            address: address.to_string(),
            reason: "only loopback addresses are allowed".to_string(),
        });
    }
    Ok(parsed)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Duplicate step name '{name}'")]
    DuplicateStep { name: String },

    #[error("Invalid step '{name}': {reason}")]
    InvalidStep { name: String, reason: String },

    #[error("No runtime configured for {language} step '{step}'")]
    MissingRuntime { step: String, language: String },

    #[error("Invalid bind address '{address}': {reason}")]
    InvalidBindAddress { address: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeCommand;
    use polystep_types::StepLanguage;
    use std::path::PathBuf;

    #[test]
    fn duplicate_and_unsubscribed_steps_are_rejected() {
        let steps = vec![StepConfig::event("a", &["x"]), StepConfig::event("a", &["y"])];
        assert!(matches!(validate_steps(&steps), Err(ConfigError::DuplicateStep { .. })));

        let steps = vec![StepConfig::event("lonely", &[])];
        assert!(matches!(validate_steps(&steps), Err(ConfigError::InvalidStep { .. })));

        let api = StepConfig {
            name: "api".to_string(),
            step_type: StepType::Api,
            ..Default::default()
        };
        assert!(validate_steps(&[api]).is_ok());
    }

    #[test]
    fn blank_runtime_override_is_reported() {
        let mut config = EngineConfig::default();
        config.steps.push(StepConfig {
            file_path: Some(PathBuf::from("steps/a.rb")),
            ..StepConfig::event("a", &["x"])
        });
        assert!(validate_config(&config).is_ok());

        config.runtimes.insert(StepLanguage::Ruby, RuntimeCommand::new(" "));
        assert!(matches!(validate_config(&config), Err(ConfigError::MissingRuntime { .. })));
    }

    #[test]
    fn bind_address_must_be_loopback() {
        assert!(validate_bind_address("127.0.0.1:3111").is_ok());
        assert!(validate_bind_address("[::1]:3111").is_ok());
        assert!(validate_bind_address("0.0.0.0:3111").is_err());
        assert!(validate_bind_address("localhost").is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = EngineConfig::default();
        config.rpc.call_timeout_ms = 0;
        assert!(matches!(validate_config(&config), Err(ConfigError::InvalidValue { .. })));
    }
}
