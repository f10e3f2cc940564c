//! Engine configuration: model, file loading and validation.

mod io;
mod model;
mod validation;

pub use io::{CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE, load_config, load_config_from_path, resolve_config_path};
pub use model::{
    DEFAULT_BIND_ADDRESS, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_STATE_FILE, EngineConfig, LogsConfig, RpcConfig, RuntimeCommand,
    ServerConfig, StateBackend, StateConfig, TracingConfig,
};
pub use validation::{ConfigError, validate_bind_address, validate_config, validate_steps};
