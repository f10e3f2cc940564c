pub mod path_processing;
pub mod text_processing;

pub use path_processing::{config_path_from_env, expand_tilde};
pub use text_processing::{redact_sensitive, redact_sensitive_with};
