//! Configuration loading, schema and validation.

mod error;
mod loader;
mod schema;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config_from_file, load_config_from_str};
pub use schema::{
    AimmConfig, BackendConfig, ControlConfig, EngineSection, EventControlConfig, LogConfig,
    PluginsSection, SessionControlConfig, SessionUser,
};
pub use validation::validate_config;
