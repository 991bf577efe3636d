//! Configuration validation.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{AimmConfig, BackendConfig, ControlConfig};

/// Known operation names for event-control prefixes.
const EVENT_OPERATIONS: &[&str] = &[
    "create_instance",
    "add_instance",
    "update_instance",
    "fit",
    "predict",
    "cancel",
];

/// Validates a loaded configuration before anything is started.
pub fn validate_config(config: &AimmConfig) -> ConfigResult<()> {
    if config.engine.max_children == 0 {
        return Err(ConfigError::validation("engine.max_children must be at least 1"));
    }
    if config.engine.check_children_period_ms == 0 {
        return Err(ConfigError::validation(
            "engine.check_children_period_ms must be positive",
        ));
    }
    if config.engine.sigterm_timeout_ms == 0 {
        return Err(ConfigError::validation("engine.sigterm_timeout_ms must be positive"));
    }

    if let BackendConfig::Sqlite { path } = &config.backend
        && path.as_os_str().is_empty()
    {
        return Err(ConfigError::validation("backend.path must not be empty"));
    }
    if let BackendConfig::Event { model_prefix } = &config.backend
        && model_prefix.is_empty()
    {
        return Err(ConfigError::validation("backend.model_prefix must not be empty"));
    }

    for control in &config.controls {
        match control {
            ControlConfig::Event(conf) => {
                if conf.event_prefixes.is_empty() {
                    return Err(ConfigError::validation(
                        "event control needs at least one entry in event_prefixes",
                    ));
                }
                for (operation, prefix) in &conf.event_prefixes {
                    if !EVENT_OPERATIONS.contains(&operation.as_str()) {
                        return Err(ConfigError::validation(format!(
                            "unknown event control operation '{operation}'"
                        )));
                    }
                    if prefix.is_empty() {
                        return Err(ConfigError::validation(format!(
                            "event prefix for '{operation}' must not be empty"
                        )));
                    }
                }
                if conf.state_event_type.is_empty() || conf.action_state_event_type.is_empty() {
                    return Err(ConfigError::validation(
                        "event control needs state_event_type and action_state_event_type",
                    ));
                }
            }
            ControlConfig::Session(conf) => {
                if conf.port == 0 {
                    return Err(ConfigError::validation("session control port must not be 0"));
                }
                let mut seen = HashSet::new();
                for user in &conf.users {
                    if !seen.insert(user.username.as_str()) {
                        return Err(ConfigError::validation(format!(
                            "duplicate session user '{}'",
                            user.username
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{EventControlConfig, SessionControlConfig, SessionUser};

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&AimmConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_children_rejected() {
        let mut config = AimmConfig::default();
        config.engine.max_children = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_unknown_event_operation_rejected() {
        let mut config = AimmConfig::default();
        config.controls.push(ControlConfig::Event(EventControlConfig {
            event_prefixes: [("teleport".to_string(), vec!["aimm".to_string()])]
                .into_iter()
                .collect(),
            state_event_type: vec!["aimm".to_string(), "state".to_string()],
            action_state_event_type: vec!["aimm".to_string(), "action".to_string()],
        }));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_session_user_rejected() {
        let user = SessionUser {
            username: "admin".to_string(),
            password_sha256: "00".to_string(),
        };
        let mut config = AimmConfig::default();
        config.controls.push(ControlConfig::Session(SessionControlConfig {
            host: "127.0.0.1".to_string(),
            port: 9999,
            users: vec![user.clone(), user],
        }));
        assert!(validate_config(&config).is_err());
    }
}
