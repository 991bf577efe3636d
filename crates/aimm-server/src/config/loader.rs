//! Configuration file loader.

use std::path::Path;

use tracing::info;

use super::error::{ConfigError, ConfigResult};
use super::schema::AimmConfig;
use super::validation::validate_config;

/// Loads and validates the configuration at `path`.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<AimmConfig> {
    let path = path.as_ref();
    info!("loading configuration from {}", path.display());

    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Parses and validates configuration from a YAML string.
pub fn load_config_from_str(yaml: &str) -> ConfigResult<AimmConfig> {
    let expanded = expand_env_vars(yaml);
    let config: AimmConfig = serde_yaml::from_str(&expanded)?;
    validate_config(&config)?;
    Ok(config)
}

/// Expands environment variables of the form `${VAR}` or `${VAR:-default}`.
fn expand_env_vars(content: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(:-([^}]*))?\}")
        .expect("static pattern");
    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let full_match = cap.get(0).map(|m| m.as_str()).unwrap_or_default();
        let Some(var_name) = cap.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = std::env::var(var_name)
            .ok()
            .or_else(|| default_value.map(String::from))
            .unwrap_or_default();

        result = result.replace(full_match, &value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, ControlConfig};

    #[test]
    fn test_parse_empty_yaml() {
        let config = load_config_from_str("{}").unwrap();
        assert!(config.controls.is_empty());
        assert!(matches!(config.backend, BackendConfig::Dummy));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
log:
  level: debug
engine:
  max_children: 2
  sigterm_timeout_ms: 1000
plugins:
  sets: [testing]
backend:
  kind: sqlite
  path: /tmp/aimm.db
controls:
  - kind: session
    host: 127.0.0.1
    port: 9999
    users:
      - username: admin
        password_sha256: "00"
"#;
        let config = load_config_from_str(yaml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.engine.max_children, 2);
        assert_eq!(config.plugins.sets, vec!["testing".to_string()]);
        assert!(matches!(config.backend, BackendConfig::Sqlite { .. }));
        assert!(matches!(config.controls[0], ControlConfig::Session(_)));
    }

    #[test]
    fn test_env_var_default_value() {
        let yaml = r#"
backend:
  kind: sqlite
  path: ${AIMM_TEST_NONEXISTENT_VAR:-/tmp/default.db}
"#;
        let config = load_config_from_str(yaml).unwrap();
        let BackendConfig::Sqlite { path } = config.backend else {
            panic!("expected sqlite backend");
        };
        assert_eq!(path, std::path::PathBuf::from("/tmp/default.db"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let yaml = r#"
engine:
  max_children: 0
"#;
        assert!(load_config_from_str(yaml).is_err());
    }
}
