//! Named plugin sets.
//!
//! The configuration lists plugin sets by name; the server process and
//! every worker process register the same sets, so a worker spawned for a
//! call resolves exactly the plugins the server validated against.

pub mod testing;

use std::sync::Arc;

use aimm_core::error::RegistryError;
use aimm_core::plugins::PluginRegistry;

use crate::config::{ConfigError, ConfigResult};

/// Registration entry point of one plugin set.
pub type PluginSetFn = fn(&PluginRegistry) -> Result<(), RegistryError>;

/// Resolves a plugin-set name to its registration function.
pub fn plugin_set(name: &str) -> Option<PluginSetFn> {
    match name {
        "testing" => Some(testing::register),
        _ => None,
    }
}

/// Builds a registry from the named sets.
pub fn build_registry(sets: &[String]) -> ConfigResult<Arc<PluginRegistry>> {
    let registry = PluginRegistry::new();
    for name in sets {
        let register = plugin_set(name).ok_or_else(|| ConfigError::UnknownPluginSet(name.clone()))?;
        register(&registry).map_err(|e| ConfigError::validation(e.to_string()))?;
    }
    Ok(Arc::new(registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_registry_with_testing_set() {
        let registry = build_registry(&["testing".to_string()]).unwrap();
        assert!(registry.instantiate("testing.tuple").is_ok());
        assert!(registry.data_access("testing.constant").is_ok());
    }

    #[test]
    fn test_unknown_set_rejected() {
        let err = build_registry(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPluginSet(_)));
    }
}
