//! Configuration schema.
//!
//! # Example configuration (YAML)
//!
//! ```yaml
//! log:
//!   level: info
//!
//! engine:
//!   max_children: 4
//!   check_children_period_ms: 100
//!   sigterm_timeout_ms: 5000
//!   action_grace_period_ms: 60000
//!
//! plugins:
//!   sets: [testing]
//!
//! backend:
//!   kind: sqlite
//!   path: ./aimm.db
//!
//! controls:
//!   - kind: event
//!     event_prefixes:
//!       create_instance: [aimm, create_instance]
//!       fit: [aimm, fit]
//!       predict: [aimm, predict]
//!       cancel: [aimm, cancel]
//!     state_event_type: [aimm, state]
//!     action_state_event_type: [aimm, action_state]
//!   - kind: session
//!     host: 127.0.0.1
//!     port: 9999
//!     users:
//!       - username: admin
//!         password_sha256: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aimm_engine::EngineConfig;

/// Root configuration of the server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AimmConfig {
    /// Logging settings.
    pub log: LogConfig,
    /// Engine and worker-pool settings.
    pub engine: EngineSection,
    /// Plugin sets registered by the server and its workers.
    pub plugins: PluginsSection,
    /// Persistence backend.
    pub backend: BackendConfig,
    /// External control planes.
    pub controls: Vec<ControlConfig>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Engine and worker-pool settings. Durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Maximum number of concurrently live worker processes.
    pub max_children: usize,
    /// Period between admission checks.
    pub check_children_period_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub sigterm_timeout_ms: u64,
    /// Retention of terminal action entries.
    pub action_grace_period_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_children: 4,
            check_children_period_ms: 100,
            sigterm_timeout_ms: 5000,
            action_grace_period_ms: 60_000,
        }
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            max_children: section.max_children,
            check_children_period: Duration::from_millis(section.check_children_period_ms),
            sigterm_timeout: Duration::from_millis(section.sigterm_timeout_ms),
            action_grace_period: Duration::from_millis(section.action_grace_period_ms),
        }
    }
}

/// Plugin sets to register, by name. Both the server process and every
/// worker process register the same sets.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginsSection {
    /// Names of plugin sets known to the binary.
    pub sets: Vec<String>,
}

/// Persistence backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-memory backend; nothing survives a restart.
    Dummy,
    /// Single-file relational backend.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// Event-bus backend: one event per model under `model_prefix`.
    Event {
        /// Event-type prefix the models are stored under.
        model_prefix: Vec<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Dummy
    }
}

/// Control plane selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlConfig {
    /// Event-bus control.
    Event(EventControlConfig),
    /// Interactive session control.
    Session(SessionControlConfig),
}

/// Event-bus control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventControlConfig {
    /// Inbound request prefixes by operation name: `create_instance`,
    /// `add_instance`, `update_instance`, `fit`, `predict`, `cancel`.
    pub event_prefixes: BTreeMap<String, Vec<String>>,
    /// Event type the engine state is published under.
    pub state_event_type: Vec<String>,
    /// Event type the per-action status events are published under.
    pub action_state_event_type: Vec<String>,
}

/// Interactive session control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionControlConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Accounts allowed to log in.
    #[serde(default)]
    pub users: Vec<SessionUser>,
}

/// One session account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUser {
    /// Login name.
    pub username: String,
    /// Hex SHA-256 of the password; compared against the hash sent by the
    /// client.
    pub password_sha256: String,
}
