//! Unified error types for the AIMM core.
//!
//! Every error the engine can surface to a caller is `Clone`: action results
//! are shared futures and may be observed by more than one waiter.

use thiserror::Error;

use crate::plugins::PluginKind;

/// Errors raised by plugin registration and lookup.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The key is already bound for this plugin kind.
    #[error("{kind} plugin already declared for '{key}'")]
    Duplicate {
        /// Plugin kind the registration targeted.
        kind: PluginKind,
        /// Data-access name or model type.
        key: String,
    },

    /// No plugin is bound under the requested key.
    #[error("no {kind} plugin declared for '{key}'")]
    Unknown {
        /// Plugin kind the lookup targeted.
        kind: PluginKind,
        /// Data-access name or model type.
        key: String,
    },
}

/// Errors raised while dispatching a single plugin call.
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    /// Registration or lookup failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The caller supplied a keyword argument reserved by the plugin's
    /// calling convention.
    #[error("keyword argument '{name}' conflicts with the plugin calling convention")]
    ConflictingKeyword {
        /// The conflicting keyword name.
        name: String,
    },

    /// The plugin body returned an error.
    #[error("plugin failed: {message}")]
    Plugin {
        /// Stringified plugin error.
        message: String,
    },
}

/// Errors raised by persistence backends.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The underlying store cannot be reached or read.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A write or read against the store failed.
    #[error("backend I/O error: {0}")]
    Io(String),

    /// A serialize/deserialize plugin failed while converting an instance.
    #[error("instance serialization failed: {0}")]
    Serialization(String),
}

/// Errors surfaced by engine actions.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Plugin registration or dispatch failure ([`RegistryError`]).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The caller supplied a keyword argument reserved by the plugin's
    /// calling convention.
    #[error("keyword argument '{name}' conflicts with the plugin calling convention")]
    ConflictingKeyword {
        /// The conflicting keyword name.
        name: String,
    },

    /// User code raised inside the worker process.
    #[error("plugin failed: {message}")]
    Plugin {
        /// Stringified plugin error.
        message: String,
    },

    /// The worker process did not return a result: it was cancelled, killed
    /// or crashed.
    #[error("worker process terminated without a result")]
    ProcessTerminated,

    /// The worker pool refused the call because it is shutting down.
    #[error("worker pool refused admission")]
    AdmissionFailed,

    /// A data-access placeholder could not be resolved.
    #[error("data access failed for argument '{key}': {message}")]
    DataAccess {
        /// Positional index or keyword name of the failed placeholder.
        key: String,
        /// Stringified resolution error.
        message: String,
    },

    /// fit/predict was requested for an unregistered instance id.
    #[error("unknown model instance {instance_id}")]
    UnknownInstance {
        /// The unregistered id.
        instance_id: u64,
    },

    /// Persistence failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<ExecuteError> for EngineError {
    fn from(err: ExecuteError) -> Self {
        match err {
            ExecuteError::Registry(e) => Self::Registry(e),
            ExecuteError::ConflictingKeyword { name } => Self::ConflictingKeyword { name },
            ExecuteError::Plugin { message } => Self::Plugin { message },
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for plugin dispatch.
pub type ExecuteResult<T> = Result<T, ExecuteError>;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
