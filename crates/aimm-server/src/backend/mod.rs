//! Persistence backends and their factory.

mod dummy;
mod event;
mod sqlite;

pub use dummy::DummyBackend;
pub use event::EventBackend;
pub use sqlite::SqliteBackend;

use std::sync::Arc;

use aimm_core::backend::Backend;
use aimm_core::error::{BackendError, BackendResult};
use aimm_core::event::Subscription;
use aimm_core::plugins::PluginRegistry;
use aimm_event::EventClient;

use crate::config::BackendConfig;

/// Instantiates the configured backend.
pub async fn create_backend(
    conf: &BackendConfig,
    registry: Arc<PluginRegistry>,
    client: Option<Arc<dyn EventClient>>,
) -> BackendResult<Arc<dyn Backend>> {
    match conf {
        BackendConfig::Dummy => Ok(Arc::new(DummyBackend::new())),
        BackendConfig::Sqlite { path } => {
            Ok(Arc::new(SqliteBackend::create(path, registry).await?))
        }
        BackendConfig::Event { model_prefix } => {
            let client = client.ok_or_else(|| {
                BackendError::Unavailable("event backend requires an event client".to_string())
            })?;
            Ok(Arc::new(
                EventBackend::create(model_prefix.clone(), client, registry).await?,
            ))
        }
    }
}

/// The bus subscription the configured backend wants routed to it, if any.
pub fn backend_subscription(conf: &BackendConfig) -> Option<Subscription> {
    match conf {
        BackendConfig::Event { model_prefix } => Some(Subscription::prefix(model_prefix)),
        _ => None,
    }
}
