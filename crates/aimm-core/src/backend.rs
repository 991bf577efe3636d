//! Persistence backend contract.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::BackendResult;
use crate::event::Event;
use crate::model::{Instance, Model};

/// Callback invoked when a backend observes an external model replacement.
pub type ModelChangeCallback = Arc<dyn Fn(Model) + Send + Sync>;

/// Persists model instances.
///
/// A backend owns the serialized form of every model and the allocation of
/// instance ids; the engine owns the live instances. The backend is the sole
/// writer to its store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns every persisted model. Called once on engine startup to
    /// repopulate the in-memory registry.
    async fn get_models(&self) -> BackendResult<Vec<Model>>;

    /// Persists a new model and returns it with a freshly assigned
    /// `instance_id`. Ownership of the id transfers to the engine.
    async fn create_model(&self, model_type: &str, instance: Instance) -> BackendResult<Model>;

    /// Replaces the stored instance for the model's id. Idempotent.
    async fn update_model(&self, model: &Model) -> BackendResult<()>;

    /// Registers a callback fired when the backend observes an in-place
    /// model replacement made by another writer. Backends without external
    /// writers keep the default no-op.
    fn register_model_change_callback(&self, callback: ModelChangeCallback) {
        let _ = callback;
    }

    /// Hands the backend the bus events matching its subscription. The
    /// default drops them.
    async fn process_events(&self, events: Vec<Event>) {
        debug!(count = events.len(), "backend dropped unhandled events");
    }
}
