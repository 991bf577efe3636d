//! Event-bus backend.
//!
//! Persists one event per model at `<model_prefix>/<instance_id>` with a
//! `{type, instance}` payload, where `instance` is the base64 of the
//! serialize plugin's bytes. The latest event per type is the current state.
//! Writes by other bus participants under the same prefix come back through
//! [`process_events`](aimm_core::Backend::process_events) and are surfaced
//! as model-change notifications.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde_json::json;
use tracing::warn;

use aimm_core::backend::{Backend, ModelChangeCallback};
use aimm_core::error::{BackendError, BackendResult};
use aimm_core::event::{Event, RegisterEvent, Subscription};
use aimm_core::model::{Instance, Model};
use aimm_core::plugins::{PluginRegistry, exec_deserialize, exec_serialize};
use aimm_event::EventClient;

/// Backend storing models as bus events.
pub struct EventBackend {
    model_prefix: Vec<String>,
    client: Arc<dyn EventClient>,
    registry: Arc<PluginRegistry>,
    next_id: AtomicU64,
    change_callback: Mutex<Option<ModelChangeCallback>>,
}

impl EventBackend {
    /// Creates the backend and seeds the id counter from the bus.
    pub async fn create(
        model_prefix: Vec<String>,
        client: Arc<dyn EventClient>,
        registry: Arc<PluginRegistry>,
    ) -> BackendResult<Self> {
        let backend = Self {
            model_prefix,
            client,
            registry,
            next_id: AtomicU64::new(1),
            change_callback: Mutex::new(None),
        };
        let events = backend.query_model_events().await?;
        let max_id = events.iter().filter_map(|e| backend.event_instance_id(e)).max();
        backend.next_id.store(max_id.unwrap_or(0) + 1, Ordering::SeqCst);
        Ok(backend)
    }

    /// The subscription the runner should route to this backend.
    pub fn subscription(&self) -> Subscription {
        Subscription::prefix(&self.model_prefix)
    }

    async fn query_model_events(&self) -> BackendResult<Vec<Event>> {
        self.client
            .query(&Subscription::prefix(&self.model_prefix))
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }

    fn event_instance_id(&self, event: &Event) -> Option<u64> {
        event
            .event_type
            .get(self.model_prefix.len())
            .and_then(|segment| segment.parse().ok())
    }

    async fn model_to_event(&self, model: &Model) -> BackendResult<RegisterEvent> {
        let blob = self.serialize_instance(&model.model_type, model.instance.clone()).await?;
        let mut event_type = self.model_prefix.clone();
        event_type.push(model.instance_id.to_string());
        Ok(RegisterEvent::new(
            event_type,
            json!({
                "type": model.model_type,
                "instance": BASE64.encode(blob),
            }),
        ))
    }

    async fn event_to_model(&self, event: &Event) -> BackendResult<Model> {
        let instance_id = self.event_instance_id(event).ok_or_else(|| {
            BackendError::Io(format!("model event with non-numeric id: {:?}", event.event_type))
        })?;
        let model_type = event.payload["type"]
            .as_str()
            .ok_or_else(|| BackendError::Io("model event without type".to_string()))?
            .to_string();
        let instance_b64 = event.payload["instance"]
            .as_str()
            .ok_or_else(|| BackendError::Io("model event without instance".to_string()))?;
        let blob = BASE64
            .decode(instance_b64)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        let registry = Arc::clone(&self.registry);
        let mt = model_type.clone();
        let instance = tokio::task::spawn_blocking(move || exec_deserialize(&registry, &mt, &blob))
            .await
            .map_err(|e| BackendError::Serialization(e.to_string()))?
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        Ok(Model {
            instance_id,
            model_type,
            instance,
        })
    }

    async fn register_model(&self, model: &Model) -> BackendResult<()> {
        let event = self.model_to_event(model).await?;
        self.client
            .register_with_response(vec![event])
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(())
    }

    async fn serialize_instance(
        &self,
        model_type: &str,
        instance: Instance,
    ) -> BackendResult<Vec<u8>> {
        let registry = Arc::clone(&self.registry);
        let model_type = model_type.to_string();
        tokio::task::spawn_blocking(move || exec_serialize(&registry, &model_type, &instance))
            .await
            .map_err(|e| BackendError::Serialization(e.to_string()))?
            .map_err(|e| BackendError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl Backend for EventBackend {
    async fn get_models(&self) -> BackendResult<Vec<Model>> {
        let events = self.query_model_events().await?;
        let mut models = Vec::with_capacity(events.len());
        for event in &events {
            models.push(self.event_to_model(event).await?);
        }
        Ok(models)
    }

    async fn create_model(&self, model_type: &str, instance: Instance) -> BackendResult<Model> {
        let model = Model {
            instance_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            model_type: model_type.to_string(),
            instance,
        };
        self.register_model(&model).await?;
        Ok(model)
    }

    async fn update_model(&self, model: &Model) -> BackendResult<()> {
        self.register_model(model).await
    }

    fn register_model_change_callback(&self, callback: ModelChangeCallback) {
        *self.change_callback.lock() = Some(callback);
    }

    async fn process_events(&self, events: Vec<Event>) {
        for event in events {
            if !Subscription::prefix(&self.model_prefix).matches(&event.event_type) {
                continue;
            }
            match self.event_to_model(&event).await {
                Ok(model) => {
                    // Keep the counter ahead of externally allocated ids.
                    self.next_id.fetch_max(model.instance_id + 1, Ordering::SeqCst);
                    let callback = self.change_callback.lock().clone();
                    if let Some(callback) = callback {
                        callback(model);
                    }
                }
                Err(e) => warn!(error = %e, "ignoring malformed model event"),
            }
        }
    }
}
