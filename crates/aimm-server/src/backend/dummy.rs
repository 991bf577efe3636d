//! In-memory backend. Nothing survives a restart.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use aimm_core::backend::Backend;
use aimm_core::error::BackendResult;
use aimm_core::model::{Instance, Model};

/// Backend that only allocates ids.
#[derive(Debug)]
pub struct DummyBackend {
    next_id: AtomicU64,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Creates a dummy backend with ids starting at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Backend for DummyBackend {
    async fn get_models(&self) -> BackendResult<Vec<Model>> {
        Ok(Vec::new())
    }

    async fn create_model(&self, model_type: &str, instance: Instance) -> BackendResult<Model> {
        Ok(Model {
            instance_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            model_type: model_type.to_string(),
            instance,
        })
    }

    async fn update_model(&self, _model: &Model) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let backend = DummyBackend::new();
        let first = backend.create_model("m", json!(1)).await.unwrap();
        let second = backend.create_model("m", json!(2)).await.unwrap();
        assert_eq!(first.instance_id, 1);
        assert_eq!(second.instance_id, 2);
        assert!(backend.get_models().await.unwrap().is_empty());
    }
}
