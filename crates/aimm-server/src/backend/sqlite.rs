//! Single-file relational backend over sqlx.
//!
//! Stores one row per model in `models(id, type, instance)` with
//! autoincrementing ids. Instances cross the storage boundary through the
//! model type's serialize/deserialize plugins, executed on a blocking
//! thread.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use aimm_core::backend::Backend;
use aimm_core::error::{BackendError, BackendResult};
use aimm_core::model::{Instance, Model};
use aimm_core::plugins::{PluginRegistry, exec_deserialize, exec_serialize};

/// Backend persisting models in a single SQLite file.
pub struct SqliteBackend {
    pool: SqlitePool,
    registry: Arc<PluginRegistry>,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path`.
    pub async fn create(path: &Path, registry: Arc<PluginRegistry>) -> BackendResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                instance BLOB
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        info!(path = %path.display(), "sqlite backend ready");
        Ok(Self { pool, registry })
    }

    async fn serialize(&self, model_type: &str, instance: &Instance) -> BackendResult<Vec<u8>> {
        let registry = Arc::clone(&self.registry);
        let model_type = model_type.to_string();
        let instance = instance.clone();
        tokio::task::spawn_blocking(move || exec_serialize(&registry, &model_type, &instance))
            .await
            .map_err(|e| BackendError::Serialization(e.to_string()))?
            .map_err(|e| BackendError::Serialization(e.to_string()))
    }

    async fn deserialize(&self, model_type: &str, blob: Vec<u8>) -> BackendResult<Instance> {
        let registry = Arc::clone(&self.registry);
        let model_type = model_type.to_string();
        tokio::task::spawn_blocking(move || exec_deserialize(&registry, &model_type, &blob))
            .await
            .map_err(|e| BackendError::Serialization(e.to_string()))?
            .map_err(|e| BackendError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get_models(&self) -> BackendResult<Vec<Model>> {
        let rows = sqlx::query("SELECT id, type, instance FROM models")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let model_type: String = row.get("type");
            let blob: Vec<u8> = row.get("instance");
            models.push(Model {
                instance_id: id as u64,
                instance: self.deserialize(&model_type, blob).await?,
                model_type,
            });
        }
        Ok(models)
    }

    async fn create_model(&self, model_type: &str, instance: Instance) -> BackendResult<Model> {
        let blob = self.serialize(model_type, &instance).await?;
        let result = sqlx::query("INSERT INTO models (type, instance) VALUES (?, ?)")
            .bind(model_type)
            .bind(blob)
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(Model {
            instance_id: result.last_insert_rowid() as u64,
            model_type: model_type.to_string(),
            instance,
        })
    }

    async fn update_model(&self, model: &Model) -> BackendResult<()> {
        let blob = self.serialize(&model.model_type, &model.instance).await?;
        sqlx::query("UPDATE models SET instance = ? WHERE id = ?")
            .bind(blob)
            .bind(model.instance_id as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aimm_core::plugins::{DeserializePlugin, SerializePlugin};
    use serde_json::json;

    fn json_registry() -> Arc<PluginRegistry> {
        let registry = PluginRegistry::new();
        registry
            .register_serialize(
                &["m"],
                SerializePlugin::new(|instance| Ok(serde_json::to_vec(instance)?)),
            )
            .unwrap();
        registry
            .register_deserialize(
                &["m"],
                DeserializePlugin::new(|bytes| Ok(serde_json::from_slice(bytes)?)),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.db");
        let registry = json_registry();

        let created = {
            let backend = SqliteBackend::create(&path, Arc::clone(&registry)).await.unwrap();
            backend.create_model("m", json!({"weights": [1, 2]})).await.unwrap()
        };
        assert_eq!(created.instance_id, 1);

        let backend = SqliteBackend::create(&path, registry).await.unwrap();
        let models = backend.get_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].instance_id, 1);
        assert_eq!(models[0].model_type, "m");
        assert_eq!(models[0].instance, json!({"weights": [1, 2]}));
    }

    #[tokio::test]
    async fn test_update_replaces_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.db");
        let backend = SqliteBackend::create(&path, json_registry()).await.unwrap();

        let model = backend.create_model("m", json!(1)).await.unwrap();
        backend
            .update_model(&model.replace_instance(json!(2)))
            .await
            .unwrap();

        let models = backend.get_models().await.unwrap();
        assert_eq!(models[0].instance, json!(2));
    }

    #[tokio::test]
    async fn test_missing_serialize_plugin_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.db");
        let backend = SqliteBackend::create(&path, Arc::new(PluginRegistry::new()))
            .await
            .unwrap();
        let err = backend.create_model("m", json!(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Serialization(_)));
    }
}
