//! Event-bus control.
//!
//! Translates inbound bus requests into engine calls, publishes the engine
//! state on every change (deduplicated) and reports per-action status
//! transitions under the request's correlation id. Cancel requests close
//! the action registered under the correlated request id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use aimm_core::control::Control;
use aimm_core::error::EngineError;
use aimm_core::event::{Event, RegisterEvent, Subscription, matches_pattern};
use aimm_core::model::Model;
use aimm_core::plugins::exec_deserialize;
use aimm_core::state::CallbackHandle;
use aimm_engine::Engine;
use aimm_event::EventClient;

use crate::config::EventControlConfig;
use crate::control::envelope::{args_from_json, kwargs_from_json};

const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
const STATUS_DONE: &str = "DONE";
const STATUS_CANCELLED: &str = "CANCELLED";
const STATUS_FAILED: &str = "FAILED";

/// Control driven by event-bus requests.
pub struct EventControl {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Engine,
    client: Arc<dyn EventClient>,
    conf: EventControlConfig,
    notified_state: Mutex<Option<Value>>,
    running: Mutex<HashMap<String, CancellationToken>>,
    state_subscription: Mutex<Option<CallbackHandle>>,
}

impl EventControl {
    /// Creates the control and starts publishing engine state.
    pub fn create(conf: EventControlConfig, engine: Engine, client: Arc<dyn EventClient>) -> Self {
        let inner = Arc::new(Inner {
            engine: engine.clone(),
            client,
            conf,
            notified_state: Mutex::new(None),
            running: Mutex::new(HashMap::new()),
            state_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handle = engine.subscribe_to_state_change(move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(notify_state(inner));
            }
        });
        *inner.state_subscription.lock() = Some(handle);
        tokio::spawn(notify_state(Arc::clone(&inner)));

        Self { inner }
    }

    /// The subscription the runner should route to this control.
    pub fn subscription(&self) -> Subscription {
        self.inner
            .conf
            .event_prefixes
            .values()
            .fold(Subscription::default(), |acc, prefix| {
                acc.union(&Subscription::prefix(prefix))
            })
    }
}

#[async_trait]
impl Control for EventControl {
    async fn process_events(&self, events: Vec<Event>) {
        for event in events {
            let Some((operation, prefix)) = self.inner.operation_for(&event.event_type) else {
                debug!(event_type = ?event.event_type, "event matches no configured prefix");
                continue;
            };
            let inner = Arc::clone(&self.inner);
            match operation.as_str() {
                "create_instance" => {
                    tokio::spawn(async move { inner.handle_create(event).await });
                }
                "add_instance" => {
                    tokio::spawn(async move { inner.handle_add(event).await });
                }
                "update_instance" => {
                    let prefix_len = prefix.len();
                    tokio::spawn(async move { inner.handle_update(event, prefix_len).await });
                }
                "fit" => {
                    let prefix_len = prefix.len();
                    tokio::spawn(async move { inner.handle_fit(event, prefix_len).await });
                }
                "predict" => {
                    let prefix_len = prefix.len();
                    tokio::spawn(async move { inner.handle_predict(event, prefix_len).await });
                }
                "cancel" => inner.handle_cancel(&event),
                other => debug!(operation = other, "unhandled control operation"),
            }
        }
    }

    async fn close(&self) {
        self.inner.state_subscription.lock().take();
    }
}

async fn notify_state(inner: Arc<Inner>) {
    let state = inner.engine.state();
    let models: serde_json::Map<String, Value> = state
        .models
        .values()
        .map(|m| (m.instance_id.to_string(), json!(m.model_type)))
        .collect();
    let actions: serde_json::Map<String, Value> = state
        .actions
        .iter()
        .map(|(id, value)| (id.to_string(), value.clone()))
        .collect();
    let state_json = json!({ "models": models, "actions": actions });

    {
        let mut notified = inner.notified_state.lock();
        if notified.as_ref() == Some(&state_json) {
            return;
        }
        *notified = Some(state_json.clone());
    }

    if let Err(e) = inner
        .client
        .register(vec![RegisterEvent::new(
            inner.conf.state_event_type.clone(),
            state_json,
        )])
        .await
    {
        warn!(error = %e, "failed to publish engine state");
    }
}

impl Inner {
    fn operation_for(&self, event_type: &[String]) -> Option<(String, Vec<String>)> {
        self.conf.event_prefixes.iter().find_map(|(operation, prefix)| {
            let mut pattern = prefix.clone();
            pattern.push("*".to_string());
            matches_pattern(&pattern, event_type)
                .then(|| (operation.clone(), prefix.clone()))
        })
    }

    fn request_key(request_id: &Value) -> String {
        request_id.to_string()
    }

    fn track(&self, request_id: &Value, token: CancellationToken) {
        self.running
            .lock()
            .insert(Self::request_key(request_id), token);
    }

    fn untrack(&self, request_id: &Value) {
        self.running.lock().remove(&Self::request_key(request_id));
    }

    async fn publish_status(&self, request_id: &Value, status: &str, result: Value) {
        let payload = json!({
            "request_id": request_id,
            "status": status,
            "result": result,
        });
        if let Err(e) = self
            .client
            .register(vec![RegisterEvent::new(
                self.conf.action_state_event_type.clone(),
                payload,
            )])
            .await
        {
            warn!(error = %e, "failed to publish action state");
        }
    }

    async fn instance_from_b64(&self, model_type: &str, instance_b64: &str) -> anyhow::Result<Value> {
        let blob = BASE64.decode(instance_b64)?;
        let registry = Arc::clone(self.engine.registry());
        let model_type = model_type.to_string();
        let instance =
            tokio::task::spawn_blocking(move || exec_deserialize(&registry, &model_type, &blob))
                .await??;
        Ok(instance)
    }

    async fn handle_create(&self, event: Event) {
        let payload = &event.payload;
        let request_id = payload.get("request_id").cloned().unwrap_or(Value::Null);
        let Some(model_type) = payload.get("model_type").and_then(Value::as_str) else {
            self.publish_status(&request_id, STATUS_FAILED, json!("missing model_type"))
                .await;
            return;
        };
        let args = args_from_json(payload.get("args"));
        let kwargs = kwargs_from_json(payload.get("kwargs"));

        match self.engine.create_instance(model_type, args, kwargs) {
            Ok(action) => {
                let token = action.cancellation_token();
                self.track(&request_id, token.clone());
                self.publish_status(&request_id, STATUS_IN_PROGRESS, Value::Null).await;
                let result = action.wait_result().await;
                self.untrack(&request_id);
                self.publish_outcome(&request_id, &token, result.map(|m: Model| json!(m.instance_id)))
                    .await;
            }
            Err(e) => {
                self.publish_status(&request_id, STATUS_FAILED, json!(e.to_string())).await;
            }
        }
    }

    async fn handle_add(&self, event: Event) {
        let payload = &event.payload;
        let request_id = payload.get("request_id").cloned().unwrap_or(Value::Null);
        let (Some(model_type), Some(instance_b64)) = (
            payload.get("model_type").and_then(Value::as_str),
            payload.get("instance").and_then(Value::as_str),
        ) else {
            self.publish_status(
                &request_id,
                STATUS_FAILED,
                json!("missing model_type or instance"),
            )
            .await;
            return;
        };

        let result = async {
            let instance = self.instance_from_b64(model_type, instance_b64).await?;
            let model = self.engine.add_instance(model_type, instance).await?;
            anyhow::Ok(model)
        }
        .await;

        match result {
            Ok(model) => {
                self.publish_status(&request_id, STATUS_DONE, json!(model.instance_id)).await;
            }
            Err(e) => {
                self.publish_status(&request_id, STATUS_FAILED, json!(e.to_string())).await;
            }
        }
    }

    async fn handle_update(&self, event: Event, prefix_len: usize) {
        let payload = &event.payload;
        let request_id = payload.get("request_id").cloned().unwrap_or(Value::Null);
        let Some(instance_id) = path_instance_id(&event.event_type, prefix_len) else {
            self.publish_status(&request_id, STATUS_FAILED, json!("missing instance id")).await;
            return;
        };
        let (Some(model_type), Some(instance_b64)) = (
            payload.get("model_type").and_then(Value::as_str),
            payload.get("instance").and_then(Value::as_str),
        ) else {
            self.publish_status(
                &request_id,
                STATUS_FAILED,
                json!("missing model_type or instance"),
            )
            .await;
            return;
        };

        let result = async {
            let instance = self.instance_from_b64(model_type, instance_b64).await?;
            self.engine
                .update_instance(Model {
                    instance_id,
                    model_type: model_type.to_string(),
                    instance,
                })
                .await?;
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => self.publish_status(&request_id, STATUS_DONE, json!(true)).await,
            Err(e) => {
                self.publish_status(&request_id, STATUS_FAILED, json!(e.to_string())).await;
            }
        }
    }

    async fn handle_fit(&self, event: Event, prefix_len: usize) {
        let payload = &event.payload;
        let request_id = payload.get("request_id").cloned().unwrap_or(Value::Null);
        let Some(instance_id) = path_instance_id(&event.event_type, prefix_len) else {
            self.publish_status(&request_id, STATUS_FAILED, json!("missing instance id")).await;
            return;
        };
        let args = args_from_json(payload.get("args"));
        let kwargs = kwargs_from_json(payload.get("kwargs"));

        match self.engine.fit(instance_id, args, kwargs).await {
            Ok(action) => {
                let token = action.cancellation_token();
                self.track(&request_id, token.clone());
                self.publish_status(&request_id, STATUS_IN_PROGRESS, Value::Null).await;
                let result = action.wait_result().await;
                self.untrack(&request_id);
                self.publish_outcome(&request_id, &token, result.map(|m| json!(m.instance_id)))
                    .await;
            }
            Err(e) => {
                self.publish_status(&request_id, STATUS_FAILED, json!(e.to_string())).await;
            }
        }
    }

    async fn handle_predict(&self, event: Event, prefix_len: usize) {
        let payload = &event.payload;
        let request_id = payload.get("request_id").cloned().unwrap_or(Value::Null);
        let Some(instance_id) = path_instance_id(&event.event_type, prefix_len) else {
            self.publish_status(&request_id, STATUS_FAILED, json!("missing instance id")).await;
            return;
        };
        let args = args_from_json(payload.get("args"));
        let kwargs = kwargs_from_json(payload.get("kwargs"));

        match self.engine.predict(instance_id, args, kwargs).await {
            Ok(action) => {
                let token = action.cancellation_token();
                self.track(&request_id, token.clone());
                self.publish_status(&request_id, STATUS_IN_PROGRESS, Value::Null).await;
                let result = action.wait_result().await;
                self.untrack(&request_id);
                self.publish_outcome(&request_id, &token, result).await;
            }
            Err(e) => {
                self.publish_status(&request_id, STATUS_FAILED, json!(e.to_string())).await;
            }
        }
    }

    fn handle_cancel(&self, event: &Event) {
        let request_id = event.payload.clone();
        let token = self.running.lock().get(&Self::request_key(&request_id)).cloned();
        match token {
            Some(token) => token.cancel(),
            None => debug!(request_id = %request_id, "cancel for unknown request"),
        }
    }

    async fn publish_outcome(
        &self,
        request_id: &Value,
        token: &CancellationToken,
        result: Result<Value, EngineError>,
    ) {
        match result {
            Ok(value) => self.publish_status(request_id, STATUS_DONE, value).await,
            Err(EngineError::ProcessTerminated) if token.is_cancelled() => {
                self.publish_status(request_id, STATUS_CANCELLED, Value::Null).await;
            }
            Err(e) => {
                self.publish_status(request_id, STATUS_FAILED, json!(e.to_string())).await;
            }
        }
    }
}

fn path_instance_id(event_type: &[String], prefix_len: usize) -> Option<u64> {
    event_type.get(prefix_len).and_then(|s| s.parse().ok())
}
