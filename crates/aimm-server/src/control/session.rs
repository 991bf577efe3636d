//! Interactive session control.
//!
//! Listens on TCP and speaks newline-delimited JSON. A session starts with
//! a `login` request carrying a username and the hex SHA-256 of the
//! password; every other request on an unauthenticated session fails with
//! `unauthorized` and closes the connection. After login the engine state
//! is pushed to the session on every change, and the session may issue
//! `create_instance`, `add_instance`, `update_instance`, `fit`, `predict`
//! and `logout` requests. Model payloads travel as
//! `{instance_id, model_type, instance}` descriptors with the instance
//! base64-encoded through the serialize/deserialize plugins.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aimm_core::control::Control;
use aimm_core::event::Event;
use aimm_core::model::Model;
use aimm_core::plugins::{exec_deserialize, exec_serialize};
use aimm_engine::Engine;

use crate::config::SessionControlConfig;
use crate::control::envelope::{args_from_json, kwargs_from_json};

/// Control exposing the engine over interactive TCP sessions.
pub struct SessionControl {
    inner: Arc<SessionInner>,
    local_addr: std::net::SocketAddr,
}

struct SessionInner {
    engine: Engine,
    conf: SessionControlConfig,
    token: CancellationToken,
}

impl SessionControl {
    /// Binds the listener and starts accepting sessions.
    pub async fn create(conf: SessionControlConfig, engine: Engine) -> std::io::Result<Self> {
        let listener = TcpListener::bind((conf.host.as_str(), conf.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "session control listening");

        let inner = Arc::new(SessionInner {
            engine,
            conf,
            token: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(Arc::clone(&inner), listener));

        Ok(Self { inner, local_addr })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Control for SessionControl {
    async fn process_events(&self, events: Vec<Event>) {
        debug!(count = events.len(), "session control ignores bus events");
    }

    async fn close(&self) {
        self.inner.token.cancel();
    }
}

async fn accept_loop(inner: Arc<SessionInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "session connected");
                    tokio::spawn(connection_loop(Arc::clone(&inner), stream));
                }
                Err(e) => {
                    warn!(error = %e, "session accept failed");
                    break;
                }
            }
        }
    }
}

async fn connection_loop(inner: Arc<SessionInner>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&message) else {
                continue;
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    // Login gate.
    let authenticated = match lines.next_line().await {
        Ok(Some(line)) => {
            let message: Value = serde_json::from_str(&line).unwrap_or(Value::Null);
            message.get("type").and_then(Value::as_str) == Some("login")
                && inner.check_login(message.get("data"))
        }
        _ => false,
    };
    if !authenticated {
        let _ = tx.send(json!({
            "type": "result",
            "success": false,
            "exception": "unauthorized",
        }));
        drop(tx);
        let _ = writer.await;
        return;
    }
    let _ = tx.send(json!({"type": "login_success"}));

    // Push the current state and every later change.
    send_state(&inner.engine, &tx).await;
    let state_tx = tx.clone();
    let state_engine = inner.engine.clone();
    let _state_subscription = inner.engine.subscribe_to_state_change(move || {
        let tx = state_tx.clone();
        let engine = state_engine.clone();
        tokio::spawn(async move {
            send_state(&engine, &tx).await;
        });
    });

    loop {
        let line = tokio::select! {
            _ = inner.token.cancelled() => break,
            line = lines.next_line() => line,
        };
        let message = match line {
            Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                Ok(message) => message,
                Err(e) => {
                    let _ = tx.send(error_response(&format!("malformed request: {e}")));
                    continue;
                }
            },
            _ => break,
        };

        let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind == "logout" {
            let _ = tx.send(json!({"type": "result", "success": true}));
            break;
        }
        let data = message.get("data").cloned().unwrap_or(Value::Null);
        let response = handle_request(&inner.engine, kind, data).await;
        if tx.send(response).is_err() {
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
    debug!("session closed");
}

impl SessionInner {
    fn check_login(&self, data: Option<&Value>) -> bool {
        let Some(data) = data else {
            return false;
        };
        let (Some(username), Some(password_sha256)) = (
            data.get("username").and_then(Value::as_str),
            data.get("password_sha256").and_then(Value::as_str),
        ) else {
            return false;
        };
        self.conf.users.iter().any(|user| {
            user.username == username
                && user.password_sha256.eq_ignore_ascii_case(password_sha256)
        })
    }
}

async fn handle_request(engine: &Engine, kind: &str, data: Value) -> Value {
    let result = match kind {
        "create_instance" => handle_create(engine, &data).await,
        "add_instance" => handle_add(engine, &data).await,
        "update_instance" => handle_update(engine, &data).await,
        "fit" => handle_fit(engine, &data).await,
        "predict" => handle_predict(engine, &data).await,
        other => Err(anyhow::anyhow!("unknown request type '{other}'")),
    };
    result.unwrap_or_else(|e| error_response(&format!("{e:#}")))
}

async fn handle_create(engine: &Engine, data: &Value) -> anyhow::Result<Value> {
    let model_type = str_field(data, "model_type")?;
    let args = args_from_json(data.get("args"));
    let kwargs = kwargs_from_json(data.get("kwargs"));
    let action = engine.create_instance(model_type, args, kwargs)?;
    let model = action.wait_result().await?;
    model_response(engine, &model).await
}

async fn handle_add(engine: &Engine, data: &Value) -> anyhow::Result<Value> {
    let model_type = str_field(data, "model_type")?;
    let instance = instance_from_b64(engine, model_type, str_field(data, "instance")?).await?;
    let model = engine.add_instance(model_type, instance).await?;
    model_response(engine, &model).await
}

async fn handle_update(engine: &Engine, data: &Value) -> anyhow::Result<Value> {
    let model_type = str_field(data, "model_type")?;
    let instance_id = data
        .get("instance_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("missing instance_id"))?;
    let instance = instance_from_b64(engine, model_type, str_field(data, "instance")?).await?;
    let model = Model {
        instance_id,
        model_type: model_type.to_string(),
        instance,
    };
    engine.update_instance(model.clone()).await?;
    model_response(engine, &model).await
}

async fn handle_fit(engine: &Engine, data: &Value) -> anyhow::Result<Value> {
    let instance_id = data
        .get("instance_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("missing instance_id"))?;
    let args = args_from_json(data.get("args"));
    let kwargs = kwargs_from_json(data.get("kwargs"));
    let action = engine.fit(instance_id, args, kwargs).await?;
    let model = action.wait_result().await?;
    model_response(engine, &model).await
}

async fn handle_predict(engine: &Engine, data: &Value) -> anyhow::Result<Value> {
    let instance_id = data
        .get("instance_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("missing instance_id"))?;
    let args = args_from_json(data.get("args"));
    let kwargs = kwargs_from_json(data.get("kwargs"));
    let action = engine.predict(instance_id, args, kwargs).await?;
    let prediction = action.wait_result().await?;
    Ok(json!({
        "type": "result",
        "success": true,
        "result": prediction,
    }))
}

fn str_field<'a>(data: &'a Value, field: &str) -> anyhow::Result<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing {field}"))
}

fn error_response(message: &str) -> Value {
    json!({
        "type": "result",
        "success": false,
        "exception": message,
    })
}

async fn model_response(engine: &Engine, model: &Model) -> anyhow::Result<Value> {
    Ok(json!({
        "type": "result",
        "success": true,
        "model": model_to_json(engine, model).await?,
    }))
}

async fn model_to_json(engine: &Engine, model: &Model) -> anyhow::Result<Value> {
    let registry = Arc::clone(engine.registry());
    let model_type = model.model_type.clone();
    let instance = model.instance.clone();
    let blob =
        tokio::task::spawn_blocking(move || exec_serialize(&registry, &model_type, &instance))
            .await??;
    Ok(json!({
        "instance_id": model.instance_id,
        "model_type": model.model_type,
        "instance": BASE64.encode(blob),
    }))
}

async fn instance_from_b64(
    engine: &Engine,
    model_type: &str,
    instance_b64: &str,
) -> anyhow::Result<Value> {
    let blob = BASE64.decode(instance_b64)?;
    let registry = Arc::clone(engine.registry());
    let model_type = model_type.to_string();
    let instance =
        tokio::task::spawn_blocking(move || exec_deserialize(&registry, &model_type, &blob))
            .await??;
    Ok(instance)
}

async fn send_state(engine: &Engine, tx: &mpsc::UnboundedSender<Value>) {
    let state = engine.state();
    let mut models = serde_json::Map::new();
    for model in state.models.values() {
        match model_to_json(engine, model).await {
            Ok(descriptor) => {
                models.insert(model.instance_id.to_string(), descriptor);
            }
            Err(e) => debug!(error = %e, "skipping unserialisable model in state push"),
        }
    }
    let actions: serde_json::Map<String, Value> = state
        .actions
        .iter()
        .map(|(id, value)| (id.to_string(), value.clone()))
        .collect();
    let _ = tx.send(json!({
        "type": "state",
        "data": { "models": models, "actions": actions },
    }));
}
