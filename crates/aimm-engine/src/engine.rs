//! The engine: model registry, per-instance locks and action pipelines.
//!
//! The engine owns the `models` and `actions` maps as copy-on-write
//! snapshots: every mutation replaces the snapshot and fires exactly one
//! notification, so subscribers always observe a consistent state. All user
//! code runs in worker processes; the engine itself only schedules,
//! publishes progress and persists results.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use aimm_core::backend::Backend;
use aimm_core::error::{EngineError, EngineResult};
use aimm_core::model::{Argument, CallArgs, DataAccess, Instance, Model};
use aimm_core::plugins::PluginRegistry;
use aimm_core::state::{CallbackHandle, CallbackRegistry, ReactiveState};

use crate::action::Action;
use crate::config::EngineConfig;
use crate::process::{ProcessHandler, ProcessPool, StateCallback, WorkerCommand, WorkerRequest};

/// Immutable engine-state snapshot.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    /// Registered models by instance id.
    pub models: HashMap<u64, Model>,
    /// Reactive action states by action id. Terminal entries are collected
    /// after the configured grace period.
    pub actions: HashMap<u64, Value>,
}

struct EngineShared {
    backend: Arc<dyn Backend>,
    registry: Arc<PluginRegistry>,
    pool: ProcessPool,
    state: Mutex<Arc<EngineState>>,
    callbacks: CallbackRegistry,
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
    action_ids: AtomicU64,
    action_grace_period: std::time::Duration,
    token: CancellationToken,
}

/// The central orchestrator owning models, actions, locks and the worker
/// pool. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Creates an engine over `backend`, repopulating the model registry
    /// from persisted state. Fails when the backend cannot be read.
    pub async fn create(
        conf: EngineConfig,
        command: WorkerCommand,
        backend: Arc<dyn Backend>,
        registry: Arc<PluginRegistry>,
    ) -> EngineResult<Engine> {
        let models = backend.get_models().await?;
        info!(models = models.len(), "restoring persisted models");

        let locks = models
            .iter()
            .map(|m| (m.instance_id, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        let state = EngineState {
            models: models.into_iter().map(|m| (m.instance_id, m)).collect(),
            actions: HashMap::new(),
        };
        let pool = ProcessPool::new(
            command,
            conf.max_children,
            conf.check_children_period,
            conf.sigterm_timeout,
        );
        let shared = Arc::new(EngineShared {
            backend: Arc::clone(&backend),
            registry,
            pool,
            state: Mutex::new(Arc::new(state)),
            callbacks: CallbackRegistry::new(),
            locks: Mutex::new(locks),
            action_ids: AtomicU64::new(1),
            action_grace_period: conf.action_grace_period,
            token: CancellationToken::new(),
        });

        // External replacements observed by the backend flow back into the
        // in-memory registry. Weak: the backend must not keep the engine
        // alive.
        let weak = Arc::downgrade(&shared);
        backend.register_model_change_callback(Arc::new(move |model| {
            if let Some(shared) = weak.upgrade() {
                shared.set_model(model);
            }
        }));

        Ok(Engine { shared })
    }

    /// Current engine-state snapshot.
    pub fn state(&self) -> Arc<EngineState> {
        Arc::clone(&self.shared.state.lock())
    }

    /// Subscribes to engine-state changes. Dropping the handle cancels the
    /// subscription.
    pub fn subscribe_to_state_change(
        &self,
        cb: impl Fn() + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.shared.callbacks.register(cb)
    }

    /// The plugin registry this engine dispatches through.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.shared.registry
    }

    /// Number of currently live worker processes.
    pub fn live_children(&self) -> usize {
        self.shared.pool.live_children()
    }

    /// Creates a model instance and registers it in the engine state.
    ///
    /// The instantiate plugin runs in a worker process; the backend then
    /// persists the instance and allocates its id.
    pub fn create_instance(
        &self,
        model_type: &str,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> EngineResult<Action<Model>> {
        self.shared.registry.instantiate(model_type)?;

        let meta = json!({
            "call": "create_instance",
            "model_type": model_type,
            "args": format!("{args:?}"),
            "kwargs": format!("{kwargs:?}"),
        });
        let ctx = ActionContext::new(&self.shared, meta);
        let shared = Arc::clone(&self.shared);
        let model_type = model_type.to_string();
        let (tx, rx) = oneshot::channel();
        let action = Action::new(ctx.action_id, ctx.token.clone(), rx);
        tokio::spawn(async move {
            let result = create_pipeline(&shared, &ctx, &model_type, args, kwargs).await;
            ctx.finish(&result);
            schedule_action_gc(&shared, ctx.action_id);
            let _ = tx.send(result);
        });
        Ok(action)
    }

    /// Adds an existing instance (typically deserialized) to the state,
    /// persisting it through the backend. No worker process is used.
    pub async fn add_instance(&self, model_type: &str, instance: Instance) -> EngineResult<Model> {
        let model = self.shared.backend.create_model(model_type, instance).await?;
        self.shared.set_model(model.clone());
        Ok(model)
    }

    /// Registers a replacement model under its existing id and persists it.
    pub async fn update_instance(&self, model: Model) -> EngineResult<()> {
        self.shared.set_model(model.clone());
        self.shared.backend.update_model(&model).await?;
        Ok(())
    }

    /// Fits an existing model instance.
    ///
    /// Suspends until the instance lock is acquired, then returns the
    /// action; the lock is held for the rest of the pipeline, so no other
    /// fit or predict touches the instance concurrently and actions on one
    /// instance run in call order. On success the produced instance
    /// replaces the registered one and is persisted.
    ///
    /// The persistence write is not interrupted by cancellation; if the
    /// write fails (or the action is closed during it) the in-memory
    /// instance keeps the fitted state and runs ahead of the store until
    /// the next successful update.
    pub async fn fit(
        &self,
        instance_id: u64,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> EngineResult<Action<Model>> {
        let model_type = self.shared.model(instance_id)?.model_type;
        self.shared.registry.fit(&model_type)?;

        // Acquired before the action id is allocated: lock-acquire order
        // equals action-id order for a given instance.
        let lock = self.shared.lock_for(instance_id)?;
        let guard = Arc::clone(&lock).lock_owned().await;
        let model = self.shared.model(instance_id)?;

        let meta = json!({
            "call": "fit",
            "model": instance_id,
            "args": format!("{args:?}"),
            "kwargs": format!("{kwargs:?}"),
        });
        let ctx = ActionContext::new(&self.shared, meta);
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = oneshot::channel();
        let action = Action::new(ctx.action_id, ctx.token.clone(), rx);
        tokio::spawn(async move {
            let result = fit_pipeline(&shared, &ctx, model, args, kwargs).await;
            drop(guard);
            ctx.finish(&result);
            schedule_action_gc(&shared, ctx.action_id);
            let _ = tx.send(result);
        });
        Ok(action)
    }

    /// Runs a prediction against an existing model instance.
    ///
    /// Acquires and holds the instance lock like [`fit`](Self::fit) but
    /// never modifies the model or the store.
    pub async fn predict(
        &self,
        instance_id: u64,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> EngineResult<Action<Value>> {
        let model_type = self.shared.model(instance_id)?.model_type;
        self.shared.registry.predict(&model_type)?;

        let lock = self.shared.lock_for(instance_id)?;
        let guard = Arc::clone(&lock).lock_owned().await;
        let model = self.shared.model(instance_id)?;

        let meta = json!({
            "call": "predict",
            "model": instance_id,
            "args": format!("{args:?}"),
            "kwargs": format!("{kwargs:?}"),
        });
        let ctx = ActionContext::new(&self.shared, meta);
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = oneshot::channel();
        let action = Action::new(ctx.action_id, ctx.token.clone(), rx);
        tokio::spawn(async move {
            let result = predict_pipeline(&shared, &ctx, model, args, kwargs).await;
            drop(guard);
            ctx.finish(&result);
            schedule_action_gc(&shared, ctx.action_id);
            let _ = tx.send(result);
        });
        Ok(action)
    }

    /// Shuts the engine down: in-flight actions fail, worker children are
    /// terminated and reaped.
    pub fn close(&self) {
        self.shared.token.cancel();
        self.shared.pool.close();
    }
}

impl EngineShared {
    fn model(&self, instance_id: u64) -> EngineResult<Model> {
        self.state
            .lock()
            .models
            .get(&instance_id)
            .cloned()
            .ok_or(EngineError::UnknownInstance { instance_id })
    }

    fn lock_for(&self, instance_id: u64) -> EngineResult<Arc<tokio::sync::Mutex<()>>> {
        self.locks
            .lock()
            .get(&instance_id)
            .cloned()
            .ok_or(EngineError::UnknownInstance { instance_id })
    }

    fn set_model(&self, model: Model) {
        self.locks
            .lock()
            .entry(model.instance_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        {
            let mut guard = self.state.lock();
            let mut state = (**guard).clone();
            state.models.insert(model.instance_id, model);
            *guard = Arc::new(state);
        }
        self.callbacks.notify();
    }

    fn update_action(&self, action_id: u64, value: Value) {
        {
            let mut guard = self.state.lock();
            let mut state = (**guard).clone();
            state.actions.insert(action_id, value);
            *guard = Arc::new(state);
        }
        self.callbacks.notify();
    }

    fn remove_action(&self, action_id: u64) {
        {
            let mut guard = self.state.lock();
            if !guard.actions.contains_key(&action_id) {
                return;
            }
            let mut state = (**guard).clone();
            state.actions.remove(&action_id);
            *guard = Arc::new(state);
        }
        self.callbacks.notify();
    }
}

// ─── Action context ─────────────────────────────────────────────────────────

/// Per-action reactive substate plus the cancellation token, shared between
/// the public handle and the pipeline task.
struct ActionContext {
    action_id: u64,
    token: CancellationToken,
    root: ReactiveState,
    _subscription: CallbackHandle,
}

impl ActionContext {
    fn new(shared: &Arc<EngineShared>, meta: Value) -> Self {
        let action_id = shared.action_ids.fetch_add(1, Ordering::SeqCst);
        let root = ReactiveState::new(json!({ "meta": meta }));

        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        let reader = root.clone();
        let subscription = root.subscribe(move || {
            if let Some(shared) = weak.upgrade() {
                shared.update_action(action_id, reader.state());
            }
        });
        // The action entry exists before its first status mutation.
        shared.update_action(action_id, root.state());

        Self {
            action_id,
            token: shared.token.child_token(),
            root,
            _subscription: subscription,
        }
    }

    fn set_progress(&self, progress: &str) {
        let progress = json!(progress);
        self.root.update_with(move |value| {
            if !value.is_object() {
                *value = json!({});
            }
            value["progress"] = progress;
        });
    }

    fn finish<T>(&self, result: &EngineResult<T>) {
        let status = match result {
            Ok(_) => "complete",
            Err(EngineError::ProcessTerminated) if self.token.is_cancelled() => "cancelled",
            Err(_) => "failed",
        };
        self.set_progress(status);
    }

    fn action_sink(&self) -> StateCallback {
        let substate = self.root.register_substate("action");
        Arc::new(move |value| substate.update(value))
    }

    fn data_access_substate(&self) -> ReactiveState {
        self.root.register_substate("data_access")
    }
}

fn schedule_action_gc(shared: &Arc<EngineShared>, action_id: u64) {
    let weak = Arc::downgrade(shared);
    let grace = shared.action_grace_period;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if let Some(shared) = weak.upgrade() {
            debug!(action_id, "collecting terminal action entry");
            shared.remove_action(action_id);
        }
    });
}

// ─── Pipelines ──────────────────────────────────────────────────────────────

async fn create_pipeline(
    shared: &Arc<EngineShared>,
    ctx: &ActionContext,
    model_type: &str,
    args: Vec<Argument>,
    kwargs: BTreeMap<String, Argument>,
) -> EngineResult<Model> {
    ctx.set_progress("accessing_data");
    let call_args = resolve_data_access(shared, ctx, args, kwargs).await?;

    ctx.set_progress("executing");
    let instance = run_in_pool(
        shared,
        ctx,
        WorkerRequest::Instantiate {
            model_type: model_type.to_string(),
            call_args,
        },
    )
    .await?;

    ctx.set_progress("storing");
    let model = shared.backend.create_model(model_type, instance).await?;
    shared.set_model(model.clone());
    Ok(model)
}

async fn fit_pipeline(
    shared: &Arc<EngineShared>,
    ctx: &ActionContext,
    model: Model,
    args: Vec<Argument>,
    kwargs: BTreeMap<String, Argument>,
) -> EngineResult<Model> {
    ctx.set_progress("accessing_data");
    let call_args = resolve_data_access(shared, ctx, args, kwargs).await?;

    ctx.set_progress("executing");
    let new_instance = run_in_pool(
        shared,
        ctx,
        WorkerRequest::Fit {
            model_type: model.model_type.clone(),
            instance: model.instance.clone(),
            call_args,
        },
    )
    .await?;

    let new_model = model.replace_instance(new_instance);
    shared.set_model(new_model.clone());

    ctx.set_progress("storing");
    shared.backend.update_model(&new_model).await?;
    Ok(new_model)
}

async fn predict_pipeline(
    shared: &Arc<EngineShared>,
    ctx: &ActionContext,
    model: Model,
    args: Vec<Argument>,
    kwargs: BTreeMap<String, Argument>,
) -> EngineResult<Value> {
    ctx.set_progress("accessing_data");
    let call_args = resolve_data_access(shared, ctx, args, kwargs).await?;

    ctx.set_progress("executing");
    run_in_pool(
        shared,
        ctx,
        WorkerRequest::Predict {
            model_type: model.model_type.clone(),
            instance: model.instance.clone(),
            call_args,
        },
    )
    .await
}

async fn run_in_pool(
    shared: &Arc<EngineShared>,
    ctx: &ActionContext,
    request: WorkerRequest,
) -> EngineResult<Value> {
    let handler = shared.pool.create_handler(ctx.action_sink());
    handler.run(request);
    tokio::select! {
        _ = ctx.token.cancelled() => {
            handler.close();
            // Resolves once the child is reaped.
            handler.wait_result().await.map_err(EngineError::from)
        }
        result = handler.wait_result() => result.map_err(EngineError::from),
    }
}

/// Identifies one placeholder slot. Positional indices and keyword names
/// are distinct namespaces: a keyword literally named `"0"` must not alias
/// the first positional argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AccessKey {
    Positional(usize),
    Keyword(String),
}

impl AccessKey {
    fn label(&self) -> String {
        match self {
            Self::Positional(index) => index.to_string(),
            Self::Keyword(name) => name.clone(),
        }
    }
}

/// Resolves every [`DataAccess`] placeholder by running its plugin in a
/// parallel worker. Progress is published under `data_access.args.<index>`
/// and `data_access.kwargs.<name>`.
async fn resolve_data_access(
    shared: &Arc<EngineShared>,
    ctx: &ActionContext,
    args: Vec<Argument>,
    kwargs: BTreeMap<String, Argument>,
) -> EngineResult<CallArgs> {
    let substate = ctx.data_access_substate();
    let args_substate = substate.register_substate("args");
    let kwargs_substate = substate.register_substate("kwargs");
    let mut handlers: Vec<(AccessKey, ProcessHandler)> = Vec::new();

    let mut out_args: Vec<Value> = Vec::with_capacity(args.len());
    let mut pending_args: Vec<usize> = Vec::new();
    for (i, arg) in args.into_iter().enumerate() {
        match arg {
            Argument::Value(value) => out_args.push(value),
            Argument::DataAccess(access) => {
                let key = AccessKey::Positional(i);
                out_args.push(Value::Null);
                let handler = spawn_data_access(shared, &args_substate, &key.label(), access);
                handlers.push((key, handler));
                pending_args.push(i);
            }
        }
    }

    let mut out_kwargs: BTreeMap<String, Value> = BTreeMap::new();
    let mut pending_kwargs: Vec<String> = Vec::new();
    for (name, value) in kwargs {
        match value {
            Argument::Value(value) => {
                out_kwargs.insert(name, value);
            }
            Argument::DataAccess(access) => {
                let handler = spawn_data_access(shared, &kwargs_substate, &name, access);
                handlers.push((AccessKey::Keyword(name.clone()), handler));
                pending_kwargs.push(name);
            }
        }
    }

    if !handlers.is_empty() {
        let waits = futures::future::join_all(handlers.iter().map(|(key, handler)| {
            let key = key.clone();
            let wait = handler.wait_result();
            async move { (key, wait.await) }
        }));
        let results = tokio::select! {
            _ = ctx.token.cancelled() => {
                for (_, handler) in &handlers {
                    handler.close();
                }
                return Err(EngineError::ProcessTerminated);
            }
            results = waits => results,
        };

        let mut resolved: HashMap<AccessKey, Value> = HashMap::new();
        for (key, result) in results {
            match result {
                Ok(value) => {
                    resolved.insert(key, value);
                }
                Err(e) => {
                    return Err(EngineError::DataAccess {
                        key: key.label(),
                        message: e.to_string(),
                    });
                }
            }
        }
        for i in pending_args {
            if let Some(value) = resolved.remove(&AccessKey::Positional(i)) {
                out_args[i] = value;
            }
        }
        for name in pending_kwargs {
            if let Some(value) = resolved.remove(&AccessKey::Keyword(name.clone())) {
                out_kwargs.insert(name, value);
            }
        }
    }

    Ok(CallArgs {
        args: out_args,
        kwargs: out_kwargs,
    })
}

fn spawn_data_access(
    shared: &Arc<EngineShared>,
    substate: &ReactiveState,
    key: &str,
    access: DataAccess,
) -> ProcessHandler {
    let child = substate.register_substate(key);
    let handler = shared
        .pool
        .create_handler(Arc::new(move |value| child.update(value)));
    handler.run(WorkerRequest::DataAccess {
        name: access.name,
        call_args: CallArgs {
            args: access.args,
            kwargs: access.kwargs,
        },
    });
    handler
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use aimm_core::backend::Backend;
    use aimm_core::error::{BackendError, BackendResult};
    use aimm_core::plugins::{
        DeserializePlugin, FitPlugin, InstantiatePlugin, ModelPlugins, PredictPlugin,
        SerializePlugin,
    };
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    struct MemoryBackend {
        models: Mutex<HashMap<u64, Model>>,
        next_id: AtomicU64,
    }

    impl MemoryBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                models: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            })
        }
    }

    #[async_trait]
    impl Backend for MemoryBackend {
        async fn get_models(&self) -> BackendResult<Vec<Model>> {
            Ok(self.models.lock().values().cloned().collect())
        }

        async fn create_model(&self, model_type: &str, instance: Instance) -> BackendResult<Model> {
            let model = Model {
                instance_id: self.next_id.fetch_add(1, Ordering::SeqCst),
                model_type: model_type.to_string(),
                instance,
            };
            self.models.lock().insert(model.instance_id, model.clone());
            Ok(model)
        }

        async fn update_model(&self, model: &Model) -> BackendResult<()> {
            self.models.lock().insert(model.instance_id, model.clone());
            Ok(())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl Backend for FailingBackend {
        async fn get_models(&self) -> BackendResult<Vec<Model>> {
            Err(BackendError::Unavailable("store offline".to_string()))
        }

        async fn create_model(&self, _: &str, _: Instance) -> BackendResult<Model> {
            Err(BackendError::Unavailable("store offline".to_string()))
        }

        async fn update_model(&self, _: &Model) -> BackendResult<()> {
            Err(BackendError::Unavailable("store offline".to_string()))
        }
    }

    /// Registry whose model plugins are never executed locally; the engine
    /// only consults it for dispatch checks while the shell worker fakes
    /// the child side.
    fn stub_registry() -> Arc<PluginRegistry> {
        let registry = PluginRegistry::new();
        registry
            .register_model(
                "demo",
                ModelPlugins {
                    instantiate: InstantiatePlugin::new(|_| Ok(json!(null))),
                    fit: FitPlugin::new(|_| Ok(json!(null))),
                    predict: PredictPlugin::new(|_| Ok(json!(null))),
                    serialize: SerializePlugin::new(|_| Ok(Vec::new())),
                    deserialize: DeserializePlugin::new(|_| Ok(json!(null))),
                },
            )
            .unwrap();
        Arc::new(registry)
    }

    fn shell_worker(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn test_conf() -> EngineConfig {
        EngineConfig {
            max_children: 2,
            check_children_period: Duration::from_millis(20),
            sigterm_timeout: Duration::from_secs(2),
            action_grace_period: Duration::from_millis(100),
        }
    }

    async fn engine_with(script: &str) -> Engine {
        Engine::create(
            test_conf(),
            shell_worker(script),
            MemoryBackend::new(),
            stub_registry(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_backend_failure_fails_startup() {
        let result = Engine::create(
            test_conf(),
            shell_worker("exit 0"),
            Arc::new(FailingBackend),
            stub_registry(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Backend(_))));
    }

    #[tokio::test]
    async fn test_create_instance_registers_model() {
        let engine = engine_with(r#"echo '{"type":"success","value":{"x":1}}'"#).await;
        let action = engine
            .create_instance("demo", Vec::new(), BTreeMap::new())
            .unwrap();
        let model = action.wait_result().await.unwrap();
        assert_eq!(model.instance_id, 1);
        assert_eq!(model.instance, json!({"x": 1}));
        assert_eq!(
            engine.state().models.get(&1).unwrap().instance,
            json!({"x": 1})
        );
        engine.close();
    }

    #[tokio::test]
    async fn test_create_instance_unknown_plugin() {
        let engine = engine_with("exit 0").await;
        let err = engine
            .create_instance("missing", Vec::new(), BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Registry(_)));
        engine.close();
    }

    #[tokio::test]
    async fn test_fit_unknown_instance() {
        let engine = engine_with("exit 0").await;
        let err = engine.fit(77, Vec::new(), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownInstance { instance_id: 77 }));
        engine.close();
    }

    /// On the multi-thread scheduler, actions against one instance must
    /// still complete in action-id order: the lock is acquired in call
    /// order, before the pipeline task is spawned.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_instance_actions_complete_in_id_order() {
        let engine =
            engine_with(r#"sleep 0.1; echo '{"type":"success","value":1}'"#).await;
        engine.add_instance("demo", json!(null)).await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            waiters.push(tokio::spawn(async move {
                let action = engine.fit(1, Vec::new(), BTreeMap::new()).await.unwrap();
                let action_id = action.id();
                action.wait_result().await.unwrap();
                (action_id, std::time::Instant::now())
            }));
        }

        let mut completions = Vec::new();
        for waiter in waiters {
            completions.push(waiter.await.unwrap());
        }
        completions.sort_by_key(|(_, finished)| *finished);
        let ids: Vec<u64> = completions.iter().map(|(id, _)| *id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "completions out of action-id order");

        engine.close();
    }

    #[tokio::test]
    async fn test_failed_worker_leaves_models_unchanged() {
        let engine = engine_with(r#"echo '{"type":"failure","message":"bad data"}'"#).await;
        let action = engine
            .create_instance("demo", Vec::new(), BTreeMap::new())
            .unwrap();
        let err = action.wait_result().await.unwrap_err();
        assert!(matches!(err, EngineError::Plugin { .. }));
        assert!(engine.state().models.is_empty());
        engine.close();
    }

    #[tokio::test]
    async fn test_cancelled_action_reports_terminated() {
        let engine = engine_with("sleep 30").await;
        let action = engine
            .create_instance("demo", Vec::new(), BTreeMap::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        action.close();
        assert!(matches!(
            action.wait_result().await,
            Err(EngineError::ProcessTerminated)
        ));
        assert!(engine.state().models.is_empty());
        engine.close();
    }

    #[tokio::test]
    async fn test_action_entry_published_and_collected() {
        let engine = engine_with(r#"echo '{"type":"success","value":1}'"#).await;
        let action = engine
            .create_instance("demo", Vec::new(), BTreeMap::new())
            .unwrap();
        let action_id = action.id();
        assert!(engine.state().actions.contains_key(&action_id));
        action.wait_result().await.unwrap();

        let terminal = engine.state().actions.get(&action_id).cloned().unwrap();
        assert_eq!(terminal["progress"], json!("complete"));

        // Collected after the grace period.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!engine.state().actions.contains_key(&action_id));
        engine.close();
    }

    #[tokio::test]
    async fn test_add_and_update_instance() {
        let engine = engine_with("exit 0").await;
        let model = engine.add_instance("demo", json!([1])).await.unwrap();
        assert_eq!(model.instance_id, 1);

        engine
            .update_instance(model.replace_instance(json!([1, 2])))
            .await
            .unwrap();
        assert_eq!(engine.state().models.get(&1).unwrap().instance, json!([1, 2]));
        engine.close();
    }

    #[tokio::test]
    async fn test_state_subscription_fires_on_change() {
        let engine = engine_with("exit 0").await;
        let hits = Arc::new(AtomicU64::new(0));
        let hits_cb = Arc::clone(&hits);
        let _sub = engine.subscribe_to_state_change(move || {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        engine.add_instance("demo", json!(null)).await.unwrap();
        assert!(hits.load(Ordering::SeqCst) >= 1);
        engine.close();
    }
}
