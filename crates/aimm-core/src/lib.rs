//! # AIMM Core
//!
//! Core types and contracts of the AIMM model-manager server.
//!
//! This crate holds everything the engine, the backends and the controls
//! agree on, without any runtime machinery:
//!
//! - **Model types**: [`Model`], the opaque [`Instance`], [`DataAccess`]
//!   placeholders and [`CallArgs`] crossing the worker boundary.
//! - **Plugin system**: the six plugin kinds, their descriptors with calling
//!   conventions, the per-engine [`PluginRegistry`] and the dispatch shims
//!   ([`exec_instantiate`], [`exec_fit`], …).
//! - **Reactive state**: [`ReactiveState`], the hierarchical observable
//!   value the engine publishes action progress through.
//! - **Event types**: [`Event`], [`RegisterEvent`] and [`Subscription`]
//!   matching for the event-bus plumbing.
//! - **Contracts**: the [`Backend`] and [`Control`] traits the runner
//!   composes around the engine.
//! - **Errors**: one `thiserror` enum per concern, all `Clone` so action
//!   results can be fanned out.

pub mod backend;
pub mod control;
pub mod error;
pub mod event;
pub mod model;
pub mod plugins;
pub mod state;

pub use backend::{Backend, ModelChangeCallback};
pub use control::Control;
pub use error::{
    BackendError, BackendResult, EngineError, EngineResult, ExecuteError, ExecuteResult,
    RegistryError, RegistryResult,
};
pub use event::{Event, EventType, RegisterEvent, Subscription};
pub use model::{Argument, CallArgs, DataAccess, Instance, Model};
pub use plugins::{
    Call, DataAccessPlugin, DeserializePlugin, FitPlugin, InstantiatePlugin, ModelPlugins,
    PluginKind, PluginRegistry, PredictPlugin, SerializePlugin, StateSink, exec_data_access,
    exec_deserialize, exec_fit, exec_instantiate, exec_predict, exec_serialize,
};
pub use state::{CallbackHandle, CallbackRegistry, ReactiveState};
