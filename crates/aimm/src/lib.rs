//! # AIMM
//!
//! Artificial Intelligence Model Manager: a long-running service hosting
//! the lifecycle of user-supplied model instances — create, fit, predict,
//! serialize — with every plugin call dispatched to an isolated worker
//! process, pluggable storage backends and multiple remote control planes.
//!
//! This facade re-exports the workspace crates:
//!
//! - [`core`]: model types, plugin registry, reactive state, contracts
//! - [`engine`]: worker-process pool, actions, the scheduling engine
//! - [`event`]: event-bus client plumbing
//! - [`server`]: backends, controls, configuration and the runner
//!
//! ## Embedding
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use aimm::core::plugins::PluginRegistry;
//! use aimm::engine::{Engine, EngineConfig, WorkerCommand};
//! use aimm::server::backend::DummyBackend;
//!
//! let registry = Arc::new(PluginRegistry::new());
//! // register plugins …
//! let engine = Engine::create(
//!     EngineConfig::default(),
//!     WorkerCommand { program: std::env::current_exe()?, args: vec!["worker".into()] },
//!     Arc::new(DummyBackend::new()),
//!     registry,
//! )
//! .await?;
//! let action = engine.create_instance("my.model", vec![], Default::default())?;
//! let model = action.wait_result().await?;
//! ```

pub use aimm_core as core;
pub use aimm_engine as engine;
pub use aimm_event as event;
pub use aimm_server as server;
