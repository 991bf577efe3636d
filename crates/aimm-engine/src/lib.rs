//! # AIMM Engine
//!
//! The scheduling core of the AIMM model-manager server.
//!
//! The engine unites a global worker-process cap, per-model mutual
//! exclusion, cancellation across process boundaries and reactive state
//! fan-out:
//!
//! - [`ProcessPool`]: admits at most `max_children` concurrent child
//!   processes, spawns isolated workers and relays their results, progress
//!   and cancellation (SIGTERM with SIGKILL escalation).
//! - [`run_worker`]: the child-side entry point executed by the server
//!   binary's hidden worker mode.
//! - [`Engine`]: owns the model registry, per-instance locks, action
//!   identity and the create/fit/predict pipelines, publishing progress
//!   through the reactive state tree.
//! - [`Action`]: the caller's handle on one in-flight operation, with a
//!   shared result and cancellation.
//!
//! All user plugin code executes in child processes; the engine's own maps
//! are copy-on-write snapshots mutated only on its scheduling context.

pub mod action;
pub mod config;
pub mod engine;
pub mod process;
pub mod worker;

pub use action::Action;
pub use config::EngineConfig;
pub use engine::{Engine, EngineState};
pub use process::{
    ProcessError, ProcessHandler, ProcessPool, StateCallback, WorkerCommand, WorkerFrame,
    WorkerRequest,
};
pub use worker::run_worker;
