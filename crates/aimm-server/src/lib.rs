//! # AIMM Server
//!
//! Runtime composition of the AIMM model-manager: configuration loading and
//! validation, logging setup, the persistence backends (dummy, sqlite,
//! event-bus), the control planes (event-bus, interactive session), named
//! plugin sets and the top-level [`Runner`] that supervises them around the
//! engine.
//!
//! The `aimm-server` binary built from this crate doubles as the worker
//! executable: its hidden `worker` mode re-registers the configured plugin
//! sets and executes a single plugin call for the pool.

pub mod backend;
pub mod config;
pub mod control;
pub mod logging;
pub mod plugins;
pub mod runner;

pub use config::{AimmConfig, load_config_from_file, load_config_from_str, validate_config};
pub use logging::LoggingBuilder;
pub use runner::{Runner, RunnerError};
