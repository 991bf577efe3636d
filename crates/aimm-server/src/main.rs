//! `aimm-server` binary.
//!
//! `aimm-server --conf <path>` runs the server until SIGINT/SIGTERM.
//! The hidden `worker` subcommand is spawned by the worker pool: it
//! re-registers the plugin sets passed on the command line and executes a
//! single plugin call read from stdin.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use tracing::{error, info};

use aimm_core::plugins::PluginRegistry;
use aimm_engine::WorkerCommand;
use aimm_server::config::ControlConfig;
use aimm_server::{AimmConfig, LoggingBuilder, Runner, load_config_from_file};

fn cli() -> Command {
    Command::new("aimm-server")
        .about("Artificial Intelligence Model Manager server")
        .arg(
            Arg::new("conf")
                .long("conf")
                .value_name("path")
                .default_value("aimm.yaml")
                .help("Configuration file path"),
        )
        .subcommand(
            Command::new("worker").hide(true).arg(
                Arg::new("sets")
                    .long("sets")
                    .action(ArgAction::Append)
                    .value_delimiter(',')
                    .help("Plugin sets to register"),
            ),
        )
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    if let Some(worker_matches) = matches.subcommand_matches("worker") {
        let sets: Vec<String> = worker_matches
            .get_many::<String>("sets")
            .map(|sets| sets.cloned().collect())
            .unwrap_or_default();
        return worker_main(&sets);
    }

    let conf_path = matches
        .get_one::<String>("conf")
        .cloned()
        .unwrap_or_else(|| "aimm.yaml".to_string());
    server_main(&conf_path)
}

fn worker_main(sets: &[String]) -> ExitCode {
    // Workers own stdout for result frames; logs go to stderr.
    LoggingBuilder::new().with_stderr().init();

    let registry = match aimm_server::plugins::build_registry(sets) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "worker failed to build plugin registry");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build worker runtime");
            return ExitCode::from(1);
        }
    };
    let code = runtime.block_on(aimm_engine::run_worker(registry));
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn server_main(conf_path: &str) -> ExitCode {
    let conf = match load_config_from_file(conf_path) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("aimm-server: {e}");
            return ExitCode::from(2);
        }
    };
    LoggingBuilder::new().with_level(conf.log.level.clone()).init();

    let registry = match aimm_server::plugins::build_registry(&conf.plugins.sets) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "failed to build plugin registry");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run_server(&conf, registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::from(1)
        }
    }
}

async fn run_server(
    conf: &AimmConfig,
    registry: Arc<PluginRegistry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker_command = worker_command(&conf.plugins.sets)?;

    // Bus-driven components run against the in-process bus unless a
    // networked client is wired in through the library API.
    let connection = if needs_event_client(conf) {
        let bus = aimm_event::LocalBus::new();
        let mut subscription = aimm_core::event::Subscription::default();
        if let Some(backend_sub) = aimm_server::backend::backend_subscription(&conf.backend) {
            subscription = subscription.union(&backend_sub);
        }
        for control in &conf.controls {
            if let Some(control_sub) = aimm_server::control::control_subscription(control) {
                subscription = subscription.union(&control_sub);
            }
        }
        Some(bus.connect(subscription))
    } else {
        None
    };

    let runner = Runner::create(conf, registry, worker_command, connection).await?;
    info!("aimm server running");

    wait_for_shutdown(&runner).await;

    runner.close().await;
    Ok(())
}

fn needs_event_client(conf: &AimmConfig) -> bool {
    matches!(conf.backend, aimm_server::config::BackendConfig::Event { .. })
        || conf
            .controls
            .iter()
            .any(|c| matches!(c, ControlConfig::Event(_)))
}

fn worker_command(sets: &[String]) -> std::io::Result<WorkerCommand> {
    let program = std::env::current_exe()?;
    let mut args = vec!["worker".to_string()];
    if !sets.is_empty() {
        args.push("--sets".to_string());
        args.push(sets.join(","));
    }
    Ok(WorkerCommand { program, args })
}

async fn wait_for_shutdown(runner: &Runner) {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                runner.closed().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = runner.closed() => info!("runner closed, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
            _ = runner.closed() => info!("runner closed, shutting down"),
        }
    }
}
