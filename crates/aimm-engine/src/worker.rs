//! Worker-process entry point.
//!
//! The pool spawns the server binary in worker mode; that mode rebuilds the
//! plugin registry and calls [`run_worker`]. The worker reads one request
//! line from stdin, executes the plugin on a blocking thread, streams
//! progress frames to stdout and finishes with exactly one terminal frame.
//!
//! A termination signal delivered while the plugin is still running produces
//! a recognisable `terminated` frame before the process exits, so the parent
//! can tell a cancelled call from a crash even when the frame wins the race
//! against the signal's exit.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use aimm_core::error::ExecuteError;
use aimm_core::plugins::{
    PluginRegistry, StateSink, exec_data_access, exec_fit, exec_instantiate, exec_predict,
};

use crate::process::{WorkerFrame, WorkerRequest};

/// Writes frames as JSON lines on stdout. Sending is best effort: a closed
/// or saturated pipe drops the frame instead of blocking the plugin.
#[derive(Clone)]
struct FrameWriter {
    out: Arc<Mutex<std::io::Stdout>>,
}

impl FrameWriter {
    fn new() -> Self {
        Self {
            out: Arc::new(Mutex::new(std::io::stdout())),
        }
    }

    fn write(&self, frame: &WorkerFrame) {
        let Ok(mut line) = serde_json::to_vec(frame) else {
            return;
        };
        line.push(b'\n');
        let mut out = self.out.lock();
        let _ = out.write_all(&line);
        let _ = out.flush();
    }
}

/// Runs one worker call to completion. Returns the process exit code.
pub async fn run_worker(registry: Arc<PluginRegistry>) -> i32 {
    let writer = FrameWriter::new();

    let request = {
        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = stdin.read_line(&mut line).await {
            error!(error = %e, "failed to read worker request");
            return 1;
        }
        match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "malformed worker request");
                writer.write(&WorkerFrame::Failure {
                    message: format!("malformed worker request: {e}"),
                });
                return 1;
            }
        }
    };

    let state_writer = writer.clone();
    let sink = StateSink::new(move |value: Value| {
        state_writer.write(&WorkerFrame::State { value });
    });

    let call = tokio::task::spawn_blocking(move || execute(&registry, request, sink));

    #[cfg(unix)]
    let terminated = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        _ = terminated => {
            writer.write(&WorkerFrame::Terminated);
            143
        }
        result = call => {
            match result {
                Ok(Ok(value)) => {
                    writer.write(&WorkerFrame::Success { value });
                    0
                }
                Ok(Err(e)) => {
                    writer.write(&WorkerFrame::Failure {
                        message: e.to_string(),
                    });
                    0
                }
                Err(join_error) => {
                    writer.write(&WorkerFrame::Failure {
                        message: format!("plugin panicked: {join_error}"),
                    });
                    1
                }
            }
        }
    }
}

fn execute(
    registry: &PluginRegistry,
    request: WorkerRequest,
    sink: StateSink,
) -> Result<Value, ExecuteError> {
    match request {
        WorkerRequest::DataAccess { name, call_args } => {
            exec_data_access(registry, &name, sink, call_args)
        }
        WorkerRequest::Instantiate {
            model_type,
            call_args,
        } => exec_instantiate(registry, &model_type, sink, call_args),
        WorkerRequest::Fit {
            model_type,
            instance,
            call_args,
        } => exec_fit(registry, &model_type, instance, sink, call_args),
        WorkerRequest::Predict {
            model_type,
            instance,
            call_args,
        } => exec_predict(registry, &model_type, instance, sink, call_args),
    }
}
