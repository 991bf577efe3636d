//! Bounded worker-process pool.
//!
//! Every plugin call runs in a fresh child process. The pool admits at most
//! `max_children` live children at a time; a periodic check wakes pending
//! waiters whenever capacity is available. Each handler talks to its child
//! over two one-way streams multiplexed on the child's stdio: the request
//! goes to stdin as a single JSON line, and the child answers with
//! newline-delimited JSON frames on stdout — zero or more `state` frames
//! followed by exactly one terminal frame. Stdout EOF before the terminal
//! frame means the child died and is reported as a termination.
//!
//! Closing a handler before its child completes sends SIGTERM; if the child
//! does not exit within `sigterm_timeout` it is SIGKILLed. Every spawned
//! child is reaped before the handler's result resolves.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use aimm_core::error::EngineError;
use aimm_core::model::{CallArgs, Instance};

// ─── Wire types ─────────────────────────────────────────────────────────────

/// The call a worker process is asked to execute, written to its stdin as a
/// single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Run a data-access plugin.
    DataAccess {
        /// Data-access plugin name.
        name: String,
        /// Call arguments.
        call_args: CallArgs,
    },
    /// Run an instantiate plugin.
    Instantiate {
        /// Model type.
        model_type: String,
        /// Call arguments.
        call_args: CallArgs,
    },
    /// Run a fit plugin.
    Fit {
        /// Model type.
        model_type: String,
        /// Current instance.
        instance: Instance,
        /// Call arguments.
        call_args: CallArgs,
    },
    /// Run a predict plugin.
    Predict {
        /// Model type.
        model_type: String,
        /// Current instance.
        instance: Instance,
        /// Call arguments.
        call_args: CallArgs,
    },
}

/// One frame on a worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// A progress report from the plugin's state sink.
    State {
        /// Progress payload.
        value: Value,
    },
    /// Terminal: the plugin returned a value.
    Success {
        /// Return value.
        value: Value,
    },
    /// Terminal: the plugin (or its dispatch) failed.
    Failure {
        /// Stringified error.
        message: String,
    },
    /// Terminal: the worker received a termination signal before the plugin
    /// returned.
    Terminated,
}

/// How to spawn a worker process.
///
/// In production this is the server binary's hidden `worker` mode carrying
/// the configured plugin sets; tests point it at the binary built by cargo.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments to pass.
    pub args: Vec<String>,
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Failure of one worker-pool call.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// User code failed inside the worker.
    #[error("plugin failed: {message}")]
    Plugin {
        /// Stringified error reported by the child.
        message: String,
    },

    /// The worker did not return a result: cancelled, killed or crashed.
    #[error("worker process terminated without a result")]
    Terminated,

    /// The pool is shutting down and refused the call.
    #[error("worker pool refused admission")]
    Admission,
}

impl From<ProcessError> for EngineError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Plugin { message } => Self::Plugin { message },
            ProcessError::Terminated => Self::ProcessTerminated,
            ProcessError::Admission => Self::AdmissionFailed,
        }
    }
}

// ─── Admission ──────────────────────────────────────────────────────────────

struct Admission {
    max_children: usize,
    live: Mutex<usize>,
    notify: Notify,
    closed: AtomicBool,
}

impl Admission {
    fn new(max_children: usize) -> Self {
        Self {
            max_children,
            live: Mutex::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Waits until a child slot is free. Waiters park on the notify and are
    /// woken by the periodic check or by a released slot.
    async fn acquire(self: &Arc<Self>) -> Result<AdmissionSlot, ProcessError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProcessError::Admission);
            }
            {
                let mut live = self.live.lock();
                if *live < self.max_children {
                    *live += 1;
                    return Ok(AdmissionSlot {
                        admission: Arc::clone(self),
                    });
                }
            }
            self.notify.notified().await;
        }
    }

    fn release(&self) {
        *self.live.lock() -= 1;
        self.notify.notify_one();
    }

    fn live(&self) -> usize {
        *self.live.lock()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Holds one child slot; dropping it frees the slot.
struct AdmissionSlot {
    admission: Arc<Admission>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.admission.release();
    }
}

// ─── ProcessPool ────────────────────────────────────────────────────────────

/// Creates [`ProcessHandler`]s and bounds the number of concurrently live
/// child processes.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    command: WorkerCommand,
    sigterm_timeout: Duration,
    admission: Arc<Admission>,
    token: CancellationToken,
    checker: Mutex<Option<JoinHandle<()>>>,
}

/// Callback relaying worker progress frames. Runs on the pool's scheduling
/// context, never in the child.
pub type StateCallback = Arc<dyn Fn(Value) + Send + Sync>;

impl ProcessPool {
    /// Creates a pool spawning workers with `command`.
    pub fn new(
        command: WorkerCommand,
        max_children: usize,
        check_children_period: Duration,
        sigterm_timeout: Duration,
    ) -> Self {
        let admission = Arc::new(Admission::new(max_children));
        let checker = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(check_children_period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if admission.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if admission.live() < admission.max_children {
                        admission.notify.notify_waiters();
                    }
                }
            })
        };
        Self {
            inner: Arc::new(PoolShared {
                command,
                sigterm_timeout,
                admission,
                token: CancellationToken::new(),
                checker: Mutex::new(Some(checker)),
            }),
        }
    }

    /// Creates a one-shot handler whose progress frames are forwarded to
    /// `on_state`.
    pub fn create_handler(&self, on_state: StateCallback) -> ProcessHandler {
        let (tx, rx) = oneshot::channel::<Result<Value, ProcessError>>();
        let result: BoxFuture<'static, Result<Value, ProcessError>> = Box::pin(async move {
            rx.await.unwrap_or(Err(ProcessError::Terminated))
        });
        ProcessHandler {
            shared: Arc::new(HandlerShared {
                pool: Arc::clone(&self.inner),
                token: self.inner.token.child_token(),
                on_state,
                result_tx: Mutex::new(Some(tx)),
                result: result.shared(),
            }),
        }
    }

    /// Number of currently live worker processes.
    pub fn live_children(&self) -> usize {
        self.inner.admission.live()
    }

    /// Shuts the pool down: pending waiters fail with admission errors and
    /// running children are terminated. Their handlers still reap them.
    pub fn close(&self) {
        self.inner.admission.close();
        self.inner.token.cancel();
        if let Some(checker) = self.inner.checker.lock().take() {
            checker.abort();
        }
    }
}

// ─── ProcessHandler ─────────────────────────────────────────────────────────

type SharedResult = Shared<BoxFuture<'static, Result<Value, ProcessError>>>;

/// One-shot handle for a single worker-process call.
#[derive(Clone)]
pub struct ProcessHandler {
    shared: Arc<HandlerShared>,
}

struct HandlerShared {
    pool: Arc<PoolShared>,
    token: CancellationToken,
    on_state: StateCallback,
    result_tx: Mutex<Option<oneshot::Sender<Result<Value, ProcessError>>>>,
    result: SharedResult,
}

impl ProcessHandler {
    /// Schedules `request` for execution in a fresh child process. The
    /// outcome is delivered through [`wait_result`](Self::wait_result),
    /// exactly once.
    pub fn run(&self, request: WorkerRequest) {
        let Some(tx) = self.shared.result_tx.lock().take() else {
            warn!("process handler is one-shot, ignoring second run");
            return;
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = drive(&shared, request).await;
            let _ = tx.send(result);
        });
    }

    /// Resolves with the child's return value, or fails with
    /// [`ProcessError`]. May be awaited by any number of callers.
    pub fn wait_result(&self) -> impl Future<Output = Result<Value, ProcessError>> + Send + 'static {
        self.shared.result.clone()
    }

    /// Cancels the call. A child that is already running is terminated with
    /// SIGTERM/SIGKILL escalation; a waiter that has not been admitted never
    /// spawns one.
    pub fn close(&self) {
        self.shared.token.cancel();
    }
}

async fn drive(shared: &HandlerShared, request: WorkerRequest) -> Result<Value, ProcessError> {
    let admission = &shared.pool.admission;
    let slot = tokio::select! {
        _ = shared.token.cancelled() => {
            return Err(if admission.closed.load(Ordering::SeqCst) {
                ProcessError::Admission
            } else {
                ProcessError::Terminated
            });
        }
        slot = admission.acquire() => slot?,
    };
    let result = run_child(shared, request).await;
    drop(slot);
    result
}

async fn run_child(shared: &HandlerShared, request: WorkerRequest) -> Result<Value, ProcessError> {
    let command = &shared.pool.command;
    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %command.program.display(), error = %e, "failed to spawn worker");
            return Err(ProcessError::Terminated);
        }
    };

    // One request line; dropping stdin afterwards gives the child EOF.
    if let Some(mut stdin) = child.stdin.take() {
        match serde_json::to_vec(&request) {
            Ok(mut line) => {
                line.push(b'\n');
                if let Err(e) = stdin.write_all(&line).await {
                    debug!(error = %e, "failed to write worker request");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode worker request"),
        }
    }

    let Some(stdout) = child.stdout.take() else {
        terminate(&mut child, shared.pool.sigterm_timeout).await;
        return Err(ProcessError::Terminated);
    };
    let mut lines = BufReader::new(stdout).lines();

    let mut cancel_requested = false;
    let outcome = loop {
        tokio::select! {
            _ = shared.token.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                break Err(ProcessError::Terminated);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<WorkerFrame>(&line) {
                    Ok(WorkerFrame::State { value }) => (shared.on_state)(value),
                    Ok(WorkerFrame::Success { value }) => break Ok(value),
                    Ok(WorkerFrame::Failure { message }) => {
                        break Err(ProcessError::Plugin { message });
                    }
                    Ok(WorkerFrame::Terminated) => break Err(ProcessError::Terminated),
                    Err(e) => debug!(error = %e, "ignoring malformed worker frame"),
                },
                Ok(None) => break Err(ProcessError::Terminated),
                Err(e) => {
                    debug!(error = %e, "worker stdout read failed");
                    break Err(ProcessError::Terminated);
                }
            }
        }
    };

    if cancel_requested {
        terminate(&mut child, shared.pool.sigterm_timeout).await;
    } else {
        settle(&mut child, shared.pool.sigterm_timeout).await;
    }
    outcome
}

/// Waits for a child that is expected to exit on its own; escalates if it
/// does not.
async fn settle(child: &mut Child, sigterm_timeout: Duration) {
    if tokio::time::timeout(sigterm_timeout, child.wait()).await.is_err() {
        terminate(child, sigterm_timeout).await;
    }
}

/// SIGTERM, then SIGKILL after `sigterm_timeout`, then reap.
async fn terminate(child: &mut Child, sigterm_timeout: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
    if tokio::time::timeout(sigterm_timeout, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn shell_worker(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn noop_state() -> StateCallback {
        Arc::new(|_| {})
    }

    fn dummy_request() -> WorkerRequest {
        WorkerRequest::DataAccess {
            name: "test".to_string(),
            call_args: CallArgs::default(),
        }
    }

    fn pool(command: WorkerCommand, max_children: usize) -> ProcessPool {
        ProcessPool::new(
            command,
            max_children,
            Duration::from_millis(20),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_success_frame_resolves_result() {
        let pool = pool(
            shell_worker(r#"echo '{"type":"success","value":42}'"#),
            2,
        );
        let handler = pool.create_handler(noop_state());
        handler.run(dummy_request());
        assert_eq!(handler.wait_result().await.unwrap(), json!(42));
        pool.close();
    }

    #[tokio::test]
    async fn test_failure_frame_reports_plugin_error() {
        let pool = pool(
            shell_worker(r#"echo '{"type":"failure","message":"boom"}'"#),
            2,
        );
        let handler = pool.create_handler(noop_state());
        handler.run(dummy_request());
        let err = handler.wait_result().await.unwrap_err();
        assert!(matches!(err, ProcessError::Plugin { message } if message == "boom"));
        pool.close();
    }

    #[tokio::test]
    async fn test_eof_without_result_is_terminated() {
        let pool = pool(shell_worker("exit 0"), 2);
        let handler = pool.create_handler(noop_state());
        handler.run(dummy_request());
        assert!(matches!(
            handler.wait_result().await,
            Err(ProcessError::Terminated)
        ));
        pool.close();
    }

    #[tokio::test]
    async fn test_state_frames_are_relayed_in_order() {
        let script = r#"
            echo '{"type":"state","value":1}'
            echo '{"type":"state","value":2}'
            echo '{"type":"success","value":null}'
        "#;
        let pool = pool(shell_worker(script), 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let handler = pool.create_handler(Arc::new(move |v| seen_cb.lock().push(v)));
        handler.run(dummy_request());
        handler.wait_result().await.unwrap();
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
        pool.close();
    }

    #[tokio::test]
    async fn test_close_terminates_running_child() {
        let pool = pool(shell_worker("sleep 30"), 2);
        let handler = pool.create_handler(noop_state());
        handler.run(dummy_request());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        handler.close();
        assert!(matches!(
            handler.wait_result().await,
            Err(ProcessError::Terminated)
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.live_children(), 0);
        pool.close();
    }

    #[tokio::test]
    async fn test_cancel_before_admission_never_spawns() {
        let pool = pool(shell_worker("sleep 0.3; echo '{\"type\":\"success\",\"value\":1}'"), 1);
        let first = pool.create_handler(noop_state());
        first.run(dummy_request());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The pool is saturated, so this waiter parks in admission.
        let second = pool.create_handler(noop_state());
        second.run(dummy_request());
        tokio::time::sleep(Duration::from_millis(50)).await;
        second.close();
        assert!(matches!(
            second.wait_result().await,
            Err(ProcessError::Terminated)
        ));

        assert_eq!(first.wait_result().await.unwrap(), json!(1));
        pool.close();
    }

    #[tokio::test]
    async fn test_max_children_is_respected() {
        let pool = pool(
            shell_worker("sleep 0.2; echo '{\"type\":\"success\",\"value\":1}'"),
            2,
        );
        let handlers: Vec<_> = (0..5)
            .map(|_| {
                let handler = pool.create_handler(noop_state());
                handler.run(dummy_request());
                handler
            })
            .collect();

        for _ in 0..20 {
            assert!(pool.live_children() <= 2);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        for handler in handlers {
            assert_eq!(handler.wait_result().await.unwrap(), json!(1));
        }
        pool.close();
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_admission() {
        let pool = pool(shell_worker("sleep 30"), 1);
        let first = pool.create_handler(noop_state());
        first.run(dummy_request());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = pool.create_handler(noop_state());
        second.run(dummy_request());
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close();
        let err = second.wait_result().await.unwrap_err();
        assert!(matches!(err, ProcessError::Admission | ProcessError::Terminated));
        assert!(matches!(
            first.wait_result().await,
            Err(ProcessError::Terminated)
        ));
    }
}
