//! Action handles.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use aimm_core::error::EngineError;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, EngineError>>>;

impl<T: Clone> std::fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("action_id", &self.action_id)
            .finish_non_exhaustive()
    }
}

/// Handle for one in-flight create/fit/predict operation.
///
/// The handle only carries the action id, a cancellation token and a shared
/// result future; it holds no strong reference into the engine, so engine
/// teardown invalidates outstanding actions (their results resolve to
/// [`EngineError::ProcessTerminated`]).
#[derive(Clone)]
pub struct Action<T: Clone> {
    action_id: u64,
    token: CancellationToken,
    result: SharedOutcome<T>,
}

impl<T: Clone + Send + 'static> Action<T> {
    pub(crate) fn new(
        action_id: u64,
        token: CancellationToken,
        rx: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Self {
        let result: BoxFuture<'static, Result<T, EngineError>> =
            Box::pin(async move { rx.await.unwrap_or(Err(EngineError::ProcessTerminated)) });
        Self {
            action_id,
            token,
            result: result.shared(),
        }
    }

    /// The engine-unique action id.
    pub fn id(&self) -> u64 {
        self.action_id
    }

    /// Resolves with the action's result. Safe to await from several
    /// callers; the pipeline resolves it exactly once.
    pub async fn wait_result(&self) -> Result<T, EngineError> {
        self.result.clone().await
    }

    /// Cancels the action. The current pipeline step is aborted: a running
    /// worker is terminated with escalation, a pending lock or admission
    /// wait is abandoned. `wait_result` then fails with
    /// [`EngineError::ProcessTerminated`].
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Token cancelled when the action is closed. Controls use this to tie
    /// correlation-id bookkeeping to the action's lifetime.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
