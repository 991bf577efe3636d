//! External-control contract.

use async_trait::async_trait;

use crate::event::Event;

/// An outward face of the engine.
///
/// Controls translate inbound requests into engine calls, report action
/// status transitions under a correlation id, honour cancel requests by
/// closing the action, and bind their lifetime to the engine's.
#[async_trait]
pub trait Control: Send + Sync {
    /// Hands the control the bus events matching its subscription.
    async fn process_events(&self, events: Vec<Event>);

    /// Releases the control's resources. Called by the runner in reverse
    /// creation order.
    async fn close(&self) {}
}
