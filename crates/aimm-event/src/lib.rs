//! # AIMM Event
//!
//! Event-bus plumbing for the AIMM server: the [`EventClient`] trait the
//! runner and the bus-driven components talk through, and an in-process
//! [`LocalBus`] implementation used by embedded deployments and tests.
//!
//! The bus model is latest-wins per event type: queries return the most
//! recent event registered under each matching type. Inbound delivery goes
//! through a [`Connection`]: the runner owns the stream side and routes
//! batches to the components whose subscription matches.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use aimm_core::event::{Event, RegisterEvent, Subscription};

pub use local::LocalBus;

/// Errors raised by event-bus clients.
#[derive(Debug, Clone, Error)]
pub enum EventBusError {
    /// The connection to the bus is gone.
    #[error("event bus connection closed")]
    Closed,

    /// Transport failure.
    #[error("event bus I/O error: {0}")]
    Io(String),
}

/// Result type for event-bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// A connected event-bus client.
#[async_trait]
pub trait EventClient: Send + Sync {
    /// Publishes events without waiting for fan-out.
    async fn register(&self, events: Vec<RegisterEvent>) -> EventBusResult<()>;

    /// Publishes events and returns them as stored on the bus.
    async fn register_with_response(
        &self,
        events: Vec<RegisterEvent>,
    ) -> EventBusResult<Vec<Event>>;

    /// Returns the latest event for every type matching `subscription`.
    async fn query(&self, subscription: &Subscription) -> EventBusResult<Vec<Event>>;
}

/// A shared client plus the inbound event stream for its subscriptions.
///
/// The runner owns the stream side and routes batches to components.
pub struct Connection {
    /// The outbound client handle.
    pub client: Arc<dyn EventClient>,
    /// Inbound batches matching the connection's subscription.
    pub events: mpsc::UnboundedReceiver<Vec<Event>>,
}
