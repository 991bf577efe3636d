//! Control planes and their factory.

pub mod envelope;
mod event;
mod session;

pub use event::EventControl;
pub use session::SessionControl;

use std::sync::Arc;

use thiserror::Error;

use aimm_core::control::Control;
use aimm_core::event::Subscription;
use aimm_engine::Engine;
use aimm_event::EventClient;

use crate::config::ControlConfig;

/// Errors raised while instantiating controls.
#[derive(Debug, Error)]
pub enum ControlError {
    /// An event control was configured without an event client.
    #[error("event control requires an event client")]
    MissingEventClient,

    /// Listener setup failed.
    #[error("control I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Instantiates the configured control.
pub async fn create_control(
    conf: &ControlConfig,
    engine: Engine,
    client: Option<Arc<dyn EventClient>>,
) -> Result<Arc<dyn Control>, ControlError> {
    match conf {
        ControlConfig::Event(conf) => {
            let client = client.ok_or(ControlError::MissingEventClient)?;
            Ok(Arc::new(EventControl::create(conf.clone(), engine, client)))
        }
        ControlConfig::Session(conf) => {
            Ok(Arc::new(SessionControl::create(conf.clone(), engine).await?))
        }
    }
}

/// The bus subscription the configured control wants routed to it, if any.
pub fn control_subscription(conf: &ControlConfig) -> Option<Subscription> {
    match conf {
        ControlConfig::Event(conf) => Some(
            conf.event_prefixes
                .values()
                .fold(Subscription::default(), |acc, prefix| {
                    acc.union(&Subscription::prefix(prefix))
                }),
        ),
        ControlConfig::Session(_) => None,
    }
}
