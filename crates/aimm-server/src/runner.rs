//! Top-level supervisor.
//!
//! Composes backend → engine → controls in order, routes inbound bus
//! events to the components whose subscription matches, and closes
//! everything in reverse order. Loss of the external event client is fatal.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use aimm_core::backend::Backend;
use aimm_core::control::Control;
use aimm_core::error::EngineError;
use aimm_core::event::Subscription;
use aimm_core::plugins::PluginRegistry;
use aimm_engine::{Engine, WorkerCommand};
use aimm_event::Connection;

use crate::backend::{backend_subscription, create_backend};
use crate::config::AimmConfig;
use crate::control::{ControlError, control_subscription, create_control};

/// Errors raised while assembling or running the server.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Backend or engine startup failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Control startup failure.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// A configured component needs an event client but none is connected.
    #[error("configuration requires an event client but none is connected")]
    MissingEventClient,
}

/// The assembled server.
pub struct Runner {
    engine: Engine,
    #[allow(dead_code)]
    backend: Arc<dyn Backend>,
    controls: Vec<Arc<dyn Control>>,
    token: CancellationToken,
}

impl Runner {
    /// Builds backend, engine and controls from `conf`.
    ///
    /// `connection` carries the external event client and its inbound
    /// stream; it is required when the backend or any control is
    /// bus-driven.
    pub async fn create(
        conf: &AimmConfig,
        registry: Arc<PluginRegistry>,
        worker_command: WorkerCommand,
        connection: Option<Connection>,
    ) -> Result<Runner, RunnerError> {
        let (client, events) = match connection {
            Some(connection) => (Some(connection.client), Some(connection.events)),
            None => (None, None),
        };

        let backend = create_backend(&conf.backend, Arc::clone(&registry), client.clone())
            .await
            .map_err(EngineError::from)?;

        let engine = Engine::create(
            (&conf.engine).into(),
            worker_command,
            Arc::clone(&backend),
            registry,
        )
        .await?;

        let mut controls = Vec::with_capacity(conf.controls.len());
        let mut routes: Vec<(Subscription, Route)> = Vec::new();
        if let Some(subscription) = backend_subscription(&conf.backend) {
            routes.push((subscription, Route::Backend));
        }
        for control_conf in &conf.controls {
            let control = create_control(control_conf, engine.clone(), client.clone()).await?;
            if let Some(subscription) = control_subscription(control_conf) {
                routes.push((subscription, Route::Control(controls.len())));
            }
            controls.push(control);
        }

        let token = CancellationToken::new();
        if !routes.is_empty() || events.is_some() {
            let Some(events) = events else {
                return Err(RunnerError::MissingEventClient);
            };
            tokio::spawn(route_events(
                events,
                routes,
                Arc::clone(&backend),
                controls.clone(),
                token.clone(),
            ));
        }

        info!(controls = controls.len(), "server assembled");
        Ok(Runner {
            engine,
            backend,
            controls,
            token,
        })
    }

    /// The running engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Resolves when the runner must shut down (event client lost).
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    /// Shuts everything down in reverse creation order.
    pub async fn close(&self) {
        for control in self.controls.iter().rev() {
            control.close().await;
        }
        self.engine.close();
        self.token.cancel();
        info!("server closed");
    }
}

enum Route {
    Backend,
    Control(usize),
}

async fn route_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<Vec<aimm_core::event::Event>>,
    routes: Vec<(Subscription, Route)>,
    backend: Arc<dyn Backend>,
    controls: Vec<Arc<dyn Control>>,
    token: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = token.cancelled() => break,
            batch = events.recv() => batch,
        };
        let Some(batch) = batch else {
            // The bus connection is gone; the server cannot continue.
            error!("event client lost, shutting down");
            token.cancel();
            break;
        };
        for (subscription, route) in &routes {
            let matching: Vec<_> = batch
                .iter()
                .filter(|e| subscription.matches(&e.event_type))
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            match route {
                Route::Backend => backend.process_events(matching).await,
                Route::Control(index) => controls[*index].process_events(matching).await,
            }
        }
    }
}
