//! Client facade wiring the service, state manager and engine together.

use std::any::Any;
use std::sync::Arc;

use canopy_primitives::{ConnectionState, CoordinationError};
use canopy_service::CoordinationService;
use eyre::Result as EyreResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::BackgroundOperationEngine;
use crate::ops::{Operation, OperationCallback, OperationObserver};
use crate::retry::RetryPolicy;
use crate::state::ConnectionStateManager;

/// Entry point for framework consumers.
///
/// Owns a pump task that hands the service's raw connectivity signals off to
/// the [`ConnectionStateManager`] (they are never processed on the service's
/// own delivery context), and exposes operation submission, connection-state
/// subscription and lifecycle control.
pub struct CanopyClient {
    service: Arc<dyn CoordinationService>,
    state: ConnectionStateManager,
    engine: BackgroundOperationEngine,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for CanopyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanopyClient")
            .field("state", &self.state)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl CanopyClient {
    /// Start the framework over `service` with a default retry policy.
    pub fn start(
        service: Arc<dyn CoordinationService>,
        default_policy: Arc<dyn RetryPolicy>,
    ) -> EyreResult<Self> {
        Self::start_with(service, default_policy, None)
    }

    /// [`start`](Self::start) with an injected operation observer.
    pub fn start_with(
        service: Arc<dyn CoordinationService>,
        default_policy: Arc<dyn RetryPolicy>,
        observer: Option<Arc<dyn OperationObserver>>,
    ) -> EyreResult<Self> {
        let state = ConnectionStateManager::start();
        let engine = BackgroundOperationEngine::start_with(
            Arc::clone(&service),
            default_policy,
            observer,
            Some(state.watch_state()),
        );

        let mut signals = service.connection_signals();
        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            while let Some(raw) = signals.recv().await {
                pump_state.signal(raw);
            }
            debug!("connection signal pump stopped");
        });

        Ok(Self {
            service,
            state,
            engine,
            pump,
        })
    }

    /// Submit a background operation with the default retry policy.
    pub fn submit(
        &self,
        operation: Operation,
        callback: Option<OperationCallback>,
    ) -> Result<(), CoordinationError> {
        self.engine.submit(operation, callback)
    }

    /// Submit with a per-operation retry-policy override and opaque context.
    pub fn submit_with(
        &self,
        operation: Operation,
        policy: Option<Arc<dyn RetryPolicy>>,
        callback: Option<OperationCallback>,
        context: Option<Box<dyn Any + Send>>,
    ) -> Result<(), CoordinationError> {
        self.engine.submit_with(operation, policy, callback, context)
    }

    /// Register a connection-state listener (see
    /// [`ConnectionStateManager::subscribe`]).
    pub async fn subscribe_connection_state(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.state.subscribe().await
    }

    /// Snapshot of the current connection state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.state.current_state()
    }

    /// The state manager, for components (like a tree cache) that subscribe
    /// internally.
    #[must_use]
    pub const fn state_manager(&self) -> &ConnectionStateManager {
        &self.state
    }

    /// The underlying service handle.
    #[must_use]
    pub fn service(&self) -> Arc<dyn CoordinationService> {
        Arc::clone(&self.service)
    }

    /// Tear the framework down. Idempotent; no callback or listener fires
    /// after this returns.
    pub async fn close(&self) {
        self.engine.close().await;
        self.state.close().await;
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use canopy_primitives::RawConnectionSignal;
    use canopy_service::mock::MockService;
    use canopy_service::CreateMode;

    use super::*;
    use crate::retry::RetryNTimes;

    /// Regression shape: an operation submitted while the server is down must
    /// not cause a listener registered before the first connection to miss
    /// (or see anything ahead of) `Connected`.
    #[tokio::test]
    async fn listener_registered_before_connect_sees_connected_first() {
        let service = Arc::new(MockService::new());
        let client = CanopyClient::start(
            Arc::clone(&service) as Arc<dyn CoordinationService>,
            Arc::new(RetryNTimes::new(0, Duration::ZERO)),
        )
        .unwrap();

        let mut states = client.subscribe_connection_state().await;

        // Fails fast under the zero-retry policy; must not pollute the
        // listener's stream.
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .submit(
                Operation::Create {
                    path: "/foo".to_owned(),
                    data: Vec::new(),
                    mode: CreateMode::Persistent,
                },
                Some(Box::new(move |result| {
                    let _ = tx.send(result);
                })),
            )
            .unwrap();
        assert!(rx.recv().await.unwrap().is_err());

        service.restart();

        assert_eq!(states.recv().await, Some(ConnectionState::Connected));
        client.close().await;
    }

    #[tokio::test]
    async fn facade_close_is_idempotent() {
        let service = Arc::new(MockService::new());
        service.restart();
        let client = CanopyClient::start(
            service as Arc<dyn CoordinationService>,
            Arc::new(RetryNTimes::new(1, Duration::from_millis(1))),
        )
        .unwrap();

        let mut states = client.subscribe_connection_state().await;
        client.close().await;
        client.close().await;

        // The manager is closed; the listener's stream ends rather than
        // delivering anything further.
        client.state_manager().signal(RawConnectionSignal::Lost);
        assert_eq!(states.recv().await, None);
    }
}
