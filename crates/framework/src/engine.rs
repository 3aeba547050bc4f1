//! The background operation engine: an ordered queue with retry.
//!
//! One consumer task dispatches submitted operations against the service in
//! submission order. A connection-loss failure parks only the failed
//! operation (a timer task re-submits it after the policy's backoff); other
//! queued work keeps flowing. Every operation's callback fires exactly once.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use canopy_primitives::{validate_path, ConnectionState, CoordinationError};
use canopy_service::{CoordinationService, Watch};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::ops::{
    Operation, OperationAndData, OperationCallback, OperationObserver, OperationOutcome,
    OperationResult,
};
use crate::retry::{RetryDecision, RetryPolicy};

enum EngineCommand {
    Submit(OperationAndData),
    Close { ack: oneshot::Sender<()> },
}

struct Worker {
    service: Arc<dyn CoordinationService>,
    default_policy: Arc<dyn RetryPolicy>,
    observer: Option<Arc<dyn OperationObserver>>,
    connection: Option<watch::Receiver<ConnectionState>>,
    retry_tx: mpsc::UnboundedSender<EngineCommand>,
}

impl Worker {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                EngineCommand::Submit(op) => self.dispatch(op).await,
                EngineCommand::Close { ack } => {
                    commands.close();
                    // Everything still queued gets the documented terminal
                    // result; nothing is dispatched after close.
                    while let Some(trailing) = commands.recv().await {
                        match trailing {
                            EngineCommand::Submit(op) => {
                                op.complete(Err(CoordinationError::ClientClosed));
                            }
                            EngineCommand::Close { ack } => {
                                let _ = ack.send(());
                            }
                        }
                    }
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("background operation engine stopped");
    }

    async fn dispatch(&self, mut op: OperationAndData) {
        let first_attempt = op.retry.mark_attempt();
        if let Some(observer) = &self.observer {
            observer.on_dispatch(&op.operation, op.retry.attempt);
        }
        // Don't burn an attempt against a service we know is unreachable;
        // classify it as connection loss and let the policy pace us.
        if let Some(connection) = &self.connection {
            if !connection.borrow().is_connected() {
                self.handle_connection_loss(op, CoordinationError::ConnectionLoss, first_attempt);
                return;
            }
        }
        match execute(&*self.service, &op.operation).await {
            Ok(outcome) => op.complete(Ok(outcome)),
            Err(err) if err.is_connection_loss() => {
                self.handle_connection_loss(op, err, first_attempt);
            }
            Err(err) => {
                debug!(
                    kind = op.operation.kind(),
                    path = op.operation.path(),
                    %err,
                    "operation failed permanently"
                );
                op.complete(Err(err));
            }
        }
    }

    fn handle_connection_loss(
        &self,
        mut op: OperationAndData,
        err: CoordinationError,
        first_attempt: Instant,
    ) {
        let policy = op
            .policy
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_policy));
        match policy.allow_retry(op.retry.attempt, first_attempt.elapsed()) {
            RetryDecision::RetryAfter(sleep) => {
                op.retry.attempt += 1;
                debug!(
                    kind = op.operation.kind(),
                    path = op.operation.path(),
                    attempt = op.retry.attempt,
                    ?sleep,
                    "connection loss, rescheduling"
                );
                let retry_tx = self.retry_tx.clone();
                // The pause runs off-loop; other ready operations are not
                // held up behind this one.
                drop(tokio::spawn(async move {
                    tokio::time::sleep(sleep).await;
                    if let Err(unsent) = retry_tx.send(EngineCommand::Submit(op)) {
                        if let EngineCommand::Submit(op) = unsent.0 {
                            op.complete(Err(CoordinationError::ClientClosed));
                        }
                    }
                }));
            }
            RetryDecision::GiveUp => {
                warn!(
                    kind = op.operation.kind(),
                    path = op.operation.path(),
                    attempts = op.retry.attempt + 1,
                    "retries exhausted"
                );
                op.complete(Err(err));
            }
        }
    }
}

async fn execute(service: &dyn CoordinationService, operation: &Operation) -> OperationResult {
    match operation {
        Operation::Create { path, data, mode } => service
            .create(path, data.clone(), *mode)
            .await
            .map(|path| OperationOutcome::Created { path }),
        Operation::Delete { path, version } => service
            .delete(path, *version)
            .await
            .map(|()| OperationOutcome::Deleted),
        Operation::SetData {
            path,
            data,
            version,
        } => service
            .set_data(path, data.clone(), *version)
            .await
            .map(|stat| OperationOutcome::DataSet { stat }),
        Operation::GetData { path } => service
            .get_data(path, Watch::None)
            .await
            .map(|(data, stat)| OperationOutcome::Data { data, stat }),
        Operation::GetChildren { path } => service
            .get_children(path, Watch::None)
            .await
            .map(|(names, stat)| OperationOutcome::Children { names, stat }),
        Operation::Exists { path } => service
            .exists(path, Watch::None)
            .await
            .map(|stat| OperationOutcome::Existence { stat }),
    }
}

#[derive(Debug)]
struct EngineShared {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        let (ack, _) = oneshot::channel();
        let _ = self.commands.send(EngineCommand::Close { ack });
    }
}

/// Handle to the engine's consumer task. Cheap to clone; the task shuts
/// down when [`close`](Self::close) is called or the last handle drops.
#[derive(Clone, Debug)]
pub struct BackgroundOperationEngine {
    inner: Arc<EngineShared>,
}

impl BackgroundOperationEngine {
    /// Spawn the consumer task against `service`.
    #[must_use]
    pub fn start(
        service: Arc<dyn CoordinationService>,
        default_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self::start_with(service, default_policy, None, None)
    }

    /// [`start`](Self::start) with an injected dispatch observer and/or a
    /// connection-state mirror the engine consults before attempting.
    #[must_use]
    pub fn start_with(
        service: Arc<dyn CoordinationService>,
        default_policy: Arc<dyn RetryPolicy>,
        observer: Option<Arc<dyn OperationObserver>>,
        connection: Option<watch::Receiver<ConnectionState>>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            service,
            default_policy,
            observer,
            connection,
            retry_tx: commands.clone(),
        };
        drop(tokio::spawn(worker.run(commands_rx)));
        Self {
            inner: Arc::new(EngineShared { commands }),
        }
    }

    /// Enqueue an operation. Returns immediately; the callback is invoked
    /// exactly once with the terminal result.
    ///
    /// An invalid path is a usage error and is reported synchronously,
    /// without queuing.
    pub fn submit(
        &self,
        operation: Operation,
        callback: Option<OperationCallback>,
    ) -> Result<(), CoordinationError> {
        self.submit_with(operation, None, callback, None)
    }

    /// [`submit`](Self::submit) with a per-operation retry-policy override
    /// and an opaque caller context carried alongside the operation.
    pub fn submit_with(
        &self,
        operation: Operation,
        policy: Option<Arc<dyn RetryPolicy>>,
        callback: Option<OperationCallback>,
        context: Option<Box<dyn Any + Send>>,
    ) -> Result<(), CoordinationError> {
        validate_path(operation.path())?;
        let op = OperationAndData::new(operation, callback, policy, context);
        if let Err(unsent) = self.inner.commands.send(EngineCommand::Submit(op)) {
            if let EngineCommand::Submit(op) = unsent.0 {
                op.complete(Err(CoordinationError::ClientClosed));
            }
        }
        Ok(())
    }

    /// Stop the consumer. Idempotent. Queued-but-undispatched operations
    /// receive [`CoordinationError::ClientClosed`]; the in-flight operation,
    /// if any, completes and delivers its callback.
    pub async fn close(&self) {
        let (ack, acked) = oneshot::channel();
        if self
            .inner
            .commands
            .send(EngineCommand::Close { ack })
            .is_ok()
        {
            let _ = acked.await;
        }
    }
}
