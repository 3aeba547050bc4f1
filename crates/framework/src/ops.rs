//! Operation descriptors and completion callbacks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use canopy_primitives::{CoordinationError, Stat};
use canopy_service::CreateMode;
use tracing::debug;

use crate::retry::RetryPolicy;

/// A single coordination-service operation, as a tagged variant.
///
/// The engine dispatches on the tag alone; there is no runtime type
/// inspection anywhere in the pipeline.
#[derive(Clone, Debug)]
pub enum Operation {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: Option<u64>,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<u64>,
    },
    GetData {
        path: String,
    },
    GetChildren {
        path: String,
    },
    Exists {
        path: String,
    },
}

impl Operation {
    /// Target path of the operation.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::Delete { path, .. }
            | Self::SetData { path, .. }
            | Self::GetData { path }
            | Self::GetChildren { path }
            | Self::Exists { path } => path,
        }
    }

    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::SetData { .. } => "set_data",
            Self::GetData { .. } => "get_data",
            Self::GetChildren { .. } => "get_children",
            Self::Exists { .. } => "exists",
        }
    }
}

/// Successful result payload of an [`Operation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    Created { path: String },
    Deleted,
    DataSet { stat: Stat },
    Data { data: Option<Vec<u8>>, stat: Stat },
    Children { names: Vec<String>, stat: Stat },
    Existence { stat: Option<Stat> },
}

/// What an operation's callback receives: a success payload or a typed error.
pub type OperationResult = Result<OperationOutcome, CoordinationError>;

/// Completion callback. Invoked exactly once per submitted operation.
pub type OperationCallback = Box<dyn FnOnce(OperationResult) + Send + 'static>;

/// Optional engine collaborator notified before every dispatch attempt.
///
/// Injected at construction; replaces any notion of an ambient debug hook.
/// Retry tests use it to timestamp redispatches.
pub trait OperationObserver: Send + Sync {
    fn on_dispatch(&self, operation: &Operation, attempt: u32);
}

/// Retry bookkeeping for one pending operation.
///
/// `attempt` is zero-based; `first_attempt` is pinned at the initial
/// dispatch so elapsed-time ceilings are absolute.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryContext {
    pub first_attempt: Option<Instant>,
    pub attempt: u32,
}

impl RetryContext {
    pub(crate) fn mark_attempt(&mut self) -> Instant {
        *self.first_attempt.get_or_insert_with(Instant::now)
    }
}

/// One pending or in-flight background operation: descriptor, callback,
/// retry context and an optional caller context opaque to the engine.
pub struct OperationAndData {
    pub operation: Operation,
    pub(crate) callback: Option<OperationCallback>,
    pub(crate) policy: Option<Arc<dyn RetryPolicy>>,
    pub retry: RetryContext,
    pub context: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for OperationAndData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationAndData")
            .field("operation", &self.operation)
            .field("has_callback", &self.callback.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl OperationAndData {
    pub(crate) fn new(
        operation: Operation,
        callback: Option<OperationCallback>,
        policy: Option<Arc<dyn RetryPolicy>>,
        context: Option<Box<dyn Any + Send>>,
    ) -> Self {
        Self {
            operation,
            callback,
            policy,
            retry: RetryContext::default(),
            context,
        }
    }

    /// Deliver the terminal result. Consumes the callback, so a second call
    /// cannot notify anyone; the operation is complete after this.
    pub(crate) fn complete(mut self, result: OperationResult) {
        debug!(
            kind = self.operation.kind(),
            path = self.operation.path(),
            ok = result.is_ok(),
            attempts = self.retry.attempt + 1,
            "operation complete"
        );
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}
