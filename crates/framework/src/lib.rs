//! Connection-state-aware background operation engine for a coordination
//! service.
//!
//! Three pieces cooperate here:
//!
//! - [`RetryPolicy`] decides whether a connection-loss failure is retried and
//!   how long to back off.
//! - [`ConnectionStateManager`] owns the client's [`ConnectionState`] and
//!   delivers transitions to listeners through one serialized dispatch path,
//!   so no listener ever observes events out of order or permanently misses
//!   the first `Connected`.
//! - [`BackgroundOperationEngine`] consumes an ordered queue of submitted
//!   operations, executes them against the service, reschedules
//!   connection-loss failures per policy without stalling other work, and
//!   invokes each operation's callback exactly once.
//!
//! [`CanopyClient`] wires the three to a [`CoordinationService`] and is the
//! entry point for most callers.
//!
//! [`ConnectionState`]: canopy_primitives::ConnectionState
//! [`CoordinationService`]: canopy_service::CoordinationService

pub mod client;
pub mod engine;
pub mod ops;
pub mod retry;
pub mod state;

pub use client::CanopyClient;
pub use engine::BackgroundOperationEngine;
pub use ops::{
    Operation, OperationAndData, OperationCallback, OperationObserver, OperationOutcome,
    OperationResult, RetryContext,
};
pub use retry::{
    ExponentialBackoffRetry, RetryDecision, RetryNTimes, RetryOneTime, RetryPolicy,
    RetryUntilElapsed,
};
pub use state::ConnectionStateManager;
