//! The narrow coordination-service interface consumed by the Canopy core.
//!
//! The framework never speaks a wire protocol; it programs against
//! [`CoordinationService`], a session-oriented view of a remote hierarchical
//! namespace with versioned nodes and single-fire watches. Production
//! deployments implement this trait over their transport of choice;
//! [`mock::MockService`] provides an in-memory implementation with
//! controllable connectivity for tests.

use async_trait::async_trait;
use canopy_primitives::{
    CoordinationError, RawConnectionSignal, Stat, WatchNotification,
};
use tokio::sync::mpsc;

pub mod mock;

/// Whether a read should arm a single-fire watch on the target path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Watch {
    /// Plain read, no notification.
    None,
    /// Arm a watch: exactly one future [`WatchNotification`] will be
    /// delivered for this path, after which the watch is spent.
    Arm,
}

impl Watch {
    #[must_use]
    pub const fn armed(&self) -> bool {
        matches!(self, Self::Arm)
    }
}

/// Persistence mode for created nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The node outlives the session that created it.
    Persistent,
    /// The node is removed by the service when the creating session ends.
    Ephemeral,
}

/// Session-oriented interface to the remote coordination service.
///
/// All node operations are asynchronous and return typed
/// [`CoordinationError`]s; connectivity and watch notifications arrive on
/// channels obtained from [`connection_signals`](Self::connection_signals)
/// and [`watch_notifications`](Self::watch_notifications). Notifications are
/// delivered on service-owned tasks; consumers must hand them off rather
/// than block the delivery loop.
#[async_trait]
pub trait CoordinationService: Send + Sync + 'static {
    /// Create a node. Returns the created path.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError>;

    /// Delete a node. `version` of `Some(v)` makes the delete conditional on
    /// the node's current data version.
    async fn delete(&self, path: &str, version: Option<u64>) -> Result<(), CoordinationError>;

    /// Overwrite a node's data, optionally conditional on its data version.
    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        version: Option<u64>,
    ) -> Result<Stat, CoordinationError>;

    /// Read a node's data and metadata.
    async fn get_data(
        &self,
        path: &str,
        watch: Watch,
    ) -> Result<(Option<Vec<u8>>, Stat), CoordinationError>;

    /// List a node's direct children (names, not full paths).
    async fn get_children(
        &self,
        path: &str,
        watch: Watch,
    ) -> Result<(Vec<String>, Stat), CoordinationError>;

    /// Check a node's existence. With [`Watch::Arm`] the watch is armed even
    /// when the node does not exist yet, and fires on its creation.
    async fn exists(&self, path: &str, watch: Watch) -> Result<Option<Stat>, CoordinationError>;

    /// Register a subscriber for raw connectivity signals.
    fn connection_signals(&self) -> mpsc::UnboundedReceiver<RawConnectionSignal>;

    /// Register a subscriber for fired watch notifications.
    fn watch_notifications(&self) -> mpsc::UnboundedReceiver<WatchNotification>;
}
