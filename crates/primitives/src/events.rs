//! Watch, connectivity and cache event types.

use crate::stat::Stat;

/// What kind of change a fired watch is reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchKind {
    /// The watched path came into existence.
    Created,
    /// The watched path was deleted.
    Deleted,
    /// The watched path's data changed.
    DataChanged,
    /// The watched path's child list changed.
    ChildrenChanged,
}

/// A single-fire watch notification from the coordination service.
///
/// Each armed watch produces exactly one of these; observing a change after
/// it requires arming a fresh watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchNotification {
    pub path: String,
    pub kind: WatchKind,
}

/// Raw connectivity signal from the coordination service.
///
/// The wire never says "reconnected": a service only reports that a session
/// is connected, suspended, lost or read-only. Distinguishing a first
/// connection from a recovery is the connection state manager's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawConnectionSignal {
    Connected,
    Suspended,
    Lost,
    ReadOnly,
}

/// Immutable snapshot of one mirrored node: path, payload, metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildData {
    pub path: String,
    pub data: Option<Vec<u8>>,
    pub stat: Stat,
}

/// Kind of event emitted by the tree cache synchronizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildEventKind {
    /// A node appeared under the watched subtree.
    ChildAdded,
    /// A tracked node's data version changed.
    ChildUpdated,
    /// A tracked node was removed.
    ChildRemoved,
    /// First full population of the mirror completed. Emitted exactly once.
    Initialized,
    /// The connection dropped; the mirror is retained but no longer fresh.
    ConnectionSuspended,
    /// The connection recovered; a full refresh follows.
    ConnectionReconnected,
    /// The session is gone; the mirror reflects last-known state only.
    ConnectionLost,
    /// The cache root could not be fetched after retries; the cache is faulted.
    RootFailure,
}

/// One entry in the synchronizer's ordered event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    /// Node snapshot for structural events; `None` for connection events.
    pub data: Option<ChildData>,
}

impl ChildEvent {
    #[must_use]
    pub const fn new(kind: ChildEventKind, data: Option<ChildData>) -> Self {
        Self { kind, data }
    }

    /// Path of the affected node, when the event concerns one.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.data.as_ref().map(|data| data.path.as_str())
    }
}
