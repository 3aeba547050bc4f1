//! Node metadata as reported by the coordination service.

/// Version metadata for one remote node.
///
/// `version` advances on every data write, `cversion` on every change to the
/// node's child list. The cache uses `version` to detect content updates and
/// `cversion` to detect structural churn without re-reading data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// Data version, bumped on each successful write to the node's payload.
    pub version: u64,
    /// Child-list version, bumped on each create/delete of a direct child.
    pub cversion: u64,
    /// Last modification time, milliseconds since the epoch.
    pub mtime_ms: u64,
    /// Length of the node's payload in bytes.
    pub data_length: u32,
    /// Number of direct children.
    pub num_children: u32,
}
