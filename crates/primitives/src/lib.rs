//! Shared types for the Canopy coordination framework.
//!
//! This crate defines the vocabulary the framework and cache crates speak:
//! namespace paths, node metadata, connection states, watch and child events,
//! and the error taxonomy that separates transient (retryable) failures from
//! permanent ones.

pub mod errors;
pub mod events;
pub mod path;
pub mod stat;
pub mod state;

pub use errors::CoordinationError;
pub use events::{
    ChildData, ChildEvent, ChildEventKind, RawConnectionSignal, WatchKind, WatchNotification,
};
pub use path::{child_of, last_segment, parent_of, validate_path};
pub use stat::Stat;
pub use state::ConnectionState;
