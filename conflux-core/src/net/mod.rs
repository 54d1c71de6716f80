//! Active Networks
//!
//! The live runtime graph: function instances, the typed connections
//! between their value trees, and the networks that scope them. Networks
//! and instances live in a [`NetworkArena`] indexed by stable ids; parent
//! and child links are ids resolved through the arena, so the ownership
//! graph has no reference cycles.

mod connection;
mod instance;
mod network;

pub use connection::{ActiveConnection, Endpoint};
pub use instance::{ActiveInstance, FiringState, InstanceStatus};
pub use network::{ActiveNetwork, NetworkArena};

use serde::{Deserialize, Serialize};

/// Stable id of a network in the arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NetworkId(pub u32);

/// Stable id of an instance in the arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InstanceId(pub u32);

/// Stable id of a connection in the arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConnId(pub u32);
