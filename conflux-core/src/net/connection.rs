//! Active Connections
//!
//! A connection is a directed, typed link from a source subvalue (an
//! output of some instance) to a destination subvalue (an input of some
//! instance). Endpoints are non-owning: they hold arena ids and are
//! resolved through the network on every use.
//!
//! Each connection remembers the last source version it propagated, so a
//! propagation only ever copies the delta subtree newer than that cutoff.

use serde::{Deserialize, Serialize};

use crate::path::{Direction, Steps, steps_to_string};
use crate::types::Type;
use crate::value::Version;

use super::{ConnId, InstanceId, NetworkId};

/// One end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub instance: InstanceId,
    pub direction: Direction,
    pub steps: Steps,
}

impl Endpoint {
    pub fn new(instance: InstanceId, direction: Direction, steps: Steps) -> Self {
        Self {
            instance,
            direction,
            steps,
        }
    }

    /// Render the endpoint's sub-path for diagnostics.
    pub fn describe(&self, instance_name: &str) -> String {
        let tail = steps_to_string(&self.steps);
        if tail.is_empty() {
            format!("{instance_name}:{}", self.direction)
        } else {
            format!("{instance_name}:{}.{tail}", self.direction)
        }
    }
}

/// A live typed link between two subvalues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub id: ConnId,
    /// The network that owns this connection.
    pub network: NetworkId,
    pub source: Endpoint,
    pub dest: Endpoint,
    /// The declared type, assignment-compatible with both endpoints.
    pub declared: Type,
    /// Source version as of the last propagation across this link.
    pub last_propagated: Version,
    /// Cleared by `remove_connection`; inactive links never propagate.
    pub active: bool,
}
