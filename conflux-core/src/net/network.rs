//! Network Arena
//!
//! All networks, instances, and connections of one project live in a
//! single [`NetworkArena`], indexed by stable ids. A network either is the
//! project root or is owned by exactly one composite instance; the
//! ownership links run through ids in both directions, so there are no
//! reference cycles to manage.

use std::path::Path as FsPath;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::func::FunctionDef;
use crate::path::{Direction, Path, Steps, valid_identifier};
use crate::types::Type;
use crate::value::Version;

use super::connection::{ActiveConnection, Endpoint};
use super::instance::ActiveInstance;
use super::{ConnId, InstanceId, NetworkId};

/// One composition scope: an ordered set of instances plus the
/// connections declared inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNetwork {
    pub id: NetworkId,
    /// The composite instance owning this network; `None` for the root.
    pub owner: Option<InstanceId>,
    /// Instances by id, in creation order.
    pub instances: IndexMap<String, InstanceId>,
    /// Connections in declaration order.
    pub connections: Vec<ConnId>,
}

/// Arena of all networks, instances, and connections.
#[derive(Debug, Default)]
pub struct NetworkArena {
    pub(crate) networks: Vec<ActiveNetwork>,
    pub(crate) instances: Vec<ActiveInstance>,
    pub(crate) connections: Vec<ActiveConnection>,
    created_counter: u64,
}

/// A size watermark over the arena's three tables, taken before a batch
/// of structural edits so a failing batch can be undone whole.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArenaMark {
    networks: usize,
    instances: usize,
    connections: usize,
}

impl NetworkArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a network, wiring the back-link from its owner if any.
    pub fn add_network(&mut self, owner: Option<InstanceId>) -> NetworkId {
        let id = NetworkId(self.networks.len() as u32);
        self.networks.push(ActiveNetwork {
            id,
            owner,
            instances: IndexMap::new(),
            connections: Vec::new(),
        });
        if let Some(owner) = owner {
            self.instances[owner.0 as usize].subnet = Some(id);
        }
        id
    }

    pub fn network(&self, id: NetworkId) -> &ActiveNetwork {
        &self.networks[id.0 as usize]
    }

    pub fn instance(&self, id: InstanceId) -> &ActiveInstance {
        &self.instances[id.0 as usize]
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> &mut ActiveInstance {
        &mut self.instances[id.0 as usize]
    }

    pub fn connection(&self, id: ConnId) -> &ActiveConnection {
        &self.connections[id.0 as usize]
    }

    pub fn connection_mut(&mut self, id: ConnId) -> &mut ActiveConnection {
        &mut self.connections[id.0 as usize]
    }

    pub fn instances(&self) -> impl Iterator<Item = &ActiveInstance> {
        self.instances.iter()
    }

    pub fn networks(&self) -> impl Iterator<Item = &ActiveNetwork> {
        self.networks.iter()
    }

    pub fn connections(&self) -> impl Iterator<Item = &ActiveConnection> {
        self.connections.iter()
    }

    /// Create an instance in a network. The id must be a fresh valid
    /// identifier within that network.
    pub fn add_instance(
        &mut self,
        net: NetworkId,
        name: &str,
        def: Arc<FunctionDef>,
        base_dir: &FsPath,
    ) -> Result<InstanceId> {
        let name = valid_identifier(name)?;
        if self.network(net).instances.contains_key(&name) {
            return Err(Error::DuplicateInstance(name));
        }
        let id = InstanceId(self.instances.len() as u32);
        self.created_counter += 1;
        let created = self.created_counter;

        // Scratch directories nest the way networks nest.
        let dir = match self.network(net).owner {
            Some(owner) => self.instance(owner).persistent_dir.join(&name),
            None => base_dir.join(&name),
        };

        self.instances
            .push(ActiveInstance::new(id, net, name.clone(), def, dir, created));
        self.networks[net.0 as usize].instances.insert(name, id);
        Ok(id)
    }

    /// Look up an instance id within one network.
    pub fn find_instance(&self, net: NetworkId, name: &str) -> Result<InstanceId> {
        self.network(net)
            .instances
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))
    }

    /// The instance's full name through the ownership chain, e.g.
    /// `tune/grompp_0`.
    pub fn canonical_name(&self, id: InstanceId) -> String {
        let mut parts = vec![self.instance(id).name.clone()];
        let mut net = self.instance(id).network;
        while let Some(owner) = self.network(net).owner {
            parts.push(self.instance(owner).name.clone());
            net = self.instance(owner).network;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Resolve a parsed path against a network. `self` resolves to
    /// `current`, which callers supply in callback context.
    pub fn resolve(
        &self,
        net: NetworkId,
        current: Option<InstanceId>,
        path: &Path,
    ) -> Result<(InstanceId, crate::path::Direction, Steps)> {
        let instance = if path.is_self() {
            current.ok_or_else(|| Error::UnknownInstance(crate::path::SELF.to_string()))?
        } else {
            self.find_instance(net, &path.instance)?
        };
        let direction = path.direction.ok_or_else(|| {
            Error::PathParse(path.to_string(), "endpoint needs a direction".to_string())
        })?;
        Ok((instance, direction, path.steps.clone()))
    }

    /// The schema type at an endpoint.
    pub fn endpoint_type(&self, ep: &Endpoint) -> Result<Type> {
        let inst = self.instance(ep.instance);
        let schema = inst.tree(ep.direction)?.ty().clone();
        Ok(schema.at(&ep.steps)?.clone())
    }

    /// Add a typed connection. The declared type is the source endpoint's
    /// schema type; it must assign to the destination endpoint. Sources
    /// read from output-side trees and destinations write input-side
    /// trees (`ext_in` is a source and `ext_out` a destination: the
    /// composite's boundary seen from inside its sub-network). The edit
    /// is rejected if it would close a loop containing no
    /// command-emitting instance.
    pub fn add_connection(
        &mut self,
        net: NetworkId,
        source: Endpoint,
        dest: Endpoint,
    ) -> Result<ConnId> {
        if !matches!(
            source.direction,
            Direction::Out | Direction::SubOut | Direction::ExtIn
        ) {
            return Err(Error::PathParse(
                source.describe(&self.instance(source.instance).name),
                "connection source must read an output-side tree".to_string(),
            ));
        }
        if !matches!(
            dest.direction,
            Direction::In | Direction::SubIn | Direction::ExtOut
        ) {
            return Err(Error::PathParse(
                dest.describe(&self.instance(dest.instance).name),
                "connection destination must write an input-side tree".to_string(),
            ));
        }

        let declared = self.endpoint_type(&source)?;
        let dest_ty = self.endpoint_type(&dest)?;
        if !dest_ty.assignable_from(&declared) {
            return Err(Error::TypeMismatch {
                at: dest.describe(&self.instance(dest.instance).name),
                expected: dest_ty.name(),
                found: declared.name(),
            });
        }

        if self.creates_stateless_cycle(source.instance, dest.instance) {
            return Err(Error::CycleDetected(
                source.describe(&self.instance(source.instance).name),
                dest.describe(&self.instance(dest.instance).name),
            ));
        }

        let id = ConnId(self.connections.len() as u32);
        let src_instance = source.instance;
        self.connections.push(ActiveConnection {
            id,
            network: net,
            source,
            dest,
            declared,
            last_propagated: Version::ZERO,
            active: true,
        });
        self.networks[net.0 as usize].connections.push(id);
        self.instance_mut(src_instance).outgoing.push(id);
        Ok(id)
    }

    /// Deactivate a connection. The record stays in the arena so snapshot
    /// audit history is preserved; it just never propagates again.
    pub fn remove_connection(&mut self, id: ConnId) {
        self.connections[id.0 as usize].active = false;
    }

    pub(crate) fn mark(&self) -> ArenaMark {
        ArenaMark {
            networks: self.networks.len(),
            instances: self.instances.len(),
            connections: self.connections.len(),
        }
    }

    /// Undo every structural edit made since `mark` was taken: drop the
    /// appended connections, instances, and networks, and repair the
    /// back-links into the surviving records.
    pub(crate) fn rollback(&mut self, mark: ArenaMark) {
        self.connections.truncate(mark.connections);
        for net in &mut self.networks {
            net.connections.retain(|c| (c.0 as usize) < mark.connections);
        }
        for inst in &mut self.instances {
            inst.outgoing.retain(|c| (c.0 as usize) < mark.connections);
        }

        for inst in self.instances.split_off(mark.instances) {
            if (inst.network.0 as usize) < mark.networks {
                self.networks[inst.network.0 as usize]
                    .instances
                    .shift_remove(&inst.name);
            }
        }
        for net in self.networks.split_off(mark.networks) {
            if let Some(owner) = net.owner {
                if (owner.0 as usize) < mark.instances {
                    self.instances[owner.0 as usize].subnet = None;
                }
            }
        }
        self.restore_created_counter();
    }

    /// Recompute the creation counter after restoring instances from a
    /// snapshot, so new instances keep strictly increasing sequence
    /// numbers.
    pub(crate) fn restore_created_counter(&mut self) {
        self.created_counter = self
            .instances
            .iter()
            .map(|inst| inst.created)
            .max()
            .unwrap_or(0);
    }

    /// Would an edge `src -> dst` close a loop in which every instance is
    /// stateless? Such loops propagate forever and are rejected.
    fn creates_stateless_cycle(&self, src: InstanceId, dst: InstanceId) -> bool {
        let stateful = |id: InstanceId| self.instance(id).def.is_stateful();
        if stateful(src) || stateful(dst) {
            return false;
        }
        if src == dst {
            return true;
        }
        // Search dst -> ... -> src through stateless instances only.
        let mut stack = vec![dst];
        let mut visited = vec![false; self.instances.len()];
        while let Some(node) = stack.pop() {
            if visited[node.0 as usize] {
                continue;
            }
            visited[node.0 as usize] = true;
            for conn_id in &self.instance(node).outgoing {
                let conn = self.connection(*conn_id);
                if !conn.active {
                    continue;
                }
                let next = conn.dest.instance;
                if next == src {
                    return true;
                }
                if !stateful(next) {
                    stack.push(next);
                }
            }
        }
        false
    }
}
