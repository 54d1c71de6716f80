//! Active Instances
//!
//! An [`ActiveInstance`] is one live invocation record of a function
//! definition: its input and output value trees, its firing state, its
//! persistent scratch directory, and its command bookkeeping. Instances
//! are never silently dropped — once created they stay in the arena, in
//! whatever state they last reached, for audit and restart.

use std::collections::VecDeque;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::command::{CommandId, Completion};
use crate::error::{Error, Result};
use crate::func::FunctionDef;
use crate::path::{Direction, Step};
use crate::types::Type;
use crate::value::{Value, Version};

use super::{ConnId, InstanceId, NetworkId};

/// The per-activation state machine.
///
/// `Held -> Ready -> Running -> {Done | Blocked}`; `Blocked -> Ready` when
/// the last outstanding command completes; `Done -> Ready` when fresh input
/// arrives. `Done` is terminal per activation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FiringState {
    /// Blocked on required input.
    Held,
    /// All required inputs present; waiting to fire.
    Ready,
    /// Callback in flight.
    Running,
    /// Awaiting command completion.
    Blocked,
    /// Finished this activation.
    Done,
}

/// The user-visible status triple (plus fire bookkeeping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: FiringState,
    pub last_error: Option<String>,
    pub last_warning: Option<String>,
    pub fire_count: u64,
}

/// One live function instance.
#[derive(Debug)]
pub struct ActiveInstance {
    pub(crate) id: InstanceId,
    pub(crate) name: String,
    pub(crate) network: NetworkId,
    pub(crate) def: Arc<FunctionDef>,
    pub(crate) inputs: Value,
    pub(crate) outputs: Value,
    pub(crate) sub_inputs: Option<Value>,
    pub(crate) sub_outputs: Option<Value>,
    pub(crate) state: FiringState,
    pub(crate) last_fired: Version,
    pub(crate) fire_count: u64,
    pub(crate) persistent_dir: PathBuf,
    pub(crate) outstanding: Vec<CommandId>,
    /// Completions waiting to be handed to the callback, one per fire.
    pub(crate) inbox: VecDeque<Completion>,
    pub(crate) last_error: Option<String>,
    pub(crate) last_warning: Option<String>,
    /// The sub-network this instance owns, created on first expansion.
    pub(crate) subnet: Option<NetworkId>,
    /// Creation sequence number; the deterministic fire tie-break.
    pub(crate) created: u64,
    /// Connections whose source is this instance, in declaration order.
    pub(crate) outgoing: Vec<ConnId>,
}

impl ActiveInstance {
    pub(crate) fn new(
        id: InstanceId,
        network: NetworkId,
        name: String,
        def: Arc<FunctionDef>,
        persistent_dir: PathBuf,
        created: u64,
    ) -> Self {
        let inputs = Value::new(Type::Record(def.inputs().clone()));
        let outputs = Value::new(Type::Record(def.outputs().clone()));
        let sub_inputs = def
            .subnet_inputs()
            .map(|schema| Value::new(Type::Record(schema.clone())));
        let sub_outputs = def
            .subnet_outputs()
            .map(|schema| Value::new(Type::Record(schema.clone())));
        Self {
            id,
            name,
            network,
            def,
            inputs,
            outputs,
            sub_inputs,
            sub_outputs,
            state: FiringState::Held,
            last_fired: Version::ZERO,
            fire_count: 0,
            persistent_dir,
            outstanding: Vec::new(),
            inbox: VecDeque::new(),
            last_error: None,
            last_warning: None,
            subnet: None,
            created,
            outgoing: Vec::new(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &Arc<FunctionDef> {
        &self.def
    }

    pub fn state(&self) -> FiringState {
        self.state
    }

    pub fn persistent_dir(&self) -> &FsPath {
        &self.persistent_dir
    }

    pub fn subnet(&self) -> Option<NetworkId> {
        self.subnet
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            last_warning: self.last_warning.clone(),
            fire_count: self.fire_count,
        }
    }

    /// The value tree a direction addresses. `ext_in`/`ext_out` alias the
    /// plain input/output trees; their propagation rules are identical.
    pub fn tree(&self, direction: Direction) -> Result<&Value> {
        match direction {
            Direction::In | Direction::ExtIn => Ok(&self.inputs),
            Direction::Out | Direction::ExtOut => Ok(&self.outputs),
            Direction::SubIn => self
                .sub_inputs
                .as_ref()
                .ok_or_else(|| Error::PathNotFound(format!("{}:sub_in", self.name))),
            Direction::SubOut => self
                .sub_outputs
                .as_ref()
                .ok_or_else(|| Error::PathNotFound(format!("{}:sub_out", self.name))),
        }
    }

    pub(crate) fn tree_mut(&mut self, direction: Direction) -> Result<&mut Value> {
        match direction {
            Direction::In | Direction::ExtIn => Ok(&mut self.inputs),
            Direction::Out | Direction::ExtOut => Ok(&mut self.outputs),
            Direction::SubIn => self
                .sub_inputs
                .as_mut()
                .ok_or_else(|| Error::PathNotFound(format!("{}:sub_in", self.name))),
            Direction::SubOut => self
                .sub_outputs
                .as_mut()
                .ok_or_else(|| Error::PathNotFound(format!("{}:sub_out", self.name))),
        }
    }

    /// Assign into one of this instance's trees, validating the type and
    /// recording the write version. Returns whether anything changed.
    pub(crate) fn write(
        &mut self,
        direction: Direction,
        steps: &[Step],
        value: &Value,
        version: Version,
    ) -> Result<bool> {
        self.tree_mut(direction)?.set(steps, value, version)
    }

    /// Re-evaluate the readiness predicate. Returns true if the instance
    /// just became ready.
    pub(crate) fn refresh_ready(&mut self) -> bool {
        let ready = match self.state {
            FiringState::Held | FiringState::Done => {
                // A pending completion re-arms the instance, as does a
                // fresh sub-network input (a composite collecting child
                // results).
                let sub_fresh = self
                    .sub_inputs
                    .as_ref()
                    .is_some_and(|tree| tree.version() > self.last_fired);
                !self.inbox.is_empty() || sub_fresh || self.inputs_fresh()
            }
            // A superseding activation: the firing condition holds again
            // while commands are still outstanding. The callback may abort
            // them with `cancel_prev_commands`.
            FiringState::Blocked => self.inputs_fresh(),
            FiringState::Ready | FiringState::Running => false,
        };

        if ready {
            self.state = FiringState::Ready;
        }
        ready
    }

    /// The input-side firing condition: any change for update-triggered
    /// functions, every required input set and fresh otherwise.
    fn inputs_fresh(&self) -> bool {
        if self.def.is_update_triggered() {
            return self.inputs.version() > self.last_fired;
        }
        let mut required = self.def.inputs().required_fields().peekable();
        if required.peek().is_none() {
            // No required inputs: fire on any fresh input.
            return self.inputs.version() > self.last_fired;
        }
        required.all(|name| {
            let steps = [Step::Field(name.to_string())];
            match self.inputs.lookup(&steps) {
                Some(node) => node.is_set() && node.version() > self.last_fired,
                // Held wins over Ready while anything is absent.
                None => false,
            }
        })
    }

    /// `Ready -> Running`, recording the fire.
    pub(crate) fn begin_fire(&mut self, at: Version) {
        debug_assert_eq!(self.state, FiringState::Ready);
        self.state = FiringState::Running;
        self.last_fired = at;
        self.fire_count += 1;
    }

    /// Record a newly dispatched command.
    pub(crate) fn add_outstanding(&mut self, id: CommandId) {
        self.outstanding.push(id);
        self.state = FiringState::Blocked;
    }

    /// Integrate a completion: clear the outstanding slot and queue the
    /// completion for the next fire. Returns true when no commands remain
    /// outstanding, i.e. the instance re-enters `Ready`.
    pub(crate) fn complete_command(&mut self, completion: Completion) -> bool {
        self.outstanding.retain(|id| *id != completion.id);
        self.inbox.push_back(completion);
        if self.outstanding.is_empty() {
            self.state = FiringState::Ready;
            true
        } else {
            false
        }
    }

    /// Capture the instance in an error state. Used for callback errors
    /// and cancellation; stops further firing of this activation.
    pub(crate) fn mark_error(&mut self, msg: impl Into<String>) {
        self.last_error = Some(msg.into());
        self.state = FiringState::Done;
    }

    /// Cancel this instance, draining its outstanding command ids so the
    /// caller can abort them with the collaborator.
    pub(crate) fn cancel(&mut self) -> Vec<CommandId> {
        self.mark_error(Error::Cancelled.to_string());
        self.inbox.clear();
        std::mem::take(&mut self.outstanding)
    }
}
