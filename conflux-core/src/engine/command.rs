//! External Commands
//!
//! A firing callback may emit commands: units of external work (typically a
//! simulation or analysis run) handed to the command-queue collaborator and
//! executed on a remote worker. The engine wraps each [`Command`] into a
//! [`DispatchedCommand`] with a unique id and the emitting instance's
//! persistent directory, forwards it through the [`CommandDispatcher`]
//! trait, and keeps the instance `Blocked` until every outstanding command
//! has come back as a [`Completion`].

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::{Payload, Value};

/// Unique id of a dispatched command, assigned by the engine in dispatch
/// order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CommandId(pub u64);

/// An external work unit as emitted by a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// The executable key, e.g. `math/double` or `gromacs/mdrun`.
    pub key: String,
    /// Positional argument payloads.
    pub args: Vec<Payload>,
    /// Required worker resources, e.g. `cores -> 8`.
    pub resources: IndexMap<String, i64>,
}

impl Command {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: Vec::new(),
            resources: IndexMap::new(),
        }
    }

    pub fn arg(mut self, payload: Payload) -> Self {
        self.args.push(payload);
        self
    }

    pub fn resource(mut self, name: impl Into<String>, amount: i64) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }
}

/// A command as handed to the external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedCommand {
    pub id: CommandId,
    /// Canonical name of the emitting instance.
    pub instance: String,
    pub command: Command,
    /// The emitting instance's scratch directory; workers stage files here.
    pub persistent_dir: PathBuf,
}

/// Terminal status of a completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

/// An inbound command completion from the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: CommandId,
    pub status: CommandStatus,
    /// Result values keyed by output name.
    pub values: IndexMap<String, Value>,
    /// Produced files, name to path.
    pub output_files: IndexMap<String, String>,
    pub diagnostics: Option<String>,
}

impl Completion {
    /// A successful completion carrying the given result values.
    pub fn success(id: CommandId, values: IndexMap<String, Value>) -> Self {
        Self {
            id,
            status: CommandStatus::Success,
            values,
            output_files: IndexMap::new(),
            diagnostics: None,
        }
    }

    /// A failed completion with a diagnostic message.
    pub fn failure(id: CommandId, diagnostics: impl Into<String>) -> Self {
        Self {
            id,
            status: CommandStatus::Failed,
            values: IndexMap::new(),
            output_files: IndexMap::new(),
            diagnostics: Some(diagnostics.into()),
        }
    }
}

/// The command-queue collaborator. Implementations forward commands to
/// workers and deliver results back through
/// [`Engine::complete_command`](crate::engine::Engine::complete_command).
///
/// `dispatch` must not block: it runs on the scheduler thread.
pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, cmd: &DispatchedCommand) -> Result<()>;

    /// Abort an outstanding command. Best-effort; the default does nothing.
    fn cancel(&self, id: CommandId) -> Result<()> {
        let _ = id;
        Ok(())
    }
}

/// A dispatcher that records commands and never runs them. Useful for
/// tests and dry-run validation.
#[derive(Default)]
pub struct NullDispatcher {
    pub dispatched: parking_lot::Mutex<Vec<DispatchedCommand>>,
    pub cancelled: parking_lot::Mutex<Vec<CommandId>>,
}

impl CommandDispatcher for NullDispatcher {
    fn dispatch(&self, cmd: &DispatchedCommand) -> Result<()> {
        self.dispatched.lock().push(cmd.clone());
        Ok(())
    }

    fn cancel(&self, id: CommandId) -> Result<()> {
        self.cancelled.lock().push(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_builder() {
        let cmd = Command::new("math/double")
            .arg(Payload::Int(21))
            .resource("cores", 2);
        assert_eq!(cmd.key, "math/double");
        assert_eq!(cmd.args.len(), 1);
        assert_eq!(cmd.resources.get("cores"), Some(&2));
    }

    #[test]
    fn null_dispatcher_records() {
        let dispatcher = NullDispatcher::default();
        let cmd = DispatchedCommand {
            id: CommandId(1),
            instance: "a".to_string(),
            command: Command::new("x/y"),
            persistent_dir: PathBuf::from("/tmp/a"),
        };
        dispatcher.dispatch(&cmd).unwrap();
        dispatcher.cancel(CommandId(1)).unwrap();
        assert_eq!(dispatcher.dispatched.lock().len(), 1);
        assert_eq!(*dispatcher.cancelled.lock(), vec![CommandId(1)]);
    }
}
