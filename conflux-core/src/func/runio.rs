//! Function Run I/O
//!
//! [`RunInput`] is the read-only view a callback receives when it fires: a
//! snapshot of the instance's input trees, the completed command that
//! triggered the fire (if any), and the instance's persistent directory.
//!
//! [`RunOutput`] is the staging object the callback populates. Every
//! mutation a fire produces — output writes, sub-network edits, commands,
//! diagnostics — is staged here and applied atomically by the engine after
//! the callback returns. If the callback sets an error, none of the staged
//! mutations are applied.

use std::path::{Path as FsPath, PathBuf};
use std::str::FromStr;

use crate::engine::command::{Command, Completion};
use crate::error::{Error, Result};
use crate::path::{parse_steps, Path, Steps};
use crate::value::{Payload, Value, Version};

/// Read-only input view for one fire.
pub struct RunInput {
    pub(crate) testing: bool,
    pub(crate) inputs: Value,
    pub(crate) sub_inputs: Option<Value>,
    pub(crate) cmd: Option<Completion>,
    pub(crate) persistent_dir: PathBuf,
    pub(crate) last_fired: Version,
}

impl RunInput {
    /// True during dry-run validation; callbacks should not emit commands
    /// or touch the filesystem when testing.
    pub fn testing(&self) -> bool {
        self.testing
    }

    /// Whether the named input holds a value.
    pub fn has_input(&self, path: &str) -> bool {
        parse_steps(path)
            .ok()
            .and_then(|steps| self.inputs.lookup(&steps))
            .map(|v| v.is_set())
            .unwrap_or(false)
    }

    /// The payload at an input path, if any.
    pub fn get_input(&self, path: &str) -> Result<Option<&Payload>> {
        let steps = parse_steps(path)?;
        Ok(self.inputs.lookup(&steps).and_then(|v| v.payload()))
    }

    /// The payload at an input path, or [`Error::MissingField`] if nothing
    /// has been written there. For inputs the firing predicate does not
    /// already guarantee, e.g. optional fields a particular run insists on.
    pub fn require_input(&self, path: &str) -> Result<&Payload> {
        self.get_input(path)?
            .ok_or_else(|| Error::MissingField(path.to_string()))
    }

    /// The full value node at an input path, with version metadata.
    pub fn get_input_value(&self, path: &str) -> Result<&Value> {
        let steps = parse_steps(path)?;
        self.inputs.get(&steps)
    }

    /// Whether the input changed since the last fire of this instance.
    pub fn is_input_updated(&self, path: &str) -> bool {
        parse_steps(path)
            .map(|steps| self.inputs.is_updated(&steps, self.last_fired))
            .unwrap_or(false)
    }

    /// The sub-network input tree of a composite instance.
    pub fn sub_inputs(&self) -> Option<&Value> {
        self.sub_inputs.as_ref()
    }

    /// The payload at a sub-network input path, if any.
    pub fn get_sub_input(&self, path: &str) -> Result<Option<&Payload>> {
        let steps = parse_steps(path)?;
        Ok(self
            .sub_inputs
            .as_ref()
            .and_then(|tree| tree.lookup(&steps))
            .and_then(|v| v.payload()))
    }

    /// The completed command that triggered this fire, or `None` for an
    /// input-triggered fire.
    pub fn cmd(&self) -> Option<&Completion> {
        self.cmd.as_ref()
    }

    /// The instance's persistent scratch directory.
    pub fn persistent_dir(&self) -> &FsPath {
        &self.persistent_dir
    }
}

/// A staged child-instance creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstance {
    pub name: String,
    pub function: String,
}

/// A staged connection, or a constant injection when `src` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConnection {
    pub src: Option<Path>,
    pub dst: Path,
    pub value: Option<Value>,
}

/// Staged output of one fire.
#[derive(Default)]
pub struct RunOutput {
    pub(crate) outs: Vec<(Steps, Value)>,
    pub(crate) sub_outs: Vec<(Steps, Value)>,
    pub(crate) instances: Vec<NewInstance>,
    pub(crate) connections: Vec<NewConnection>,
    pub(crate) commands: Vec<Command>,
    pub(crate) cancel_prev: bool,
    pub(crate) error: Option<String>,
    pub(crate) warnings: Vec<String>,
}

impl RunOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write into the output tree.
    pub fn set_out(&mut self, path: &str, value: Value) -> Result<()> {
        self.outs.push((parse_steps(path)?, value));
        Ok(())
    }

    /// Queue a write into the sub-network output tree.
    pub fn set_sub_out(&mut self, path: &str, value: Value) -> Result<()> {
        self.sub_outs.push((parse_steps(path)?, value));
        Ok(())
    }

    /// Request creation of a child instance in this instance's sub-network.
    pub fn add_instance(&mut self, name: &str, function: &str) {
        self.instances.push(NewInstance {
            name: name.to_string(),
            function: function.to_string(),
        });
    }

    /// Request a new connection in this instance's sub-network. Endpoint
    /// paths may use `self` for the composite instance itself. A `None`
    /// source injects `value` into the destination once.
    pub fn add_connection(
        &mut self,
        src: Option<&str>,
        dst: &str,
        value: Option<Value>,
    ) -> Result<()> {
        let src = src.map(Path::from_str).transpose()?;
        self.connections.push(NewConnection {
            src,
            dst: dst.parse()?,
            value,
        });
        Ok(())
    }

    /// Register an external command; its completion re-triggers this
    /// instance.
    pub fn add_command(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    /// Ask the engine to abort this instance's still-outstanding commands
    /// before registering the newly staged ones.
    pub fn cancel_prev_commands(&mut self) {
        self.cancel_prev = true;
    }

    /// Attach an error. The engine discards all staged mutations and moves
    /// the instance to `Done` with this message.
    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.error = Some(msg.into());
    }

    /// Attach an advisory warning.
    pub fn set_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Whether the callback staged anything at all.
    pub fn is_empty(&self) -> bool {
        self.outs.is_empty()
            && self.sub_outs.is_empty()
            && self.instances.is_empty()
            && self.connections.is_empty()
            && self.commands.is_empty()
            && self.error.is_none()
            && self.warnings.is_empty()
    }
}
