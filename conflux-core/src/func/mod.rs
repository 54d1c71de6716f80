//! Function Definitions
//!
//! A [`FunctionDef`] is the immutable template behind every active
//! instance: its input and output schemas, optional sub-network schemas,
//! readiness flags, and the [`Callback`] invoked when the instance fires.
//!
//! Definitions live in a process-wide [`FunctionRegistry`] populated during
//! the init phase and frozen before activation begins. After the freeze the
//! registry is read-only and shared without locks.

mod runio;

pub use runio::{NewConnection, NewInstance, RunInput, RunOutput};

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::path::valid_identifier;
use crate::types::RecordType;

/// The single-method interface every user function implements.
///
/// `fire` is invoked once per event: an input change or a command
/// completion (distinguished by [`RunInput::cmd`]). It reads through the
/// input view and stages all its effects on the [`RunOutput`]; nothing is
/// applied until the engine reintegrates the staging after the call
/// returns. Returning an error is equivalent to calling
/// [`RunOutput::set_error`].
pub trait Callback: Send + Sync {
    fn fire(&self, input: &RunInput, out: &mut RunOutput) -> Result<()>;
}

impl<F> Callback for F
where
    F: Fn(&RunInput, &mut RunOutput) -> Result<()> + Send + Sync,
{
    fn fire(&self, input: &RunInput, out: &mut RunOutput) -> Result<()> {
        self(input, out)
    }
}

/// An immutable function template.
pub struct FunctionDef {
    name: String,
    inputs: RecordType,
    outputs: RecordType,
    subnet_inputs: Option<RecordType>,
    subnet_outputs: Option<RecordType>,
    update_triggered: bool,
    stateful: bool,
    callback: Arc<dyn Callback>,
}

impl FunctionDef {
    /// Create a definition. `name` is module-qualified, e.g. `math::add`.
    pub fn new(
        name: &str,
        inputs: RecordType,
        outputs: RecordType,
        callback: Arc<dyn Callback>,
    ) -> Result<Self> {
        for segment in name.split("::") {
            valid_identifier(segment)?;
        }
        Ok(Self {
            name: name.to_string(),
            inputs,
            outputs,
            subnet_inputs: None,
            subnet_outputs: None,
            update_triggered: false,
            stateful: false,
            callback,
        })
    }

    /// Declare the sub-network input schema of a composite function.
    pub fn with_subnet_inputs(mut self, schema: RecordType) -> Self {
        self.subnet_inputs = Some(schema);
        self
    }

    /// Declare the sub-network output schema of a composite function.
    pub fn with_subnet_outputs(mut self, schema: RecordType) -> Self {
        self.subnet_outputs = Some(schema);
        self
    }

    /// Any single input change makes an instance of this function ready,
    /// instead of requiring every `required` input to be fresh.
    pub fn update_triggered(mut self) -> Self {
        self.update_triggered = true;
        self
    }

    /// Mark the function as command-emitting. Connection cycles are legal
    /// only when they pass through a stateful instance.
    pub fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &RecordType {
        &self.inputs
    }

    pub fn outputs(&self) -> &RecordType {
        &self.outputs
    }

    pub fn subnet_inputs(&self) -> Option<&RecordType> {
        self.subnet_inputs.as_ref()
    }

    pub fn subnet_outputs(&self) -> Option<&RecordType> {
        self.subnet_outputs.as_ref()
    }

    pub fn is_update_triggered(&self) -> bool {
        self.update_triggered
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn callback(&self) -> &Arc<dyn Callback> {
        &self.callback
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("update_triggered", &self.update_triggered)
            .field("stateful", &self.stateful)
            .finish_non_exhaustive()
    }
}

/// Module-qualified-name lookup table for function definitions.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    by_name: IndexMap<String, Arc<FunctionDef>>,
    frozen: bool,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Fails after [`FunctionRegistry::freeze`] or
    /// if the name is taken.
    pub fn register(&mut self, def: FunctionDef) -> Result<()> {
        if self.frozen {
            return Err(Error::RegistryFrozen("function"));
        }
        let name = def.name.clone();
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateInstance(name));
        }
        self.by_name.insert(name, Arc::new(def));
        Ok(())
    }

    /// Look up a definition by module-qualified name.
    pub fn lookup(&self, name: &str) -> Result<Arc<FunctionDef>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    /// End the init phase. Further registration is rejected.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}
