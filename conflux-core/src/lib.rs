//! Conflux Core
//!
//! This crate provides the core runtime for Conflux, a dataflow engine for
//! long-running scientific workflows. It implements:
//!
//! - Typed value trees with per-node version stamps
//! - Function definitions and live instances with a firing state machine
//! - Networks of typed connections, nestable through composite instances
//! - A deterministic scheduler that propagates deltas and fires callbacks
//! - External command dispatch with blocking/completion bookkeeping
//! - Snapshot persistence and restart
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `types`: Structural value types and the type registry
//! - `value`: Versioned value trees and delta merging
//! - `path`: The subvalue path grammar (`inst:dir.field[i]`)
//! - `func`: Function definitions, callbacks, and run I/O staging
//! - `net`: The arena of networks, instances, and connections
//! - `engine`: The scheduler/propagator main loop and command lifecycle
//! - `persist`: Snapshots and the append-only scratch log
//!
//! # Example
//!
//! ```rust,ignore
//! use conflux_core::engine::{Engine, NullDispatcher};
//! use conflux_core::value::Value;
//!
//! let engine = Engine::new(registry, Arc::new(NullDispatcher::default()), "/tmp/proj");
//!
//! engine.add_instance("a", "math::add")?;
//! engine.write("a:in.x", Value::int(2))?;
//! engine.write("a:in.y", Value::int(3))?;
//!
//! engine.run_until_quiescent()?;
//! assert_eq!(engine.value("a:out.sum")?.payload(), Some(&Payload::Int(5)));
//! ```

pub mod engine;
pub mod error;
pub mod func;
pub mod net;
pub mod path;
pub mod persist;
pub mod types;
pub mod value;

pub use engine::{
    Command, CommandDispatcher, CommandId, CommandStatus, Completion, DispatchedCommand, Engine,
    LoadEvent, NullDispatcher,
};
pub use error::{Error, Result};
pub use func::{Callback, FunctionDef, FunctionRegistry, RunInput, RunOutput};
pub use net::{FiringState, InstanceStatus};
pub use path::{Direction, Path, Step};
pub use types::{Field, RecordType, Type, TypeRegistry};
pub use value::{Payload, Value, Version};
