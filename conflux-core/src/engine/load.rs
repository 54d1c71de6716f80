//! Project Loading
//!
//! A project description is an ordered list of [`LoadEvent`]s: instance
//! creations, connections, and initial values. [`Engine::load`] replays
//! them in order against the root network without running the scheduler,
//! so a half-loaded network never fires. Initial values are queued like
//! any external write and land on the first call to
//! [`Engine::run_until_quiescent`].
//!
//! Events derive `Deserialize`, so a project file is just a JSON array:
//!
//! ```json
//! [
//!   { "instance": { "name": "a", "function": "math::add" } },
//!   { "connection": { "src": "a:out.sum", "dst": "b:in.x" } },
//!   { "value": { "dst": "a:in.x", "value": ... } }
//! ]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::Value;

use super::Engine;

/// One entry of a project description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadEvent {
    Instance { name: String, function: String },
    Connection { src: String, dst: String },
    Value { dst: String, value: Value },
}

impl Engine {
    /// Replay a project description into the root network. Structural
    /// errors abort the load at the offending event.
    pub fn load(&self, events: impl IntoIterator<Item = LoadEvent>) -> Result<()> {
        for event in events {
            match event {
                LoadEvent::Instance { name, function } => {
                    self.add_instance(&name, &function)?;
                }
                LoadEvent::Connection { src, dst } => {
                    self.connect(&src, &dst)?;
                }
                LoadEvent::Value { dst, value } => {
                    self.write(&dst, value)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_as_json() {
        let events = vec![
            LoadEvent::Instance {
                name: "a".to_string(),
                function: "math::add".to_string(),
            },
            LoadEvent::Connection {
                src: "a:out.sum".to_string(),
                dst: "b:in.x".to_string(),
            },
            LoadEvent::Value {
                dst: "a:in.x".to_string(),
                value: Value::int(2),
            },
        ];
        let json = serde_json::to_string(&events).unwrap();
        let back: Vec<LoadEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, events);
    }
}
