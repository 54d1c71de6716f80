//! Subvalue Paths
//!
//! A path addresses one node inside an instance's value trees:
//!
//! ```text
//! instanceID ( ':' direction )? ( '.' field | '[' index ']' )* ( '::' module )*
//! ```
//!
//! `direction` selects which tree of the instance the path descends into
//! (`in`, `out`, `sub_in`, `sub_out`, `ext_in`, `ext_out`), the dotted and
//! bracketed steps descend into records and lists, and trailing `::`
//! segments qualify a module name. The token `self` names the current
//! instance inside callback context.
//!
//! Examples: `a:in.x`, `b:out.terms[3]`, `self:sub_in.conf`, `math::add`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// The reserved token naming the current instance in callback context.
pub const SELF: &str = "self";

/// Which value tree of an instance a path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    SubIn,
    SubOut,
    /// External-facing input at a network boundary. Propagates like `In`.
    ExtIn,
    /// External-facing output at a network boundary. Propagates like `Out`.
    ExtOut,
}

impl Direction {
    /// Whether the tree is written by the outside world (inputs) or by the
    /// instance's own firings (outputs).
    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::SubIn | Direction::ExtIn)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::SubIn => "sub_in",
            Direction::SubOut => "sub_out",
            Direction::ExtIn => "ext_in",
            Direction::ExtOut => "ext_out",
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "sub_in" => Ok(Direction::SubIn),
            "sub_out" => Ok(Direction::SubOut),
            "ext_in" => Ok(Direction::ExtIn),
            "ext_out" => Ok(Direction::ExtOut),
            other => Err(Error::PathParse(
                other.to_string(),
                "not a direction".to_string(),
            )),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step into a value tree: a record field or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Field(String),
    Index(usize),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Field(name) => write!(f, ".{name}"),
            Step::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A sequence of steps. Paths are short; four inline steps cover almost
/// every real project.
pub type Steps = SmallVec<[Step; 4]>;

/// A parsed subvalue path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// The instance id, or [`SELF`].
    pub instance: String,
    /// Which value tree to descend into, if given.
    pub direction: Option<Direction>,
    /// Steps below the tree root.
    pub steps: Steps,
    /// Trailing module qualifiers, used by qualified function names.
    pub modules: Vec<String>,
}

impl Path {
    /// Build a path from parts, with no module qualifiers.
    pub fn new(instance: impl Into<String>, direction: Direction, steps: Steps) -> Self {
        Self {
            instance: instance.into(),
            direction: Some(direction),
            steps,
            modules: Vec::new(),
        }
    }

    /// Whether the path names the current instance.
    pub fn is_self(&self) -> bool {
        self.instance == SELF
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse_err = |msg: &str| Error::PathParse(s.to_string(), msg.to_string());

        // Split off trailing module qualifiers first.
        let mut modules = Vec::new();
        let mut head = s;
        if let Some(idx) = s.find("::") {
            head = &s[..idx];
            for seg in s[idx + 2..].split("::") {
                if seg.is_empty() {
                    return Err(parse_err("empty module segment"));
                }
                modules.push(seg.to_string());
            }
        }

        let (instance, rest) = match head.find(':') {
            Some(idx) => (&head[..idx], Some(&head[idx + 1..])),
            None => (head, None),
        };
        if instance.is_empty() {
            return Err(parse_err("empty instance id"));
        }

        let mut direction = None;
        let mut steps = Steps::new();
        if let Some(rest) = rest {
            // The direction runs up to the first '.' or '['.
            let dir_end = rest
                .find(|c| c == '.' || c == '[')
                .unwrap_or(rest.len());
            direction = Some(rest[..dir_end].parse::<Direction>()?);
            steps = parse_steps_tail(&rest[dir_end..])
                .map_err(|msg| parse_err(&msg))?;
        }

        Ok(Path {
            instance: instance.to_string(),
            direction,
            steps,
            modules,
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.instance)?;
        if let Some(dir) = self.direction {
            write!(f, ":{dir}")?;
        }
        for step in &self.steps {
            write!(f, "{step}")?;
        }
        for module in &self.modules {
            write!(f, "::{module}")?;
        }
        Ok(())
    }
}

/// Parse a relative step list such as `x`, `terms[3]`, or `conf.box.x`.
///
/// The first segment is a bare field name; callbacks use these to address
/// items inside their own input and output trees.
pub fn parse_steps(s: &str) -> Result<Steps> {
    if s.is_empty() {
        return Ok(Steps::new());
    }
    let lead = if s.starts_with('[') { "" } else { "." };
    parse_steps_tail(&format!("{lead}{s}"))
        .map_err(|msg| Error::PathParse(s.to_string(), msg))
}

/// Parse a step tail where every field is introduced by `.` and every index
/// by `[`.
fn parse_steps_tail(mut s: &str) -> std::result::Result<Steps, String> {
    let mut steps = Steps::new();
    while !s.is_empty() {
        if let Some(rest) = s.strip_prefix('.') {
            let end = rest
                .find(|c| c == '.' || c == '[')
                .unwrap_or(rest.len());
            if end == 0 {
                return Err("empty field name".to_string());
            }
            steps.push(Step::Field(rest[..end].to_string()));
            s = &rest[end..];
        } else if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| "unclosed square bracket".to_string())?;
            let index: usize = rest[..end]
                .trim()
                .parse()
                .map_err(|_| format!("bad index '{}'", &rest[..end]))?;
            steps.push(Step::Index(index));
            s = &rest[end + 1..];
        } else {
            return Err(format!("unexpected character at '{s}'"));
        }
    }
    Ok(steps)
}

/// Render a step list without a leading separator, the inverse of
/// [`parse_steps`].
pub fn steps_to_string(steps: &[Step]) -> String {
    let mut out = String::new();
    for (i, step) in steps.iter().enumerate() {
        match step {
            Step::Field(name) if i == 0 => out.push_str(name),
            step => out.push_str(&step.to_string()),
        }
    }
    out
}

/// The identifiers that can never name an instance or field.
const RESERVED: &[&str] = &[SELF, "in", "out", "sub_in", "sub_out", "ext_in", "ext_out"];

/// Check an instance or field identifier and normalize it.
///
/// Identifiers start with a letter and contain letters, digits, and
/// underscores. Dashes are accepted and rewritten to underscores for
/// compatibility with older project files.
pub fn valid_identifier(id: &str) -> Result<String> {
    let normalized = id.replace('-', "_");
    let mut chars = normalized.chars();
    let ok = match chars.next() {
        Some(first) => {
            first.is_ascii_alphabetic()
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !ok || RESERVED.contains(&normalized.as_str()) {
        return Err(Error::InvalidIdentifier(id.to_string()));
    }
    Ok(normalized)
}
