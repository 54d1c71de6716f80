//! Value Trees
//!
//! A [`Value`] is one node of a typed tree: records hold named children,
//! lists hold indexed children, unions hold one tagged child, and leaves
//! hold a [`Payload`]. Every node records the logical [`Version`] at which
//! it last changed, and a node's version is always >= the versions of its
//! children. That invariant is what lets the scheduler replay only changed
//! subpaths: [`Value::iter_updated`] walks the tree and prunes any subtree
//! whose root is at or below the cutoff.
//!
//! Writes are versioned. A write carrying a version older than the target
//! node's current version is stale (it raced with a newer write) and is
//! dropped rather than applied.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::{Step, Steps, steps_to_string};
use crate::types::Type;

/// A logical write timestamp. Versions are handed out by the engine's
/// clock; they only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    /// The next version after this one.
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A file reference: a path plus an optional content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub hash: Option<String>,
}

/// A leaf payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    File(FileRef),
}

impl Payload {
    /// The canonical name of the payload's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::Str(_) => "string",
            Payload::Bool(_) => "bool",
            Payload::File(_) => "file",
        }
    }

    /// The type tag of this payload.
    pub fn ty(&self) -> Type {
        match self {
            Payload::Int(_) => Type::Int,
            Payload::Float(_) => Type::Float,
            Payload::Str(_) => Type::Str,
            Payload::Bool(_) => Type::Bool,
            Payload::File(_) => Type::File,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Payload::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// The shape of one tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// No value has been written here yet.
    Empty,
    Leaf(Payload),
    Record(IndexMap<String, Value>),
    List(Vec<Value>),
    Union { tag: String, value: Box<Value> },
}

/// One node of a typed value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    ty: Type,
    version: Version,
    node: Node,
}

impl Value {
    /// An empty (unset) value of the given type.
    pub fn new(ty: Type) -> Self {
        Self {
            ty,
            version: Version::ZERO,
            node: Node::Empty,
        }
    }

    /// A leaf value; fails if the payload does not match the type.
    pub fn leaf(ty: Type, payload: Payload) -> Result<Self> {
        ty.validate_payload(&payload)?;
        Ok(Self {
            ty,
            version: Version::ZERO,
            node: Node::Leaf(payload),
        })
    }

    pub fn int(i: i64) -> Self {
        Self::leaf(Type::Int, Payload::Int(i)).unwrap()
    }

    pub fn float(f: f64) -> Self {
        Self::leaf(Type::Float, Payload::Float(f)).unwrap()
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::leaf(Type::Str, Payload::Str(s.into())).unwrap()
    }

    pub fn bool(b: bool) -> Self {
        Self::leaf(Type::Bool, Payload::Bool(b)).unwrap()
    }

    pub fn file(path: impl Into<String>, hash: Option<String>) -> Self {
        Self::leaf(
            Type::File,
            Payload::File(FileRef {
                path: path.into(),
                hash,
            }),
        )
        .unwrap()
    }

    /// A value of the given type filled with type defaults: zeroed leaves,
    /// records with every field defaulted, empty lists.
    pub fn default_for(ty: &Type) -> Self {
        let node = match ty {
            Type::Record(rec) => Node::Record(
                rec.fields
                    .iter()
                    .map(|(name, f)| (name.clone(), Value::default_for(&f.ty)))
                    .collect(),
            ),
            Type::List(_) => Node::List(Vec::new()),
            Type::Union(_) => Node::Empty,
            leaf => match leaf.default_payload() {
                Some(payload) => Node::Leaf(payload),
                None => Node::Empty,
            },
        };
        Self {
            ty: ty.clone(),
            version: Version::ZERO,
            node,
        }
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Whether a value has been written here (or below here).
    pub fn is_set(&self) -> bool {
        !matches!(self.node, Node::Empty)
    }

    /// The leaf payload, if this node is a leaf.
    pub fn payload(&self) -> Option<&Payload> {
        match &self.node {
            Node::Leaf(p) => Some(p),
            _ => None,
        }
    }

    /// Record children, if this node is a record.
    pub fn fields(&self) -> Option<&IndexMap<String, Value>> {
        match &self.node {
            Node::Record(map) => Some(map),
            _ => None,
        }
    }

    /// List children, if this node is a list.
    pub fn items(&self) -> Option<&[Value]> {
        match &self.node {
            Node::List(items) => Some(items),
            _ => None,
        }
    }

    /// Resolve a step list to a node, or fail with `PathNotFound`.
    pub fn get(&self, steps: &[Step]) -> Result<&Value> {
        self.lookup(steps)
            .ok_or_else(|| Error::PathNotFound(steps_to_string(steps)))
    }

    /// Resolve a step list to a node.
    pub fn lookup(&self, steps: &[Step]) -> Option<&Value> {
        let mut current = self;
        for step in steps {
            current = match (&current.node, step) {
                (Node::Record(map), Step::Field(name)) => map.get(name)?,
                (Node::List(items), Step::Index(i)) => items.get(*i)?,
                (Node::Union { tag, value }, Step::Field(name)) if tag == name => value,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Assign `src` into the subvalue at `steps`, stamping every written
    /// node with `version`.
    ///
    /// Intermediate record fields are created from the schema on the way
    /// down; writing past the end of a list extends it with type-default
    /// elements. Returns `false` without writing if the target node already
    /// carries a newer version (stale write).
    pub fn set(&mut self, steps: &[Step], src: &Value, version: Version) -> Result<bool> {
        self.check_set(steps, src)?;
        let changed = self.set_inner(steps, src, version)?;
        Ok(changed)
    }

    /// The type-check half of [`set`](Self::set), without the write: the
    /// path must exist in the schema and `src` must assign to it. Lets a
    /// caller validate a whole batch of writes before applying any.
    pub fn check_set(&self, steps: &[Step], src: &Value) -> Result<()> {
        let target_ty = self.ty.at(steps)?;
        if !target_ty.assignable_from(src.ty()) {
            return Err(Error::TypeMismatch {
                at: steps_to_string(steps),
                expected: target_ty.name(),
                found: src.ty().name(),
            });
        }
        Ok(())
    }

    fn set_inner(&mut self, steps: &[Step], src: &Value, version: Version) -> Result<bool> {
        match steps.split_first() {
            None => {
                if self.version > version {
                    tracing::debug!(have = %self.version, got = %version, "dropping stale write");
                    return Ok(false);
                }
                self.assign_from(src, version);
                Ok(true)
            }
            Some((step, rest)) => {
                let child = self.materialize_child(step)?;
                let changed = child.set_inner(rest, src, version)?;
                if changed && self.version < version {
                    self.version = version;
                }
                Ok(changed)
            }
        }
    }

    /// Fetch the child a step addresses, creating it (and, for lists, any
    /// missing predecessors) from the schema if it is not there yet.
    fn materialize_child(&mut self, step: &Step) -> Result<&mut Value> {
        // An empty node materializes into its compound shape on first
        // descent.
        if matches!(self.node, Node::Empty) {
            self.node = match (&self.ty, step) {
                (Type::Record(_), Step::Field(_)) => Node::Record(IndexMap::new()),
                (Type::List(_), Step::Index(_)) => Node::List(Vec::new()),
                (Type::Union(variants), Step::Field(tag)) => {
                    let inner_ty = variants
                        .get(tag)
                        .ok_or_else(|| Error::PathNotFound(tag.clone()))?;
                    Node::Union {
                        tag: tag.clone(),
                        value: Box::new(Value::new(inner_ty.clone())),
                    }
                }
                (ty, step) => {
                    return Err(Error::TypeMismatch {
                        at: step.to_string(),
                        expected: "record or list".to_string(),
                        found: ty.name(),
                    })
                }
            };
        }

        // Retagging a union replaces the whole branch; do it before taking
        // the child borrow.
        if let (Node::Union { tag, .. }, Step::Field(name)) = (&self.node, step) {
            if tag != name {
                let inner_ty = match &self.ty {
                    Type::Union(variants) => variants
                        .get(name)
                        .ok_or_else(|| Error::PathNotFound(name.clone()))?
                        .clone(),
                    _ => unreachable!("union node with non-union type"),
                };
                self.node = Node::Union {
                    tag: name.clone(),
                    value: Box::new(Value::new(inner_ty)),
                };
            }
        }

        match (&mut self.node, step) {
            (Node::Record(map), Step::Field(name)) => {
                if !map.contains_key(name) {
                    let field_ty = match &self.ty {
                        Type::Record(rec) => rec
                            .get(name)
                            .map(|f| f.ty.clone())
                            .ok_or_else(|| Error::PathNotFound(name.clone()))?,
                        _ => unreachable!("record node with non-record type"),
                    };
                    map.insert(name.clone(), Value::new(field_ty));
                }
                Ok(map.get_mut(name).unwrap())
            }
            (Node::List(items), Step::Index(i)) => {
                let elem_ty = match &self.ty {
                    Type::List(elem) => elem.as_ref().clone(),
                    _ => unreachable!("list node with non-list type"),
                };
                while items.len() <= *i {
                    items.push(Value::default_for(&elem_ty));
                }
                Ok(&mut items[*i])
            }
            (Node::Union { value, .. }, Step::Field(_)) => Ok(value),
            (_, step) => Err(Error::PathNotFound(step.to_string())),
        }
    }

    /// Copy `src` into this node wholesale, keeping this node's schema.
    ///
    /// Record fields unknown to the destination schema are skipped; this is
    /// the record-subset adaptation used when a connection narrows a record.
    fn assign_from(&mut self, src: &Value, version: Version) {
        match (&src.node, &self.ty) {
            // An unset source writes nothing.
            (Node::Empty, _) => return,
            (Node::Record(src_fields), Type::Record(rec)) => {
                let mut map = match std::mem::replace(&mut self.node, Node::Empty) {
                    Node::Record(map) => map,
                    _ => IndexMap::new(),
                };
                for (name, src_child) in src_fields {
                    let Some(field) = rec.get(name) else {
                        continue;
                    };
                    if !src_child.is_set() {
                        continue;
                    }
                    let dst = map
                        .entry(name.clone())
                        .or_insert_with(|| Value::new(field.ty.clone()));
                    dst.assign_from(src_child, version);
                }
                self.node = Node::Record(map);
            }
            (Node::List(src_items), Type::List(elem_ty)) => {
                let mut items = match std::mem::replace(&mut self.node, Node::Empty) {
                    Node::List(items) => items,
                    _ => Vec::new(),
                };
                for (i, src_child) in src_items.iter().enumerate() {
                    while items.len() <= i {
                        items.push(Value::default_for(elem_ty));
                    }
                    items[i].assign_from(src_child, version);
                }
                self.node = Node::List(items);
            }
            (Node::Union { tag, value }, Type::Union(variants)) => {
                let inner_ty = variants
                    .get(tag)
                    .cloned()
                    .unwrap_or_else(|| value.ty.clone());
                let mut inner = Value::new(inner_ty);
                inner.assign_from(value, version);
                self.node = Node::Union {
                    tag: tag.clone(),
                    value: Box::new(inner),
                };
            }
            // Tag narrowing: a concrete value enters a union slot.
            (_, Type::Union(variants)) => {
                if let Some((tag, inner_ty)) = variants
                    .iter()
                    .find(|(_, ty)| ty.assignable_from(src.ty()))
                {
                    let mut inner = Value::new(inner_ty.clone());
                    inner.assign_from(src, version);
                    self.node = Node::Union {
                        tag: tag.clone(),
                        value: Box::new(inner),
                    };
                }
            }
            (Node::Leaf(payload), _) => {
                self.node = Node::Leaf(payload.clone());
            }
            (node, _) => {
                self.node = node.clone();
            }
        }
        self.version = self.version.max(version);
    }

    /// Bump the version of the node at `steps` and of every ancestor.
    pub fn mark_updated(&mut self, steps: &[Step], version: Version) -> Result<()> {
        self.mark_inner(steps, version)
            .ok_or_else(|| Error::PathNotFound(steps_to_string(steps)))
    }

    fn mark_inner(&mut self, steps: &[Step], version: Version) -> Option<()> {
        if let Some((step, rest)) = steps.split_first() {
            let child = match (&mut self.node, step) {
                (Node::Record(map), Step::Field(name)) => map.get_mut(name)?,
                (Node::List(items), Step::Index(i)) => items.get_mut(*i)?,
                (Node::Union { tag, value }, Step::Field(name)) if tag == name => value,
                _ => return None,
            };
            child.mark_inner(rest, version)?;
        }
        self.version = self.version.max(version);
        Some(())
    }

    /// Whether the node at `steps` changed after `since`.
    pub fn is_updated(&self, steps: &[Step], since: Version) -> bool {
        self.lookup(steps)
            .map(|node| node.version > since)
            .unwrap_or(false)
    }

    /// Merge the parts of `src` newer than `cutoff` into this tree,
    /// stamping written nodes with `version`. This is the propagation
    /// delta-copy: subtrees whose root is at or below the cutoff are
    /// skipped entirely.
    pub fn merge(&mut self, src: &Value, cutoff: Version, version: Version) -> Result<bool> {
        if src.version <= cutoff {
            return Ok(false);
        }
        if !self.ty.assignable_from(src.ty()) {
            return Err(Error::TypeMismatch {
                at: String::new(),
                expected: self.ty.name(),
                found: src.ty().name(),
            });
        }
        Ok(self.merge_inner(src, cutoff, version))
    }

    /// [`Value::merge`] applied at a subpath, materializing intermediate
    /// nodes from the schema on the way down. This is how a propagation
    /// lands a source delta on a destination subvalue.
    pub fn merge_at(
        &mut self,
        steps: &[Step],
        src: &Value,
        cutoff: Version,
        version: Version,
    ) -> Result<bool> {
        let target_ty = self.ty.at(steps)?;
        if !target_ty.assignable_from(src.ty()) {
            return Err(Error::TypeMismatch {
                at: steps_to_string(steps),
                expected: target_ty.name(),
                found: src.ty().name(),
            });
        }
        self.merge_at_inner(steps, src, cutoff, version)
    }

    fn merge_at_inner(
        &mut self,
        steps: &[Step],
        src: &Value,
        cutoff: Version,
        version: Version,
    ) -> Result<bool> {
        match steps.split_first() {
            None => {
                if src.version <= cutoff {
                    return Ok(false);
                }
                Ok(self.merge_inner(src, cutoff, version))
            }
            Some((step, rest)) => {
                let child = self.materialize_child(step)?;
                let changed = child.merge_at_inner(rest, src, cutoff, version)?;
                if changed && self.version < version {
                    self.version = version;
                }
                Ok(changed)
            }
        }
    }

    fn merge_inner(&mut self, src: &Value, cutoff: Version, version: Version) -> bool {
        if src.version <= cutoff {
            return false;
        }
        match (&src.node, &self.ty) {
            (Node::Record(src_fields), Type::Record(rec)) => {
                let mut map = match std::mem::replace(&mut self.node, Node::Empty) {
                    Node::Record(map) => map,
                    _ => IndexMap::new(),
                };
                let mut changed = false;
                for (name, src_child) in src_fields {
                    let Some(field) = rec.get(name) else {
                        continue;
                    };
                    let dst = map
                        .entry(name.clone())
                        .or_insert_with(|| Value::new(field.ty.clone()));
                    changed |= dst.merge_inner(src_child, cutoff, version);
                }
                self.node = Node::Record(map);
                if changed {
                    self.version = self.version.max(version);
                }
                changed
            }
            (Node::List(src_items), Type::List(elem_ty)) => {
                let mut items = match std::mem::replace(&mut self.node, Node::Empty) {
                    Node::List(items) => items,
                    _ => Vec::new(),
                };
                let mut changed = false;
                for (i, src_child) in src_items.iter().enumerate() {
                    while items.len() <= i {
                        items.push(Value::default_for(elem_ty));
                        changed = true;
                    }
                    changed |= items[i].merge_inner(src_child, cutoff, version);
                }
                self.node = Node::List(items);
                if changed {
                    self.version = self.version.max(version);
                }
                changed
            }
            // Leaves, unions, and narrowed values replace wholesale.
            _ => {
                self.assign_from(src, version);
                true
            }
        }
    }

    /// Iterate (path, node) over every node whose version is newer than
    /// `since`, in depth-first preorder. The walk is lazy and prunes
    /// subtrees at or below the cutoff; calling it again with the same
    /// cutoff restarts it.
    pub fn iter_updated(&self, since: Version) -> UpdatedIter<'_> {
        let mut stack = Vec::new();
        if self.version > since {
            stack.push((Steps::new(), self));
        }
        UpdatedIter { stack, since }
    }

    /// Validate the whole tree against its type tags.
    pub fn validate(&self) -> Result<()> {
        match (&self.node, &self.ty) {
            (Node::Empty, _) => Ok(()),
            (Node::Leaf(payload), ty) => ty.validate_payload(payload),
            (Node::Record(map), Type::Record(rec)) => {
                for (name, child) in map {
                    if rec.get(name).is_none() {
                        return Err(Error::PathNotFound(name.clone()));
                    }
                    child.validate()?;
                }
                Ok(())
            }
            (Node::List(items), Type::List(_)) => {
                for item in items {
                    item.validate()?;
                }
                Ok(())
            }
            (Node::Union { tag, value }, Type::Union(variants)) => {
                if variants.get(tag).is_none() {
                    return Err(Error::PathNotFound(tag.clone()));
                }
                value.validate()
            }
            (node, ty) => Err(Error::TypeMismatch {
                at: String::new(),
                expected: ty.name(),
                found: format!("{node:?}"),
            }),
        }
    }

    /// Check the version invariant: every node's version >= the max of its
    /// children's versions. Used by tests.
    pub fn version_invariant_holds(&self) -> bool {
        let children: Vec<&Value> = match &self.node {
            Node::Record(map) => map.values().collect(),
            Node::List(items) => items.iter().collect(),
            Node::Union { value, .. } => vec![value],
            _ => Vec::new(),
        };
        children
            .iter()
            .all(|c| c.version <= self.version && c.version_invariant_holds())
    }
}

/// Iterator returned by [`Value::iter_updated`].
pub struct UpdatedIter<'a> {
    stack: Vec<(Steps, &'a Value)>,
    since: Version,
}

impl<'a> Iterator for UpdatedIter<'a> {
    type Item = (Steps, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        let (steps, value) = self.stack.pop()?;
        let mut push = |step: Step, child: &'a Value| {
            if child.version > self.since {
                let mut child_steps = steps.clone();
                child_steps.push(step);
                self.stack.push((child_steps, child));
            }
        };
        match &value.node {
            Node::Record(map) => {
                for (name, child) in map.iter().rev() {
                    push(Step::Field(name.clone()), child);
                }
            }
            Node::List(items) => {
                for (i, child) in items.iter().enumerate().rev() {
                    push(Step::Index(i), child);
                }
            }
            Node::Union { tag, value: child } => {
                push(Step::Field(tag.clone()), child);
            }
            _ => {}
        }
        Some((steps, value))
    }
}
