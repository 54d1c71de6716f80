//! Type System
//!
//! Every value flowing through a network carries a type drawn from a closed
//! set: the four primitives, file references, lists, records, and tagged
//! unions. Types are structural; two types are the same iff their shapes
//! are the same.
//!
//! Assignment compatibility is deliberately strict: a source type assigns
//! to a destination iff the destination is a supertype (a record with a
//! subset of the fields, a union with a superset of the variants) or the
//! two are structurally identical. There is no implicit numeric widening —
//! an `int` never silently becomes a `float` across a connection.
//!
//! The [`TypeRegistry`] maps canonical names to types. It is populated
//! during init and frozen before the first instance activates; lookups
//! after that are lock-free.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::{Step, valid_identifier};
use crate::value::Payload;

/// A data type. The variant set is closed; dispatch over it is always a
/// complete match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Int,
    Float,
    Str,
    Bool,
    /// A file reference: a path plus an optional content hash.
    File,
    List(Box<Type>),
    Record(RecordType),
    /// A tagged union: variant name to payload type.
    Union(IndexMap<String, Type>),
}

/// One field of a record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub ty: Type,
    /// Required fields gate instance readiness; optional fields do not.
    pub required: bool,
}

/// A record type: ordered named fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordType {
    pub fields: IndexMap<String, Field>,
}

impl RecordType {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, validating its name. Builder-style.
    pub fn field(mut self, name: &str, ty: Type, required: bool) -> Result<Self> {
        let name = valid_identifier(name)?;
        self.fields.insert(name, Field { ty, required });
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Names of the fields that must hold a value before an instance with
    /// this input schema may fire.
    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, f)| f.required)
            .map(|(name, _)| name.as_str())
    }
}

impl Type {
    /// Convenience constructor for list types.
    pub fn list(element: Type) -> Type {
        Type::List(Box::new(element))
    }

    /// The canonical name of this type, e.g. `list<float>`.
    pub fn name(&self) -> String {
        match self {
            Type::Int => "int".to_string(),
            Type::Float => "float".to_string(),
            Type::Str => "string".to_string(),
            Type::Bool => "bool".to_string(),
            Type::File => "file".to_string(),
            Type::List(elem) => format!("list<{}>", elem.name()),
            Type::Record(rec) => {
                let fields: Vec<String> = rec
                    .fields
                    .iter()
                    .map(|(name, f)| format!("{name}:{}", f.ty.name()))
                    .collect();
                format!("record{{{}}}", fields.join(","))
            }
            Type::Union(variants) => {
                let tags: Vec<String> = variants
                    .iter()
                    .map(|(tag, ty)| format!("{tag}:{}", ty.name()))
                    .collect();
                format!("union{{{}}}", tags.join(","))
            }
        }
    }

    /// Whether this type has child nodes (records, lists, unions) rather
    /// than a single payload.
    pub fn is_compound(&self) -> bool {
        matches!(self, Type::List(_) | Type::Record(_) | Type::Union(_))
    }

    /// Whether `src` may be assigned across a boundary whose declared type
    /// is `self`.
    ///
    /// The relation is reflexive and covers two adaptations applied during
    /// propagation: record-subset (the destination sees a subset of the
    /// source's fields) and union widening (every source variant exists in
    /// the destination union).
    pub fn assignable_from(&self, src: &Type) -> bool {
        match (self, src) {
            (Type::Record(dst), Type::Record(src)) => {
                dst.fields.iter().all(|(name, dst_field)| {
                    src.get(name)
                        .is_some_and(|src_field| dst_field.ty.assignable_from(&src_field.ty))
                })
            }
            (Type::Union(dst), Type::Union(src)) => src.iter().all(|(tag, src_ty)| {
                dst.get(tag).is_some_and(|dst_ty| dst_ty.assignable_from(src_ty))
            }),
            // Tag narrowing: a concrete value enters a union holding it.
            (Type::Union(dst), src) => {
                dst.values().any(|dst_ty| dst_ty.assignable_from(src))
            }
            (Type::List(dst), Type::List(src)) => dst.assignable_from(src),
            (dst, src) => dst == src,
        }
    }

    /// The default payload for a leaf type; `None` for compound types and
    /// for files, which have no meaningful default content.
    pub fn default_payload(&self) -> Option<Payload> {
        match self {
            Type::Int => Some(Payload::Int(0)),
            Type::Float => Some(Payload::Float(0.0)),
            Type::Str => Some(Payload::Str(String::new())),
            Type::Bool => Some(Payload::Bool(false)),
            Type::File | Type::List(_) | Type::Record(_) | Type::Union(_) => None,
        }
    }

    /// Validate a leaf payload against this type.
    pub fn validate_payload(&self, payload: &Payload) -> Result<()> {
        let ok = matches!(
            (self, payload),
            (Type::Int, Payload::Int(_))
                | (Type::Float, Payload::Float(_))
                | (Type::Str, Payload::Str(_))
                | (Type::Bool, Payload::Bool(_))
                | (Type::File, Payload::File(_))
        );
        if ok {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                at: String::new(),
                expected: self.name(),
                found: payload.type_name().to_string(),
            })
        }
    }

    /// Navigate the schema along a step list, returning the type of the
    /// node the steps address.
    pub fn at(&self, steps: &[Step]) -> Result<&Type> {
        let mut current = self;
        for step in steps {
            current = match (current, step) {
                (Type::Record(rec), Step::Field(name)) => rec
                    .get(name)
                    .map(|f| &f.ty)
                    .ok_or_else(|| Error::PathNotFound(name.clone()))?,
                (Type::List(elem), Step::Index(_)) => elem,
                (Type::Union(variants), Step::Field(tag)) => variants
                    .get(tag)
                    .ok_or_else(|| Error::PathNotFound(tag.clone()))?,
                (other, step) => {
                    return Err(Error::TypeMismatch {
                        at: step.to_string(),
                        expected: "record or list".to_string(),
                        found: other.name(),
                    })
                }
            };
        }
        Ok(current)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Canonical-name lookup table for types.
///
/// Registration happens during the init phase; [`TypeRegistry::freeze`]
/// ends it. Reads after freeze need no synchronization — the table is
/// shared behind an `Arc` and never mutated again.
#[derive(Debug)]
pub struct TypeRegistry {
    by_name: IndexMap<String, Type>,
    frozen: bool,
}

impl TypeRegistry {
    /// A registry seeded with the built-in primitive and file types.
    pub fn new() -> Self {
        let mut by_name = IndexMap::new();
        for ty in [Type::Int, Type::Float, Type::Str, Type::Bool, Type::File] {
            by_name.insert(ty.name(), ty);
        }
        Self {
            by_name,
            frozen: false,
        }
    }

    /// Register a named type. Fails after [`TypeRegistry::freeze`].
    pub fn register(&mut self, name: &str, ty: Type) -> Result<()> {
        if self.frozen {
            return Err(Error::RegistryFrozen("type"));
        }
        self.by_name.insert(name.to_string(), ty);
        Ok(())
    }

    /// Look up a type by canonical name.
    pub fn lookup(&self, name: &str) -> Result<&Type> {
        self.by_name
            .get(name)
            .ok_or_else(|| Error::UnknownType(name.to_string()))
    }

    /// End the init phase. Further registration is rejected.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
