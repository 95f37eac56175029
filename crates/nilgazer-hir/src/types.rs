//! The analyzed language's type model.
//!
//! Reference-like shapes (pointer, slice, map, channel, interface,
//! function) admit the distinguished nil value; value shapes do not.
//! Named types are referenced by [`TypeId`] and resolved through
//! [`Scope`], which keeps recursive definitions representable.

use crate::{Param, Pos, Scope, Symbol, TypeId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Bool,
    Int,
    Float,
    Str,
    Pointer(Box<Type>),
    Slice(Box<Type>),
    Array(usize, Box<Type>),
    Map(Box<Type>, Box<Type>),
    Chan(Box<Type>),
    /// A structural interface. The error interface is [`Type::Error`].
    Interface(Vec<MethodSig>),
    /// The built-in error interface.
    Error,
    Func(Box<FuncType>),
    Named(TypeId),
    Struct(Vec<FieldDef>),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub results: Vec<Type>,
}

/// A method in an interface definition. `doc` carries the method's
/// doc-comment lines so nullability annotations attach to it the same
/// way they do to top-level functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSig {
    pub name: Symbol,
    pub doc: Vec<String>,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub results: Vec<Param>,
}

impl MethodSig {
    pub fn sig(&self) -> crate::FuncSig {
        crate::FuncSig {
            receiver: None,
            params: SmallVec::from_vec(self.params.clone()),
            variadic: self.variadic,
            results: SmallVec::from_vec(self.results.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: Symbol,
    pub ty: Type,
    pub pos: Pos,
}

impl Type {
    /// Resolves named types down to their underlying shape.
    pub fn underlying<'a>(&'a self, scope: &'a Scope) -> &'a Type {
        let mut ty = self;
        // Named chains are finite in well-formed input; Unknown stops the
        // walk for foreign ids.
        for _ in 0..32 {
            match ty {
                Type::Named(id) => ty = scope.underlying(id),
                other => return other,
            }
        }
        ty
    }

    /// Whether a value of this type can be nil.
    pub fn admits_nil(&self, scope: &Scope) -> bool {
        matches!(
            self.underlying(scope),
            Type::Pointer(_)
                | Type::Slice(_)
                | Type::Map(_, _)
                | Type::Chan(_)
                | Type::Interface(_)
                | Type::Error
                | Type::Func(_)
                | Type::Unknown
        )
    }

    /// The type sitting at this type's deep position: the element of a
    /// slice, array, or channel, the value type of a map, the pointee of a
    /// pointer. `None` for types with no deep position.
    pub fn deep_target<'a>(&'a self, scope: &'a Scope) -> Option<&'a Type> {
        match self.underlying(scope) {
            Type::Pointer(elem)
            | Type::Slice(elem)
            | Type::Array(_, elem)
            | Type::Chan(elem) => Some(elem),
            Type::Map(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn is_error(&self, scope: &Scope) -> bool {
        matches!(self.underlying(scope), Type::Error)
    }

    pub fn is_bool(&self, scope: &Scope) -> bool {
        matches!(self.underlying(scope), Type::Bool)
    }

    pub fn is_map(&self, scope: &Scope) -> bool {
        matches!(self.underlying(scope), Type::Map(_, _))
    }

    pub fn is_chan(&self, scope: &Scope) -> bool {
        matches!(self.underlying(scope), Type::Chan(_))
    }

    pub fn is_slice(&self, scope: &Scope) -> bool {
        matches!(self.underlying(scope), Type::Slice(_))
    }

    pub fn is_interface(&self, scope: &Scope) -> bool {
        matches!(self.underlying(scope), Type::Interface(_) | Type::Error)
    }

    /// The id of this type if it is named, looking through one level of
    /// pointer (`*T` has the methods of `T` for affiliation purposes).
    pub fn named_id(&self) -> Option<&TypeId> {
        match self {
            Type::Named(id) => Some(id),
            Type::Pointer(inner) => match inner.as_ref() {
                Type::Named(id) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    /// Struct fields of this type, resolving named wrappers and one level
    /// of pointer indirection.
    pub fn struct_fields<'a>(&'a self, scope: &'a Scope) -> Option<&'a [FieldDef]> {
        match self.underlying(scope) {
            Type::Struct(fields) => Some(fields),
            Type::Pointer(inner) => match inner.underlying(scope) {
                Type::Struct(fields) => Some(fields),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "string"),
            Type::Pointer(elem) => write!(f, "*{elem}"),
            Type::Slice(elem) => write!(f, "[]{elem}"),
            Type::Array(n, elem) => write!(f, "[{n}]{elem}"),
            Type::Map(k, v) => write!(f, "map[{k}]{v}"),
            Type::Chan(elem) => write!(f, "chan {elem}"),
            Type::Interface(methods) => write!(f, "interface{{{} methods}}", methods.len()),
            Type::Error => write!(f, "error"),
            Type::Func(sig) => {
                write!(f, "func({} args, {} results)", sig.params.len(), sig.results.len())
            }
            Type::Named(id) => write!(f, "{id}"),
            Type::Struct(fields) => write!(f, "struct{{{} fields}}", fields.len()),
            Type::Unknown => write!(f, "<unknown>"),
        }
    }
}
