//! Annotation sites: stable identities of program locations carrying
//! nullability.

use nilgazer_hir::{FieldId, FuncId, FuncSig, GlobalId, Pos, Symbol, TypeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A program location that can carry a nullability label.
///
/// Equality and ordering are structural on the variant payload; the
/// derived total order (discriminant, then payload) is the tie-breaker the
/// solver uses for deterministic explanation selection.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Site {
    /// A named struct field.
    Field(FieldId),
    /// A declaration-site parameter. For variadic functions this site
    /// stands for the *element* of the variadic slice, and argument
    /// indices fold onto it (see [`Site::param`]).
    Param { func: FuncId, index: usize },
    /// A context-sensitive copy of [`Site::Param`] at one call site of a
    /// contracted function.
    CallSiteParam {
        func: FuncId,
        index: usize,
        loc: Pos,
    },
    /// A declaration-site result.
    Result { func: FuncId, index: usize },
    /// A context-sensitive copy of [`Site::Result`].
    CallSiteResult {
        func: FuncId,
        index: usize,
        loc: Pos,
    },
    /// A method receiver.
    Receiver { func: FuncId },
    /// The type-level deep position of a named container or pointer type.
    TypeName(TypeId),
    /// A package-level variable.
    GlobalVar(GlobalId),
    /// A function-local variable; only its deep position is ever
    /// annotatable, shallow locals are inferred flow-sensitively.
    LocalVar { func: FuncId, name: Symbol },
    /// Struct-init checking: field `field` observed through parameter
    /// `index` of `func`.
    ParamField {
        func: FuncId,
        index: usize,
        field: FieldId,
    },
    /// Struct-init checking: field `field` observed through result
    /// `index` of `func`.
    ResultField {
        func: FuncId,
        index: usize,
        field: FieldId,
    },
    /// Struct-init checking: a field whose enclosing struct escapes the
    /// function that built it.
    EscapeField(FieldId),
}

/// The declared entity behind a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteObject<'a> {
    Func(&'a FuncId),
    Field(&'a FieldId),
    Type(&'a TypeId),
    Global(&'a GlobalId),
}

impl Site {
    /// Builds a `Param` site, folding variadic argument indices onto the
    /// last declared parameter.
    pub fn param(func: &FuncId, sig: &FuncSig, index: usize) -> Self {
        Site::Param {
            func: func.clone(),
            index: sig.fold_param_index(index),
        }
    }

    pub fn call_site_param(func: &FuncId, sig: &FuncSig, index: usize, loc: Pos) -> Self {
        Site::CallSiteParam {
            func: func.clone(),
            index: sig.fold_param_index(index),
            loc,
        }
    }

    pub fn result(func: &FuncId, index: usize) -> Self {
        Site::Result {
            func: func.clone(),
            index,
        }
    }

    pub fn call_site_result(func: &FuncId, index: usize, loc: Pos) -> Self {
        Site::CallSiteResult {
            func: func.clone(),
            index,
            loc,
        }
    }

    /// The declared entity this site hangs off.
    pub fn object(&self) -> SiteObject<'_> {
        match self {
            Site::Field(field) | Site::EscapeField(field) => SiteObject::Field(field),
            Site::Param { func, .. }
            | Site::CallSiteParam { func, .. }
            | Site::Result { func, .. }
            | Site::CallSiteResult { func, .. }
            | Site::Receiver { func }
            | Site::LocalVar { func, .. }
            | Site::ParamField { func, .. }
            | Site::ResultField { func, .. } => SiteObject::Func(func),
            Site::TypeName(ty) => SiteObject::Type(ty),
            Site::GlobalVar(var) => SiteObject::Global(var),
        }
    }

    /// The package owning this site's declared entity.
    pub fn pkg(&self) -> &str {
        match self.object() {
            SiteObject::Func(f) => &f.pkg,
            SiteObject::Field(f) => &f.owner.pkg,
            SiteObject::Type(t) => &t.pkg,
            SiteObject::Global(g) => &g.pkg,
        }
    }

    /// Strips call-site context, mapping `CallSiteParam`/`CallSiteResult`
    /// onto their declaration-site counterparts.
    pub fn decl_site(&self) -> Site {
        match self {
            Site::CallSiteParam { func, index, .. } => Site::Param {
                func: func.clone(),
                index: *index,
            },
            Site::CallSiteResult { func, index, .. } => Site::Result {
                func: func.clone(),
                index: *index,
            },
            other => other.clone(),
        }
    }

    /// Explicit deep copy. `Clone` already duplicates every owned payload;
    /// this name exists for the copy-discipline call sites.
    pub fn deep_copy(&self) -> Site {
        self.clone()
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Field(field) => write!(f, "field `{field}`"),
            Site::Param { func, index } => write!(f, "param {index} of `{func}`"),
            Site::CallSiteParam { func, index, loc } => {
                write!(f, "param {index} of `{func}` at call site {loc}")
            }
            Site::Result { func, index } => write!(f, "result {index} of `{func}`"),
            Site::CallSiteResult { func, index, loc } => {
                write!(f, "result {index} of `{func}` at call site {loc}")
            }
            Site::Receiver { func } => write!(f, "receiver of `{func}`"),
            Site::TypeName(ty) => write!(f, "deep type `{ty}`"),
            Site::GlobalVar(var) => write!(f, "global `{var}`"),
            Site::LocalVar { func, name } => write!(f, "local `{name}` of `{func}`"),
            Site::ParamField { func, index, field } => {
                write!(f, "field `{field}` of param {index} of `{func}`")
            }
            Site::ResultField { func, index, field } => {
                write!(f, "field `{field}` of result {index} of `{func}`")
            }
            Site::EscapeField(field) => write!(f, "escaping field `{field}`"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_hir::{Param, Type};
    use smallvec::smallvec;

    fn variadic_sig() -> FuncSig {
        FuncSig {
            receiver: None,
            params: smallvec![
                Param::named("fmt", Type::Str, Pos::default()),
                Param::named("args", Type::Slice(Box::new(Type::Error)), Pos::default()),
            ],
            variadic: true,
            results: smallvec![],
        }
    }

    #[test]
    fn equality_is_structural() {
        let func = FuncId::new("pkg", "f");
        let a = Site::Param {
            func: func.clone(),
            index: 1,
        };
        let b = Site::Param { func, index: 1 };
        assert_eq!(a, b);
        assert_eq!(a, a.deep_copy());
    }

    #[test]
    fn variadic_args_fold_to_last_param() {
        let func = FuncId::new("pkg", "logf");
        let sig = variadic_sig();
        assert_eq!(
            Site::param(&func, &sig, 4),
            Site::Param {
                func: func.clone(),
                index: 1
            }
        );
        assert_eq!(
            Site::param(&func, &sig, 1),
            Site::Param { func, index: 1 }
        );
    }

    #[test]
    fn call_site_strips_to_decl_site() {
        let func = FuncId::new("pkg", "f");
        let cs = Site::CallSiteResult {
            func: func.clone(),
            index: 0,
            loc: Pos::new("a.src", 3, 1),
        };
        assert_eq!(cs.decl_site(), Site::Result { func, index: 0 });
    }

    #[test]
    fn display_is_compact() {
        let site = Site::Receiver {
            func: FuncId::new("pkg", "List.head"),
        };
        assert_eq!(site.to_string(), "receiver of `pkg.List.head`");
    }
}
