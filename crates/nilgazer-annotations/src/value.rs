//! Annotation values: shallow and deep nilability with set markers.

use nilgazer_hir::{Scope, Type};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The nullability assigned to a site.
///
/// The `*_set` bits distinguish an explicit fix (literal annotation or an
/// inference outcome) from a type default; set values dominate defaults
/// and are never overwritten by them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Val {
    pub is_nilable: bool,
    pub is_nilable_set: bool,
    pub is_deep_nilable: bool,
    pub is_deep_nilable_set: bool,
}

impl Val {
    /// The value a map miss yields: nothing known, nothing set.
    pub const EMPTY: Val = Val {
        is_nilable: false,
        is_nilable_set: false,
        is_deep_nilable: false,
        is_deep_nilable_set: false,
    };

    /// An explicitly fixed shallow annotation.
    pub fn nilable(value: bool) -> Val {
        Val {
            is_nilable: value,
            is_nilable_set: true,
            ..Val::EMPTY
        }
    }

    /// An explicitly fixed deep annotation.
    pub fn deep_nilable(value: bool) -> Val {
        Val {
            is_deep_nilable: value,
            is_deep_nilable_set: true,
            ..Val::EMPTY
        }
    }

    /// The type-default value for a site of type `ty`: slices, maps,
    /// channels, and the error interface default nilable; pointers,
    /// functions, and plain interfaces default non-nil. Deep bits follow
    /// the default of the type at the deep position. Defaults are not
    /// marked set.
    pub fn from_type(ty: &Type, scope: &Scope) -> Val {
        Val {
            is_nilable: type_default_shallow(ty, scope),
            is_nilable_set: false,
            is_deep_nilable: ty
                .deep_target(scope)
                .is_some_and(|elem| type_default_shallow(elem, scope)),
            is_deep_nilable_set: false,
        }
    }

    /// Fixes the shallow bit unless it is already set.
    pub fn set_nilable(&mut self, value: bool) {
        if !self.is_nilable_set {
            self.is_nilable = value;
            self.is_nilable_set = true;
        }
    }

    /// Fixes the deep bit unless it is already set.
    pub fn set_deep_nilable(&mut self, value: bool) {
        if !self.is_deep_nilable_set {
            self.is_deep_nilable = value;
            self.is_deep_nilable_set = true;
        }
    }

    /// Fills unset bits from `default` without disturbing set ones.
    pub fn or_default(mut self, default: Val) -> Val {
        if !self.is_nilable_set {
            self.is_nilable = default.is_nilable;
        }
        if !self.is_deep_nilable_set {
            self.is_deep_nilable = default.is_deep_nilable;
        }
        self
    }
}

fn type_default_shallow(ty: &Type, scope: &Scope) -> bool {
    matches!(
        ty.underlying(scope),
        Type::Slice(_) | Type::Map(_, _) | Type::Chan(_) | Type::Error
    )
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |value: bool, set: bool| match (value, set) {
            (true, true) => "nilable!",
            (true, false) => "nilable",
            (false, true) => "nonnil!",
            (false, false) => "nonnil",
        };
        write!(
            f,
            "{}/{}",
            bit(self.is_nilable, self.is_nilable_set),
            bit(self.is_deep_nilable, self.is_deep_nilable_set)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_defaults_nilable_shallow_not_deep() {
        let scope = Scope::new();
        let val = Val::from_type(&Type::Slice(Box::new(Type::Int)), &scope);
        assert!(val.is_nilable);
        assert!(!val.is_nilable_set);
        assert!(!val.is_deep_nilable);
    }

    #[test]
    fn slice_of_pointers_defaults_deep_nonnil() {
        // The deep default follows the element's own default, and pointer
        // elements default non-nil.
        let scope = Scope::new();
        let val = Val::from_type(
            &Type::Slice(Box::new(Type::Pointer(Box::new(Type::Int)))),
            &scope,
        );
        assert!(val.is_nilable);
        assert!(!val.is_deep_nilable);
    }

    #[test]
    fn map_of_slices_defaults_deep_nilable() {
        let scope = Scope::new();
        let val = Val::from_type(
            &Type::Map(Box::new(Type::Str), Box::new(Type::Slice(Box::new(Type::Int)))),
            &scope,
        );
        assert!(val.is_nilable);
        assert!(val.is_deep_nilable);
    }

    #[test]
    fn pointer_defaults_nonnil() {
        let scope = Scope::new();
        let val = Val::from_type(&Type::Pointer(Box::new(Type::Int)), &scope);
        assert!(!val.is_nilable);
        assert!(!val.is_nilable_set);
    }

    #[test]
    fn literal_annotation_dominates_default() {
        let scope = Scope::new();
        let mut val = Val::nilable(false);
        val.set_nilable(true);
        assert!(!val.is_nilable, "set values must not be overwritten");
        let filled = val.or_default(Val::from_type(&Type::Error, &scope));
        assert!(!filled.is_nilable);
    }
}
