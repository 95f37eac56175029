//! Consumers: the ways a site can require a non-nil value.

use crate::guard::Nonce;
use crate::trigger::TriggerKind;
use nilgazer_annotations::{ObservedMap, Site};
use nilgazer_hir::Pos;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The closed set of consumption forms. `Always` variants fail whenever a
/// nil value reaches them; conditional variants fail only when their
/// underlying site is (deep-)non-nil.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consumer {
    /// Dereference of a pointer.
    PtrLoad,
    /// Keyed read out of a map that is itself possibly nil. Only emitted
    /// when the nilable-map-read diagnostic is enabled.
    MapAccess,
    /// Keyed write into a map; writing through nil panics.
    MapWrittenTo,
    /// Index into a slice.
    SliceAccess,
    /// Selection of a field through a possibly-nil base.
    FieldAccess,
    /// A value returned in an error result position.
    UseAsErrorResult { site: Site },
    /// Assignment into a struct field.
    FieldAssign { site: Site },
    /// A struct literal's field flowing into a function parameter.
    ArgFieldPass { site: Site },
    /// Assignment into a package-level variable.
    GlobalVarAssign { site: Site },
    /// A value passed as an argument.
    ArgPass { site: Site },
    /// A value used as a method receiver.
    RecvPass { site: Site },
    /// Affiliation, covariant side.
    InterfaceResultFromImplementation { site: Site },
    /// Affiliation, contravariant side.
    MethodParamFromInterface { site: Site },
    /// A value returned from a function. `ret_stmt` points at the return
    /// statement itself, which is the diagnostic position for named
    /// results.
    UseAsReturn { site: Site, ret_stmt: Pos },
    /// A struct literal's field flowing out through a result.
    UseAsFieldOfReturn { site: Site },
    /// Deep assignment forms: the assigned value lands in the container's
    /// deep position.
    SliceAssign { site: Site },
    PtrAssign { site: Site },
    MapAssign { site: Site },
    ChanSend { site: Site },
    ParamAssignDeep { site: Site },
    FuncRetAssignDeep { site: Site },
    FieldAssignDeep { site: Site },
    GlobalVarAssignDeep { site: Site },
    LocalVarAssignDeep { site: Site },
    VariadicParamAssignDeep { site: Site },
    /// Deep assignment into a container whose element type cannot be nil;
    /// never fails.
    DeepAssignPrimitive,
    /// Struct-init checking: a field escaping its constructing function.
    FieldEscape { site: Site },
    /// A non-error result returned alongside a nil error; the error
    /// convention promises it non-nil.
    UseAsNonErrorRetDependentOnErrorRet { site: Site, ret_stmt: Pos },
    /// An error result returned whose nilability could not be decided.
    UseAsErrorRetWithNilabilityUnknown { site: Site, ret_stmt: Pos },
    /// Unconditionally requires non-nil.
    Tautology,
}

impl Consumer {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Consumer::PtrLoad
            | Consumer::MapAccess
            | Consumer::MapWrittenTo
            | Consumer::SliceAccess
            | Consumer::FieldAccess
            | Consumer::Tautology => TriggerKind::Always,

            Consumer::UseAsErrorResult { .. }
            | Consumer::FieldAssign { .. }
            | Consumer::ArgFieldPass { .. }
            | Consumer::GlobalVarAssign { .. }
            | Consumer::ArgPass { .. }
            | Consumer::RecvPass { .. }
            | Consumer::InterfaceResultFromImplementation { .. }
            | Consumer::MethodParamFromInterface { .. }
            | Consumer::UseAsReturn { .. }
            | Consumer::UseAsFieldOfReturn { .. }
            | Consumer::FieldEscape { .. }
            | Consumer::UseAsNonErrorRetDependentOnErrorRet { .. }
            | Consumer::UseAsErrorRetWithNilabilityUnknown { .. } => TriggerKind::Conditional,

            Consumer::SliceAssign { .. }
            | Consumer::PtrAssign { .. }
            | Consumer::MapAssign { .. }
            | Consumer::ChanSend { .. }
            | Consumer::ParamAssignDeep { .. }
            | Consumer::FuncRetAssignDeep { .. }
            | Consumer::FieldAssignDeep { .. }
            | Consumer::GlobalVarAssignDeep { .. }
            | Consumer::LocalVarAssignDeep { .. }
            | Consumer::VariadicParamAssignDeep { .. }
            | Consumer::DeepAssignPrimitive => TriggerKind::DeepConditional,
        }
    }

    pub fn site(&self) -> Option<&Site> {
        match self {
            Consumer::UseAsErrorResult { site }
            | Consumer::FieldAssign { site }
            | Consumer::ArgFieldPass { site }
            | Consumer::GlobalVarAssign { site }
            | Consumer::ArgPass { site }
            | Consumer::RecvPass { site }
            | Consumer::InterfaceResultFromImplementation { site }
            | Consumer::MethodParamFromInterface { site }
            | Consumer::UseAsReturn { site, .. }
            | Consumer::UseAsFieldOfReturn { site }
            | Consumer::SliceAssign { site }
            | Consumer::PtrAssign { site }
            | Consumer::MapAssign { site }
            | Consumer::ChanSend { site }
            | Consumer::ParamAssignDeep { site }
            | Consumer::FuncRetAssignDeep { site }
            | Consumer::FieldAssignDeep { site }
            | Consumer::GlobalVarAssignDeep { site }
            | Consumer::LocalVarAssignDeep { site }
            | Consumer::VariadicParamAssignDeep { site }
            | Consumer::FieldEscape { site }
            | Consumer::UseAsNonErrorRetDependentOnErrorRet { site, .. }
            | Consumer::UseAsErrorRetWithNilabilityUnknown { site, .. } => Some(site),
            _ => None,
        }
    }

    /// Whether this consumer requires non-nil under the annotation map
    /// `m`. `Always` variants require it unconditionally; conditional
    /// variants when their site is fixed non-nilable.
    pub fn check_consume(&self, m: &ObservedMap) -> bool {
        match self {
            Consumer::DeepAssignPrimitive => false,
            _ => match self.kind() {
                TriggerKind::Always => true,
                TriggerKind::Never => false,
                TriggerKind::Conditional => self
                    .site()
                    .is_some_and(|site| !m.lookup(site).0.is_nilable),
                TriggerKind::DeepConditional => self
                    .site()
                    .is_some_and(|site| !m.lookup(site).0.is_deep_nilable),
            },
        }
    }

    /// The diagnostic category label for the consumption form.
    pub fn category(&self) -> &'static str {
        match self {
            Consumer::PtrLoad | Consumer::FieldAccess => "dereferenced",
            Consumer::MapAccess | Consumer::MapWrittenTo | Consumer::SliceAccess => "keyed into",
            Consumer::ArgPass { .. }
            | Consumer::ArgFieldPass { .. }
            | Consumer::RecvPass { .. }
            | Consumer::MethodParamFromInterface { .. } => "passed",
            Consumer::UseAsReturn { .. }
            | Consumer::UseAsErrorResult { .. }
            | Consumer::UseAsFieldOfReturn { .. }
            | Consumer::InterfaceResultFromImplementation { .. }
            | Consumer::UseAsNonErrorRetDependentOnErrorRet { .. }
            | Consumer::UseAsErrorRetWithNilabilityUnknown { .. } => "returned",
            Consumer::ChanSend { .. } => "sent over",
            Consumer::FieldEscape { .. } => "escaped",
            _ => "assigned into",
        }
    }

    pub fn prestring(&self) -> String {
        match self {
            Consumer::PtrLoad => "dereferenced".to_string(),
            Consumer::MapAccess => "read from as a nilable map".to_string(),
            Consumer::MapWrittenTo => "written to as a map".to_string(),
            Consumer::SliceAccess => "indexed into".to_string(),
            Consumer::FieldAccess => "accessed for a field".to_string(),
            Consumer::UseAsErrorResult { site } => format!("returned as the error {site}"),
            Consumer::FieldAssign { site } => format!("assigned into {site}"),
            Consumer::ArgFieldPass { site } => format!("passed as {site}"),
            Consumer::GlobalVarAssign { site } => format!("assigned into {site}"),
            Consumer::ArgPass { site } => format!("passed as {site}"),
            Consumer::RecvPass { site } => format!("used as {site}"),
            Consumer::InterfaceResultFromImplementation { site } => {
                format!("returned through the interface {site}")
            }
            Consumer::MethodParamFromInterface { site } => {
                format!("received by the implementation {site}")
            }
            Consumer::UseAsReturn { site, .. } => format!("returned as {site}"),
            Consumer::UseAsFieldOfReturn { site } => format!("returned as {site}"),
            Consumer::SliceAssign { site }
            | Consumer::PtrAssign { site }
            | Consumer::MapAssign { site }
            | Consumer::ParamAssignDeep { site }
            | Consumer::FuncRetAssignDeep { site }
            | Consumer::FieldAssignDeep { site }
            | Consumer::GlobalVarAssignDeep { site }
            | Consumer::LocalVarAssignDeep { site }
            | Consumer::VariadicParamAssignDeep { site } => {
                format!("assigned into the deep position of {site}")
            }
            Consumer::ChanSend { site } => format!("sent over {site}"),
            Consumer::DeepAssignPrimitive => {
                "assigned into a non-nil-element container".to_string()
            }
            Consumer::FieldEscape { site } => format!("escaping through {site}"),
            Consumer::UseAsNonErrorRetDependentOnErrorRet { site, .. } => {
                format!("returned as {site} alongside a nil error")
            }
            Consumer::UseAsErrorRetWithNilabilityUnknown { site, .. } => {
                format!("returned as {site} with undecided nilability")
            }
            Consumer::Tautology => "required non-nil".to_string(),
        }
    }

    pub fn deep_copy(&self) -> Consumer {
        self.clone()
    }
}

/// One hop of an assignment trail: `rhs` flowed into `lhs` at `pos`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub lhs: String,
    pub rhs: String,
    pub pos: Pos,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` to `{}` at {}", self.rhs, self.lhs, self.pos)
    }
}

/// A consumer anchored at its consuming expression, carrying the guard
/// nonces it has passed through during backward propagation and the
/// ordered assignment trail accumulated while lifting across assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeTrigger {
    pub consumer: Consumer,
    /// Description of the consuming expression; with `pos`, its identity.
    pub expr_desc: String,
    pub pos: Pos,
    pub guards: BTreeSet<Nonce>,
    pub guard_matched: bool,
    pub needs_guard: bool,
    pub trail: Vec<Assignment>,
}

impl ConsumeTrigger {
    pub fn new(consumer: Consumer, expr_desc: impl Into<String>, pos: Pos) -> Self {
        Self {
            consumer,
            expr_desc: expr_desc.into(),
            pos,
            guards: BTreeSet::new(),
            guard_matched: false,
            needs_guard: true,
            trail: Vec::new(),
        }
    }

    /// Appends a trail entry, keeping insertion order and dropping exact
    /// duplicates.
    pub fn push_trail(&mut self, entry: Assignment) {
        if !self.trail.contains(&entry) {
            self.trail.push(entry);
        }
    }

    /// Identity equality used by trigger merging: same consumption form on
    /// the same expression with the same guard-matched status.
    pub fn same_consumption(&self, other: &ConsumeTrigger) -> bool {
        self.same_consumption_modulo_guarding(other) && self.guard_matched == other.guard_matched
    }

    /// As [`Self::same_consumption`] but ignoring the guard bit.
    pub fn same_consumption_modulo_guarding(&self, other: &ConsumeTrigger) -> bool {
        self.consumer == other.consumer
            && self.expr_desc == other.expr_desc
            && self.pos == other.pos
    }

    /// Join-point merge: guard sets intersect (a guard survives only when
    /// held on both paths), guard-matched conjoins, trails concatenate in
    /// order without duplicates.
    pub fn merge(&self, other: &ConsumeTrigger) -> ConsumeTrigger {
        let mut merged = self.deep_copy();
        merged.guards = self.guards.intersection(&other.guards).copied().collect();
        merged.guard_matched = self.guard_matched && other.guard_matched;
        for entry in &other.trail {
            merged.push_trail(entry.clone());
        }
        merged
    }

    pub fn deep_copy(&self) -> ConsumeTrigger {
        ConsumeTrigger {
            consumer: self.consumer.deep_copy(),
            expr_desc: self.expr_desc.clone(),
            pos: self.pos.clone(),
            guards: self.guards.clone(),
            guard_matched: self.guard_matched,
            needs_guard: self.needs_guard,
            trail: self.trail.clone(),
        }
    }
}

impl fmt::Display for ConsumeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} at {}", self.expr_desc, self.consumer.prestring(), self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_annotations::Val;
    use nilgazer_hir::FuncId;

    fn arg_pass() -> Consumer {
        Consumer::ArgPass {
            site: Site::Param {
                func: FuncId::new("pkg", "g"),
                index: 0,
            },
        }
    }

    #[test]
    fn tautology_consumers_always_fire() {
        let map = ObservedMap::new();
        assert!(Consumer::PtrLoad.check_consume(&map));
        assert!(Consumer::Tautology.check_consume(&map));
        assert!(!Consumer::DeepAssignPrimitive.check_consume(&map));
    }

    #[test]
    fn conditional_consumer_fires_when_site_nonnil() {
        let consumer = arg_pass();
        let mut map = ObservedMap::new();
        // Unknown site: optimistic default is non-nilable, so the
        // consumer requires non-nil.
        assert!(consumer.check_consume(&map));
        map.insert(consumer.site().unwrap().clone(), Val::nilable(true));
        assert!(!consumer.check_consume(&map));
    }

    #[test]
    fn merge_intersects_guards_and_conjoins_match() {
        let mut a = ConsumeTrigger::new(arg_pass(), "`x`", Pos::default());
        let mut b = a.deep_copy();
        a.guards.extend([Nonce(1), Nonce(2)]);
        a.guard_matched = true;
        b.guards.extend([Nonce(2), Nonce(3)]);
        b.guard_matched = false;
        let merged = a.merge(&b);
        assert_eq!(merged.guards, BTreeSet::from([Nonce(2)]));
        assert!(!merged.guard_matched);
    }

    #[test]
    fn trail_keeps_insertion_order_and_dedups() {
        let mut trigger = ConsumeTrigger::new(arg_pass(), "`x`", Pos::default());
        let first = Assignment {
            lhs: "x.f".into(),
            rhs: "tmp".into(),
            pos: Pos::new("a.src", 45, 1),
        };
        let second = Assignment {
            lhs: "tmp".into(),
            rhs: "fresh()".into(),
            pos: Pos::new("a.src", 44, 1),
        };
        trigger.push_trail(first.clone());
        trigger.push_trail(second.clone());
        trigger.push_trail(first.clone());
        assert_eq!(trigger.trail, vec![first, second]);
    }
}
