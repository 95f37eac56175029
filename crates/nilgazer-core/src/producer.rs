//! Producers: the ways a value can reach a consumption site as nil.
//!
//! The variant set is closed. Each variant carries at most one [`Site`]
//! plus a couple of booleans; the four behavioral shapes (always nil,
//! never nil, nil-if-site-nilable, nil-if-site-deep-nilable) are exposed
//! through [`Producer::kind`].

use crate::trigger::TriggerKind;
use nilgazer_annotations::{ObservedMap, Site};
use nilgazer_hir::Pos;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Producer {
    /// Read of a (non-variadic) function parameter.
    FuncParam { site: Site },
    FuncParamDeep { site: Site },
    /// A function's result observed at a call. `guarded` marks results
    /// participating in the error/ok return protocol: they are only
    /// trustworthy behind the matching check.
    FuncReturn { site: Site, guarded: bool },
    FuncReturnDeep { site: Site },
    FieldRead { site: Site },
    FieldReadDeep { site: Site },
    GlobalVarRead { site: Site },
    GlobalVarReadDeep { site: Site },
    LocalVarReadDeep { site: Site },
    /// Read out of a map; sound only behind the ok-form guard.
    MapRead { site: Site, needs_guard: bool },
    /// Receive from a channel; sound only behind the ok-form guard.
    ChanRecv { site: Site, needs_guard: bool },
    VariadicFuncParam { site: Site },
    VariadicFuncParamDeep { site: Site },
    MethodRecv { site: Site },
    MethodRecvDeep { site: Site },
    /// The literal nil.
    ConstNil,
    /// A struct field never assigned before its struct escaped.
    UnassignedField { site: Site },
    /// A local declared but never assigned; its zero value is nil.
    NoVarAssign { site: Site },
    /// A naked return through a blank named result.
    BlankVarReturn,
    /// Flow through the nil branch of an explicit nil check.
    PositiveNilCheck,
    /// Flow through the non-nil branch of an explicit nil check.
    NegativeNilCheck,
    /// A value vouched for by a matched ok-form type check.
    OkReadReflCheck,
    /// An element yielded by ranging over a container.
    RangeOver { site: Site },
    TrustedFuncNilable,
    TrustedFuncNonnil,
    /// Affiliation, contravariant side: an interface parameter flows into
    /// an implementation's parameter.
    InterfaceParamReachesImplementation { site: Site },
    /// Affiliation, covariant side: an implementation's result flows out
    /// through the interface.
    MethodResultReachesInterface { site: Site },
    /// A guard-requiring producer whose consumer never passed through the
    /// matching check. Carries the original producer by value so the
    /// diagnostic keeps its description.
    GuardMissing { inner: Box<Producer> },
    /// Unconditionally nil.
    Tautology,
    /// Unconditionally non-nil.
    Never,
}

impl Producer {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Producer::FuncParam { .. }
            | Producer::FuncReturn { .. }
            | Producer::FieldRead { .. }
            | Producer::GlobalVarRead { .. }
            | Producer::VariadicFuncParam { .. }
            | Producer::MethodRecv { .. }
            | Producer::InterfaceParamReachesImplementation { .. }
            | Producer::MethodResultReachesInterface { .. } => TriggerKind::Conditional,

            Producer::FuncParamDeep { .. }
            | Producer::FuncReturnDeep { .. }
            | Producer::FieldReadDeep { .. }
            | Producer::GlobalVarReadDeep { .. }
            | Producer::LocalVarReadDeep { .. }
            | Producer::MapRead { .. }
            | Producer::ChanRecv { .. }
            | Producer::VariadicFuncParamDeep { .. }
            | Producer::MethodRecvDeep { .. }
            | Producer::RangeOver { .. } => TriggerKind::DeepConditional,

            Producer::ConstNil
            | Producer::UnassignedField { .. }
            | Producer::NoVarAssign { .. }
            | Producer::BlankVarReturn
            | Producer::PositiveNilCheck
            | Producer::TrustedFuncNilable
            | Producer::GuardMissing { .. }
            | Producer::Tautology => TriggerKind::Always,

            Producer::NegativeNilCheck
            | Producer::OkReadReflCheck
            | Producer::TrustedFuncNonnil
            | Producer::Never => TriggerKind::Never,
        }
    }

    /// The site whose annotation decides a conditional producer.
    pub fn site(&self) -> Option<&Site> {
        match self {
            Producer::FuncParam { site }
            | Producer::FuncParamDeep { site }
            | Producer::FuncReturn { site, .. }
            | Producer::FuncReturnDeep { site }
            | Producer::FieldRead { site }
            | Producer::FieldReadDeep { site }
            | Producer::GlobalVarRead { site }
            | Producer::GlobalVarReadDeep { site }
            | Producer::LocalVarReadDeep { site }
            | Producer::MapRead { site, .. }
            | Producer::ChanRecv { site, .. }
            | Producer::VariadicFuncParam { site }
            | Producer::VariadicFuncParamDeep { site }
            | Producer::MethodRecv { site }
            | Producer::MethodRecvDeep { site }
            | Producer::RangeOver { site }
            | Producer::UnassignedField { site }
            | Producer::NoVarAssign { site }
            | Producer::InterfaceParamReachesImplementation { site }
            | Producer::MethodResultReachesInterface { site } => Some(site),
            Producer::GuardMissing { inner } => inner.site(),
            _ => None,
        }
    }

    /// Whether the trigger only holds when the consumer carries the
    /// producer's guard nonce.
    pub fn needs_guard_match(&self) -> bool {
        match self {
            Producer::MapRead { needs_guard, .. } | Producer::ChanRecv { needs_guard, .. } => {
                *needs_guard
            }
            Producer::FuncReturn { guarded, .. } => *guarded,
            Producer::OkReadReflCheck => true,
            _ => false,
        }
    }

    /// Whether this producer can yield nil under the annotation map `m`.
    /// Only meaningful for Conditional/DeepConditional kinds; Always and
    /// Never answer from their kind alone.
    pub fn check_produce(&self, m: &ObservedMap) -> bool {
        match self.kind() {
            TriggerKind::Always => true,
            TriggerKind::Never => false,
            TriggerKind::Conditional => self
                .site()
                .is_some_and(|site| m.lookup(site).0.is_nilable),
            TriggerKind::DeepConditional => self
                .site()
                .is_some_and(|site| m.lookup(site).0.is_deep_nilable),
        }
    }

    /// A compact, serializable description used in diagnostics.
    pub fn prestring(&self) -> String {
        match self {
            Producer::FuncParam { site } | Producer::VariadicFuncParam { site } => {
                format!("read from {site}")
            }
            Producer::FuncParamDeep { site } | Producer::VariadicFuncParamDeep { site } => {
                format!("deep read from {site}")
            }
            Producer::FuncReturn { site, .. } => format!("returned from {site}"),
            Producer::FuncReturnDeep { site } => format!("deep value returned from {site}"),
            Producer::FieldRead { site } => format!("read from {site}"),
            Producer::FieldReadDeep { site } => format!("deep read from {site}"),
            Producer::GlobalVarRead { site } => format!("read from {site}"),
            Producer::GlobalVarReadDeep { site } => format!("deep read from {site}"),
            Producer::LocalVarReadDeep { site } => format!("deep read from {site}"),
            Producer::MapRead { site, .. } => format!("read from a key of {site}"),
            Producer::ChanRecv { site, .. } => format!("received from {site}"),
            Producer::MethodRecv { site } => format!("read from {site}"),
            Producer::MethodRecvDeep { site } => format!("deep read from {site}"),
            Producer::ConstNil => "literal nil".to_string(),
            Producer::UnassignedField { site } => {
                format!("{site} left unassigned at struct initialization")
            }
            Producer::NoVarAssign { site } => format!("{site} never assigned"),
            Producer::BlankVarReturn => "returned through a blank result".to_string(),
            Producer::PositiveNilCheck => "known nil from an explicit check".to_string(),
            Producer::NegativeNilCheck => "known non-nil from an explicit check".to_string(),
            Producer::OkReadReflCheck => "vouched for by a matched ok check".to_string(),
            Producer::RangeOver { site } => format!("element ranged over {site}"),
            Producer::TrustedFuncNilable => "result of a trusted nilable function".to_string(),
            Producer::TrustedFuncNonnil => "result of a trusted non-nil function".to_string(),
            Producer::InterfaceParamReachesImplementation { site } => {
                format!("passed through {site} of the interface")
            }
            Producer::MethodResultReachesInterface { site } => {
                format!("returned from the implementation's {site}")
            }
            Producer::GuardMissing { inner } => {
                format!("{}, without the required check", inner.prestring())
            }
            Producer::Tautology => "always nil".to_string(),
            Producer::Never => "never nil".to_string(),
        }
    }

    /// Structural deep copy; every nested payload gets fresh storage.
    pub fn deep_copy(&self) -> Producer {
        self.clone()
    }
}

/// A producer anchored at the source position where the value enters the
/// flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProduceTrigger {
    pub producer: Producer,
    pub pos: Pos,
}

impl ProduceTrigger {
    pub fn new(producer: Producer, pos: Pos) -> Self {
        Self { producer, pos }
    }

    pub fn deep_copy(&self) -> ProduceTrigger {
        ProduceTrigger {
            producer: self.producer.deep_copy(),
            pos: self.pos.clone(),
        }
    }
}

impl fmt::Display for ProduceTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.producer.prestring(), self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_annotations::Val;
    use nilgazer_hir::FuncId;

    fn param_site() -> Site {
        Site::Param {
            func: FuncId::new("pkg", "f"),
            index: 0,
        }
    }

    #[test]
    fn kinds_partition_the_variants() {
        assert_eq!(Producer::ConstNil.kind(), TriggerKind::Always);
        assert_eq!(Producer::Never.kind(), TriggerKind::Never);
        assert_eq!(
            Producer::FuncParam { site: param_site() }.kind(),
            TriggerKind::Conditional
        );
        assert_eq!(
            Producer::MapRead {
                site: param_site(),
                needs_guard: true
            }
            .kind(),
            TriggerKind::DeepConditional
        );
    }

    #[test]
    fn check_produce_consults_the_map() {
        let producer = Producer::FuncParam { site: param_site() };
        let mut map = ObservedMap::new();
        assert!(!producer.check_produce(&map));
        map.insert(param_site(), Val::nilable(true));
        assert!(producer.check_produce(&map));
    }

    #[test]
    fn guard_missing_is_always_and_keeps_site() {
        let inner = Producer::MapRead {
            site: param_site(),
            needs_guard: true,
        };
        let missing = Producer::GuardMissing {
            inner: Box::new(inner),
        };
        assert_eq!(missing.kind(), TriggerKind::Always);
        assert_eq!(missing.site(), Some(&param_site()));
        assert!(missing.prestring().contains("without the required check"));
    }

    #[test]
    fn deep_copy_is_structural() {
        let producer = Producer::GuardMissing {
            inner: Box::new(Producer::ChanRecv {
                site: param_site(),
                needs_guard: true,
            }),
        };
        let copy = producer.deep_copy();
        assert_eq!(producer, copy);
    }
}
