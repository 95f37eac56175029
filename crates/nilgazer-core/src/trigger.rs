//! Full triggers: one producer paired with one consumer, the unit the
//! inference solver evaluates.

use crate::consumer::ConsumeTrigger;
use crate::producer::{ProduceTrigger, Producer};
use nilgazer_annotations::Site;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The behavioral shape of one side of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    /// Fires unconditionally.
    Always,
    /// Never fires.
    Never,
    /// Fires depending on the shallow annotation of the underlying site.
    Conditional,
    /// Fires depending on the deep annotation of the underlying site.
    DeepConditional,
}

/// A producer paired with a consumer. `controller`, when present, names a
/// call-site parameter whose nilability gates the trigger; this is the
/// contract mechanism. `created_from_duplication` marks triggers produced by
/// contract duplication so reporting can fold them back onto their
/// declaration sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTrigger {
    pub producer: ProduceTrigger,
    pub consumer: ConsumeTrigger,
    pub controller: Option<Site>,
    pub created_from_duplication: bool,
}

impl FullTrigger {
    pub fn new(producer: ProduceTrigger, consumer: ConsumeTrigger) -> Self {
        Self {
            producer,
            consumer,
            controller: None,
            created_from_duplication: false,
        }
    }

    /// Trigger equality: producer annotation, consumer annotation,
    /// consumer expression identity, and the consumer's guard-matched
    /// status. Guard sets and trails are diagnostic payload, not
    /// identity.
    pub fn equals(&self, other: &FullTrigger) -> bool {
        self.producer.producer == other.producer.producer
            && self.consumer.same_consumption(&other.consumer)
            && self.controller == other.controller
    }

    /// As [`Self::equals`] but ignoring the guard-matched bit.
    pub fn equals_modulo_guarding(&self, other: &FullTrigger) -> bool {
        self.producer.producer == other.producer.producer
            && self
                .consumer
                .same_consumption_modulo_guarding(&other.consumer)
            && self.controller == other.controller
    }

    /// Join-point merge of two modulo-guarding-equal triggers: guard sets
    /// intersect and guard-matched conjoins on the consumer side.
    pub fn merge(&self, other: &FullTrigger) -> FullTrigger {
        debug_assert!(self.equals_modulo_guarding(other));
        FullTrigger {
            producer: self.producer.deep_copy(),
            consumer: self.consumer.merge(&other.consumer),
            controller: self.controller.clone(),
            created_from_duplication: self.created_from_duplication
                || other.created_from_duplication,
        }
    }

    pub fn deep_copy(&self) -> FullTrigger {
        FullTrigger {
            producer: self.producer.deep_copy(),
            consumer: self.consumer.deep_copy(),
            controller: self.controller.as_ref().map(Site::deep_copy),
            created_from_duplication: self.created_from_duplication,
        }
    }
}

impl fmt::Display for FullTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.producer, self.consumer)
    }
}

/// Set equality of two trigger slices under [`FullTrigger::equals`],
/// ignoring order. This is the fixpoint test of the backward pass.
pub fn full_trigger_slices_eq(a: &[FullTrigger], b: &[FullTrigger]) -> bool {
    a.len() == b.len()
        && a.iter().all(|t| b.iter().any(|u| t.equals(u)))
        && b.iter().all(|t| a.iter().any(|u| t.equals(u)))
}

/// Deduplicates a trigger list in place under [`FullTrigger::equals`],
/// keeping first occurrences; merges guard payload of duplicates so no
/// guard information is lost.
pub fn dedup_triggers(triggers: &mut Vec<FullTrigger>) {
    let mut kept: Vec<FullTrigger> = Vec::with_capacity(triggers.len());
    for trigger in triggers.drain(..) {
        if let Some(existing) = kept.iter_mut().find(|k| k.equals(&trigger)) {
            *existing = existing.merge(&trigger);
        } else {
            kept.push(trigger);
        }
    }
    *triggers = kept;
}

/// The guard-missing rewrite: every trigger whose producer demands a
/// matched guard but whose consumer never passed through the matching
/// check gets its producer replaced by [`Producer::GuardMissing`], which
/// always fires. Applied once, after the backward pass reaches fixpoint
/// and before solving.
pub fn apply_guard_missing_rewrite(triggers: &mut [FullTrigger]) {
    for trigger in triggers.iter_mut() {
        if trigger.producer.producer.needs_guard_match() && !trigger.consumer.guard_matched {
            let inner = trigger.producer.producer.deep_copy();
            trigger.producer.producer = Producer::GuardMissing {
                inner: Box::new(inner),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Consumer;
    use nilgazer_hir::{FuncId, Pos};

    fn sample(guard_matched: bool) -> FullTrigger {
        let site = Site::Param {
            func: FuncId::new("pkg", "f"),
            index: 0,
        };
        let mut consumer = ConsumeTrigger::new(Consumer::PtrLoad, "`x`", Pos::new("a.src", 3, 1));
        consumer.guard_matched = guard_matched;
        FullTrigger::new(
            ProduceTrigger::new(
                Producer::MapRead {
                    site,
                    needs_guard: true,
                },
                Pos::new("a.src", 2, 1),
            ),
            consumer,
        )
    }

    #[test]
    fn equality_is_reflexive_and_survives_deep_copy() {
        let trigger = sample(true);
        assert!(trigger.equals(&trigger));
        assert!(trigger.equals(&trigger.deep_copy()));
    }

    #[test]
    fn guard_bit_separates_plain_equality_only() {
        let a = sample(true);
        let b = sample(false);
        assert!(!a.equals(&b));
        assert!(a.equals_modulo_guarding(&b));
    }

    #[test]
    fn slices_eq_ignores_order() {
        let a = sample(true);
        let b = sample(false);
        assert!(full_trigger_slices_eq(
            &[a.deep_copy(), b.deep_copy()],
            &[b, a]
        ));
    }

    #[test]
    fn slices_eq_detects_difference() {
        let a = sample(true);
        let b = sample(false);
        assert!(!full_trigger_slices_eq(&[a.deep_copy()], &[b]));
        assert!(!full_trigger_slices_eq(&[a.deep_copy()], &[]));
        let _ = a;
    }

    #[test]
    fn dedup_merges_guard_payload() {
        let mut a = sample(true);
        a.consumer.guards.insert(crate::guard::Nonce(7));
        let mut b = sample(true);
        b.consumer.guards.insert(crate::guard::Nonce(9));
        let mut triggers = vec![a, b];
        dedup_triggers(&mut triggers);
        assert_eq!(triggers.len(), 1);
        assert!(triggers[0].consumer.guards.is_empty());
    }

    #[test]
    fn unmatched_guard_rewrites_to_guard_missing() {
        let mut triggers = vec![sample(false), sample(true)];
        apply_guard_missing_rewrite(&mut triggers);
        assert!(matches!(
            triggers[0].producer.producer,
            Producer::GuardMissing { .. }
        ));
        assert!(matches!(
            triggers[1].producer.producer,
            Producer::MapRead { .. }
        ));
        assert_eq!(triggers[0].producer.producer.kind(), TriggerKind::Always);
    }
}
