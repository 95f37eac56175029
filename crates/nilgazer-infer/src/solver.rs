//! The constraint solver: monotone label propagation with explanation
//! trails.
//!
//! Labels live on `(site, dimension)` nodes. Literal annotations seed
//! them; triggers with one `Always` side force the conditional side;
//! triggers conditional on both sides become implication edges closed
//! over by a worklist. A node forced both ways is a conflict, which is
//! the source-level diagnostic. Controllers gate contract-duplicated
//! triggers: such a trigger only enters the system once its controller
//! site is known nilable.

use crate::explanation::{ConstraintCause, ExplainedBool};
use indexmap::IndexMap;
use nilgazer_annotations::{ObservedMap, Site, Val};
use nilgazer_core::{Consumer, FullTrigger, Producer, TriggerKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// The two label dimensions of every site.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Dim {
    Shallow,
    Deep,
}

type Node = (Site, Dim);

/// Labels assigned by the solver, each with its explanation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferredMap {
    entries: IndexMap<Node, ExplainedBool>,
}

impl InferredMap {
    pub fn get(&self, site: &Site, dim: Dim) -> Option<&ExplainedBool> {
        self.entries.get(&(site.clone(), dim))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Node, &ExplainedBool)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds the inferred labels over `base` into the map exported to
    /// dependent packages: every label becomes an explicitly set value.
    pub fn export_over(&self, base: &ObservedMap) -> ObservedMap {
        let mut out = base.clone();
        for ((site, dim), expl) in &self.entries {
            let val = match dim {
                Dim::Shallow => Val::nilable(expl.value()),
                Dim::Deep => Val::deep_nilable(expl.value()),
            };
            out.insert(site.clone(), val);
        }
        out
    }
}

/// A site forced both nilable and non-nil: the solver's diagnostic unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub site: Site,
    pub dim: Dim,
    pub first: ExplainedBool,
    pub second: ExplainedBool,
}

/// A trigger unconditional on both sides: fires with no annotation
/// consultation (literal nil dereferences, guard-missing reads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectFailure {
    pub producer_desc: String,
    pub consumer_desc: String,
    pub producer_pos: nilgazer_hir::Pos,
    pub consumer_pos: nilgazer_hir::Pos,
    pub trail: Vec<nilgazer_core::Assignment>,
    pub category: String,
    pub guard_missing: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveResult {
    pub inferred: InferredMap,
    pub conflicts: Vec<Conflict>,
    pub failures: Vec<DirectFailure>,
}

/// Solves one package's triggers against the combined annotation map of
/// its import closure. Deterministic: seeds enter in site order and all
/// internal maps preserve insertion order.
pub fn solve(observed: &ObservedMap, triggers: &[FullTrigger]) -> SolveResult {
    let mut solver = Solver {
        observed,
        triggers,
        forced: IndexMap::new(),
        fwd_edges: IndexMap::new(),
        back_edges: IndexMap::new(),
        pending_controlled: IndexMap::new(),
        worklist: VecDeque::new(),
        conflicts: Vec::new(),
        failures: Vec::new(),
    };
    solver.run();
    let result = SolveResult {
        inferred: InferredMap {
            entries: solver.forced,
        },
        conflicts: solver.conflicts,
        failures: solver.failures,
    };
    debug!(
        labels = result.inferred.len(),
        conflicts = result.conflicts.len(),
        failures = result.failures.len(),
        "solve complete"
    );
    result
}

struct Solver<'a> {
    observed: &'a ObservedMap,
    triggers: &'a [FullTrigger],
    forced: IndexMap<Node, ExplainedBool>,
    /// producer node -> (trigger index, consumer node)
    fwd_edges: IndexMap<Node, Vec<(usize, Node)>>,
    /// consumer node -> (trigger index, producer node)
    back_edges: IndexMap<Node, Vec<(usize, Node)>>,
    /// controller site -> indices of triggers waiting on it
    pending_controlled: IndexMap<Site, Vec<usize>>,
    worklist: VecDeque<Node>,
    conflicts: Vec<Conflict>,
    failures: Vec<DirectFailure>,
}

impl Solver<'_> {
    fn run(&mut self) {
        // Seed literal annotations, in site order for determinism.
        for (site, val) in self.observed.sorted_entries() {
            if val.is_nilable_set {
                let expl = if val.is_nilable {
                    ExplainedBool::TrueBecauseAnnotation { site: site.clone() }
                } else {
                    ExplainedBool::FalseBecauseAnnotation { site: site.clone() }
                };
                self.force((site.clone(), Dim::Shallow), expl);
            }
            if val.is_deep_nilable_set {
                let expl = if val.is_deep_nilable {
                    ExplainedBool::TrueBecauseAnnotation { site: site.clone() }
                } else {
                    ExplainedBool::FalseBecauseAnnotation { site: site.clone() }
                };
                self.force((site.clone(), Dim::Deep), expl);
            }
        }

        // Enter every uncontrolled trigger; queue the controlled ones.
        let triggers = self.triggers;
        for (idx, trigger) in triggers.iter().enumerate() {
            match &trigger.controller {
                None => self.process_trigger(idx),
                Some(controller) => {
                    let live_now = self.observed.lookup(controller).0.is_nilable
                        || self
                            .forced
                            .get(&(controller.clone(), Dim::Shallow))
                            .is_some_and(ExplainedBool::value);
                    if live_now {
                        self.process_trigger(idx);
                    } else {
                        self.pending_controlled
                            .entry(controller.clone())
                            .or_default()
                            .push(idx);
                    }
                }
            }
        }

        self.drain();
        self.conflicts.dedup();
    }

    fn drain(&mut self) {
        while let Some(node) = self.worklist.pop_front() {
            let Some(expl) = self.forced.get(&node).cloned() else {
                continue;
            };
            if expl.value() {
                // Nilability propagates forward along implications.
                let targets = self.fwd_edges.get(&node).cloned().unwrap_or_default();
                for (idx, target) in targets {
                    let cause = self.cause_of(idx, Some(Box::new(expl.clone())));
                    let wrapped = explained(true, target.1, cause);
                    self.force(target, wrapped);
                }
                // A newly nilable site activates triggers it controls.
                if node.1 == Dim::Shallow {
                    if let Some(pending) = self.pending_controlled.shift_remove(&node.0) {
                        for idx in pending {
                            self.process_trigger(idx);
                        }
                    }
                }
            } else {
                // Non-nil requirements propagate backward.
                let sources = self.back_edges.get(&node).cloned().unwrap_or_default();
                for (idx, source) in sources {
                    let cause = self.cause_of(idx, Some(Box::new(expl.clone())));
                    let wrapped = explained(false, source.1, cause);
                    self.force(source, wrapped);
                }
            }
        }
    }

    fn process_trigger(&mut self, idx: usize) {
        let triggers = self.triggers;
        let trigger = &triggers[idx];
        let pk = trigger.producer.producer.kind();
        let consumer = &trigger.consumer.consumer;
        let never_fires = matches!(consumer, Consumer::DeepAssignPrimitive);
        let ck = consumer.kind();

        if pk == TriggerKind::Never || never_fires {
            return;
        }
        let producer_node = producer_node(&trigger.producer.producer);
        let consumer_node = consumer_node(consumer);

        match (pk, ck, producer_node, consumer_node) {
            (TriggerKind::Always, TriggerKind::Always, _, _) => {
                self.failures.push(DirectFailure {
                    producer_desc: trigger.producer.producer.prestring(),
                    consumer_desc: consumer.prestring(),
                    producer_pos: trigger.producer.pos.clone(),
                    consumer_pos: trigger.consumer.pos.clone(),
                    trail: trigger.consumer.trail.clone(),
                    category: consumer.category().to_string(),
                    guard_missing: matches!(
                        trigger.producer.producer,
                        Producer::GuardMissing { .. }
                    ),
                });
            }
            (TriggerKind::Always, _, _, Some(c_node)) => {
                let cause = self.cause_of(idx, None);
                let wrapped = explained(true, c_node.1, cause);
                self.force(c_node, wrapped);
            }
            (_, TriggerKind::Always, Some(p_node), _) => {
                let cause = self.cause_of(idx, None);
                let wrapped = explained(false, p_node.1, cause);
                self.force(p_node, wrapped);
            }
            (_, _, Some(p_node), Some(c_node)) => {
                // Contravariant affiliation: the implementation's
                // parameter drives the interface's, not the reverse.
                let (from, to) = if matches!(consumer, Consumer::MethodParamFromInterface { .. })
                {
                    (c_node, p_node)
                } else {
                    (p_node, c_node)
                };
                self.fwd_edges
                    .entry(from.clone())
                    .or_default()
                    .push((idx, to.clone()));
                self.back_edges
                    .entry(to.clone())
                    .or_default()
                    .push((idx, from.clone()));
                // Close over values already fixed.
                if let Some(expl) = self.forced.get(&from).cloned() {
                    if expl.value() {
                        let cause = self.cause_of(idx, Some(Box::new(expl)));
                        let wrapped = explained(true, to.1, cause);
                        self.force(to, wrapped);
                        return;
                    }
                }
                if let Some(expl) = self.forced.get(&to).cloned() {
                    if !expl.value() {
                        let cause = self.cause_of(idx, Some(Box::new(expl)));
                        let wrapped = explained(false, from.1, cause);
                        self.force(from, wrapped);
                    }
                }
            }
            // A conditional side without a usable site is dropped
            // (optimistic: out-of-scope library code).
            _ => {}
        }
    }

    fn force(&mut self, node: Node, expl: ExplainedBool) {
        match self.forced.get(&node) {
            None => {
                self.forced.insert(node.clone(), expl);
                self.worklist.push_back(node);
            }
            Some(existing) => {
                if existing.value() != expl.value() {
                    self.conflicts.push(Conflict {
                        site: node.0,
                        dim: node.1,
                        first: existing.clone(),
                        second: expl,
                    });
                }
                // Same value: keep the first explanation.
            }
        }
    }

    fn cause_of(&self, idx: usize, deeper: Option<Box<ExplainedBool>>) -> ConstraintCause {
        let trigger = &self.triggers[idx];
        ConstraintCause {
            producer_desc: trigger.producer.producer.prestring(),
            consumer_desc: trigger.consumer.consumer.prestring(),
            producer_pos: trigger.producer.pos.clone(),
            consumer_pos: trigger.consumer.pos.clone(),
            trail: trigger.consumer.trail.clone(),
            deeper,
        }
    }
}

fn explained(value: bool, dim: Dim, cause: ConstraintCause) -> ExplainedBool {
    match (value, dim) {
        (true, Dim::Shallow) => ExplainedBool::TrueBecauseShallowConstraint { cause },
        (false, Dim::Shallow) => ExplainedBool::FalseBecauseShallowConstraint { cause },
        (true, Dim::Deep) => ExplainedBool::TrueBecauseDeepConstraint { cause },
        (false, Dim::Deep) => ExplainedBool::FalseBecauseDeepConstraint { cause },
    }
}

fn producer_node(producer: &Producer) -> Option<Node> {
    let dim = match producer.kind() {
        TriggerKind::Conditional => Dim::Shallow,
        TriggerKind::DeepConditional => Dim::Deep,
        _ => return None,
    };
    producer.site().map(|site| (site.clone(), dim))
}

fn consumer_node(consumer: &Consumer) -> Option<Node> {
    let dim = match consumer.kind() {
        TriggerKind::Conditional => Dim::Shallow,
        TriggerKind::DeepConditional => Dim::Deep,
        _ => return None,
    };
    consumer.site().map(|site| (site.clone(), dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_core::{ConsumeTrigger, ProduceTrigger};
    use nilgazer_hir::{FuncId, Pos};
    use pretty_assertions::assert_eq;

    fn result_site(name: &str) -> Site {
        Site::Result {
            func: FuncId::new("pkg", name),
            index: 0,
        }
    }

    fn deref(expr: &str, line: u32) -> ConsumeTrigger {
        ConsumeTrigger::new(Consumer::PtrLoad, expr, Pos::new("a.src", line, 1))
    }

    /// `return nil` inside `retMaybe` plus `*retMaybe()` at a caller:
    /// the result site is forced both nilable and non-nil.
    #[test]
    fn nil_return_flowing_to_deref_conflicts() {
        let site = result_site("retMaybe");
        let ret_consumer = ConsumeTrigger::new(
            Consumer::UseAsReturn {
                site: site.clone(),
                ret_stmt: Pos::new("lib.src", 4, 2),
            },
            "nil",
            Pos::new("lib.src", 4, 2),
        );
        let t1 = FullTrigger::new(
            ProduceTrigger::new(Producer::ConstNil, Pos::new("lib.src", 4, 9)),
            ret_consumer,
        );
        let t2 = FullTrigger::new(
            ProduceTrigger::new(
                Producer::FuncReturn {
                    site: site.clone(),
                    guarded: false,
                },
                Pos::new("a.src", 10, 6),
            ),
            deref("`x`", 11),
        );
        let result = solve(&ObservedMap::new(), &[t1, t2]);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].site, site);
        assert_eq!(result.conflicts[0].dim, Dim::Shallow);
        assert!(result.failures.is_empty());
    }

    /// The same flow with the callee annotated nonnil on its result: the
    /// nil return conflicts with the annotation instead.
    #[test]
    fn annotation_seeds_participate() {
        let site = result_site("retMaybe");
        let mut observed = ObservedMap::new();
        observed.insert(site.clone(), Val::nilable(false));
        let ret_consumer = ConsumeTrigger::new(
            Consumer::UseAsReturn {
                site: site.clone(),
                ret_stmt: Pos::new("lib.src", 4, 2),
            },
            "nil",
            Pos::new("lib.src", 4, 2),
        );
        let t1 = FullTrigger::new(
            ProduceTrigger::new(Producer::ConstNil, Pos::new("lib.src", 4, 9)),
            ret_consumer,
        );
        let result = solve(&observed, &[t1]);
        assert_eq!(result.conflicts.len(), 1);
        assert!(matches!(
            result.conflicts[0].first,
            ExplainedBool::FalseBecauseAnnotation { .. }
        ));
    }

    #[test]
    fn always_always_is_a_direct_failure() {
        let trigger = FullTrigger::new(
            ProduceTrigger::new(Producer::ConstNil, Pos::new("a.src", 2, 5)),
            deref("`p`", 3),
        );
        let result = solve(&ObservedMap::new(), &[trigger]);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].category, "dereferenced");
        assert!(!result.failures[0].guard_missing);
    }

    #[test]
    fn transitive_propagation_chains_explanations() {
        // nil -> return of f; f's result -> param of g; param of g deref'd.
        let f_result = result_site("f");
        let g_param = Site::Param {
            func: FuncId::new("pkg", "g"),
            index: 0,
        };
        let t1 = FullTrigger::new(
            ProduceTrigger::new(Producer::ConstNil, Pos::new("a.src", 2, 1)),
            ConsumeTrigger::new(
                Consumer::UseAsReturn {
                    site: f_result.clone(),
                    ret_stmt: Pos::new("a.src", 2, 1),
                },
                "nil",
                Pos::new("a.src", 2, 1),
            ),
        );
        let t2 = FullTrigger::new(
            ProduceTrigger::new(
                Producer::FuncReturn {
                    site: f_result.clone(),
                    guarded: false,
                },
                Pos::new("a.src", 8, 1),
            ),
            ConsumeTrigger::new(
                Consumer::ArgPass {
                    site: g_param.clone(),
                },
                "`x`",
                Pos::new("a.src", 8, 3),
            ),
        );
        let result = solve(&ObservedMap::new(), &[t1, t2]);
        assert!(result.conflicts.is_empty());
        let label = result.inferred.get(&g_param, Dim::Shallow).unwrap();
        assert!(label.value());
        // The chain reaches back to the nil return.
        assert_eq!(label.chain().len(), 2);
    }

    #[test]
    fn controller_gates_contract_triggers() {
        let func = FuncId::new("pkg", "retMaybe");
        let loc = Pos::new("a.src", 12, 5);
        let cs_result = Site::CallSiteResult {
            func: func.clone(),
            index: 0,
            loc: loc.clone(),
        };
        let controller = Site::CallSiteParam {
            func: func.clone(),
            index: 0,
            loc: loc.clone(),
        };
        let mut controlled = FullTrigger::new(
            ProduceTrigger::new(
                Producer::FuncReturn {
                    site: cs_result.clone(),
                    guarded: false,
                },
                loc.clone(),
            ),
            deref("`x`", 13),
        );
        controlled.controller = Some(controller.clone());
        controlled.created_from_duplication = true;

        // Inactive controller: the trigger is ignored entirely.
        let result = solve(&ObservedMap::new(), std::slice::from_ref(&controlled));
        assert!(result.inferred.get(&cs_result, Dim::Shallow).is_none());

        // A nilable argument at that call activates it.
        let feeder = FullTrigger::new(
            ProduceTrigger::new(Producer::ConstNil, Pos::new("a.src", 12, 14)),
            ConsumeTrigger::new(
                Consumer::ArgPass {
                    site: controller.clone(),
                },
                "nil",
                loc.clone(),
            ),
        );
        let result = solve(&ObservedMap::new(), &[feeder, controlled]);
        // The deref forces the call-site result nonnil; no conflict since
        // nothing forces it nilable, but the label is now present.
        let label = result.inferred.get(&cs_result, Dim::Shallow).unwrap();
        assert!(!label.value());
    }

    #[test]
    fn determinism_across_runs() {
        let site = result_site("retMaybe");
        let t1 = FullTrigger::new(
            ProduceTrigger::new(Producer::ConstNil, Pos::new("lib.src", 4, 9)),
            ConsumeTrigger::new(
                Consumer::UseAsReturn {
                    site: site.clone(),
                    ret_stmt: Pos::new("lib.src", 4, 2),
                },
                "nil",
                Pos::new("lib.src", 4, 2),
            ),
        );
        let t2 = FullTrigger::new(
            ProduceTrigger::new(
                Producer::FuncReturn {
                    site,
                    guarded: false,
                },
                Pos::new("a.src", 10, 6),
            ),
            deref("`x`", 11),
        );
        let triggers = vec![t1, t2];
        let a = solve(&ObservedMap::new(), &triggers);
        let b = solve(&ObservedMap::new(), &triggers);
        assert_eq!(a, b);
    }
}
