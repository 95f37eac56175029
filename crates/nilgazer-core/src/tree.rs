//! The assertion tree: the backward-propagation state at one program
//! point.
//!
//! The root is the current evaluation context; children are the tracked
//! expressions (variables, their depth-1 fields, globals), each holding
//! the ordered list of consumers pending on the value it denotes. The
//! flat map keyed by [`TrackedPath`] encodes the tree: `x.f` is a child
//! of `x` by key structure.

use crate::consumer::ConsumeTrigger;
use indexmap::IndexMap;
use nilgazer_hir::{Expr, FieldId, GlobalId, Symbol};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trackable expression: the paths backward propagation maintains
/// consumer lists for. Field chains deeper than one selector are not
/// tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackedPath {
    Var(Symbol),
    FieldOf { base: Symbol, field: FieldId },
    Global(GlobalId),
}

impl TrackedPath {
    /// Maps an expression onto its tracked path, if it has one.
    pub fn from_expr(expr: &Expr) -> Option<TrackedPath> {
        match expr {
            Expr::Var {
                global: Some(g), ..
            } => Some(TrackedPath::Global(g.clone())),
            Expr::Var { name, .. } => Some(TrackedPath::Var(name.clone())),
            Expr::Field {
                base, field, owner, ..
            } => match base.as_ref() {
                Expr::Var {
                    name, global: None, ..
                } => Some(TrackedPath::FieldOf {
                    base: name.clone(),
                    field: FieldId {
                        owner: owner.clone(),
                        name: field.clone(),
                    },
                }),
                _ => None,
            },
            _ => None,
        }
    }

    /// The variable this path hangs off, when function-local.
    pub fn base_var(&self) -> Option<&str> {
        match self {
            TrackedPath::Var(name) => Some(name),
            TrackedPath::FieldOf { base, .. } => Some(base),
            TrackedPath::Global(_) => None,
        }
    }
}

impl fmt::Display for TrackedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedPath::Var(name) => write!(f, "{name}"),
            TrackedPath::FieldOf { base, field } => write!(f, "{base}.{}", field.name),
            TrackedPath::Global(g) => write!(f, "{g}"),
        }
    }
}

/// The per-program-point state: tracked paths and their pending
/// consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssertionTree {
    nodes: IndexMap<TrackedPath, Vec<ConsumeTrigger>>,
}

impl AssertionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a consumer to the node for `path`, creating the node on
    /// first attachment (the Untracked -> Tracked transition). Exact
    /// duplicates are dropped.
    pub fn attach(&mut self, path: TrackedPath, trigger: ConsumeTrigger) {
        let list = self.nodes.entry(path).or_default();
        if !list.iter().any(|t| t.same_consumption(&trigger) && t.guards == trigger.guards) {
            list.push(trigger);
        }
    }

    /// Detaches and returns every consumer pending on `path`; the node
    /// becomes untracked.
    pub fn take(&mut self, path: &TrackedPath) -> Vec<ConsumeTrigger> {
        self.nodes.shift_remove(path).unwrap_or_default()
    }

    /// Detaches the depth-1 field children of variable `var`.
    pub fn take_children_of(&mut self, var: &str) -> Vec<(FieldId, Vec<ConsumeTrigger>)> {
        let keys: Vec<TrackedPath> = self
            .nodes
            .keys()
            .filter(|p| matches!(p, TrackedPath::FieldOf { base, .. } if base == var))
            .cloned()
            .collect();
        keys.into_iter()
            .map(|key| {
                let consumers = self.take(&key);
                let TrackedPath::FieldOf { field, .. } = key else {
                    unreachable!("filtered to field paths");
                };
                (field, consumers)
            })
            .collect()
    }

    /// Applies `f` to every consumer pending on `path`.
    pub fn mutate(&mut self, path: &TrackedPath, mut f: impl FnMut(&mut ConsumeTrigger)) {
        if let Some(list) = self.nodes.get_mut(path) {
            for trigger in list {
                f(trigger);
            }
        }
    }

    pub fn is_tracked(&self, path: &TrackedPath) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TrackedPath, &Vec<ConsumeTrigger>)> {
        self.nodes.iter()
    }

    /// Drains the whole state, in deterministic path order.
    pub fn drain_sorted(&mut self) -> Vec<(TrackedPath, Vec<ConsumeTrigger>)> {
        let mut entries: Vec<_> = std::mem::take(&mut self.nodes).into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// The join rule. Consumers present on both sides merge pairwise
    /// (guard intersection, guard-matched conjunction); consumers on one
    /// side only cross unchanged, as if the other branch did nothing for
    /// them.
    /// Commutative and idempotent under [`AssertionTree::state_eq`].
    pub fn merge(&self, other: &AssertionTree) -> AssertionTree {
        let mut out = AssertionTree::new();
        for (path, list) in &self.nodes {
            let merged = match other.nodes.get(path) {
                None => list.clone(),
                Some(other_list) => list
                    .iter()
                    .map(|t| match other_list.iter().find(|u| t.same_consumption_modulo_guarding(u)) {
                        Some(counterpart) => t.merge(counterpart),
                        None => t.deep_copy(),
                    })
                    .collect(),
            };
            for trigger in merged {
                out.attach(path.clone(), trigger);
            }
        }
        for (path, list) in &other.nodes {
            for trigger in list {
                let already = self
                    .nodes
                    .get(path)
                    .is_some_and(|mine| mine.iter().any(|t| t.same_consumption_modulo_guarding(trigger)));
                if !already {
                    out.attach(path.clone(), trigger.deep_copy());
                }
            }
        }
        out
    }

    /// State equality for the fixpoint test: same paths, and per path the
    /// same consumer set (consumption identity, guard-matched, and guard
    /// sets). Trails are diagnostic payload and excluded.
    pub fn state_eq(&self, other: &AssertionTree) -> bool {
        if self.nodes.len() != other.nodes.len() {
            return false;
        }
        self.nodes.iter().all(|(path, list)| {
            other.nodes.get(path).is_some_and(|other_list| {
                list.len() == other_list.len()
                    && list.iter().all(|t| {
                        other_list
                            .iter()
                            .any(|u| t.same_consumption(u) && t.guards == u.guards)
                    })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Consumer;
    use crate::guard::Nonce;
    use nilgazer_hir::Pos;

    fn ptr_load(desc: &str) -> ConsumeTrigger {
        ConsumeTrigger::new(Consumer::PtrLoad, desc, Pos::new("a.src", 1, 1))
    }

    #[test]
    fn attach_then_take_roundtrips() {
        let mut tree = AssertionTree::new();
        let path = TrackedPath::Var("x".into());
        tree.attach(path.clone(), ptr_load("`x`"));
        assert!(tree.is_tracked(&path));
        let taken = tree.take(&path);
        assert_eq!(taken.len(), 1);
        assert!(!tree.is_tracked(&path));
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let mut a = AssertionTree::new();
        let mut b = AssertionTree::new();
        let x = TrackedPath::Var("x".into());
        let y = TrackedPath::Var("y".into());
        let mut guarded = ptr_load("`x`");
        guarded.guards.insert(Nonce(1));
        a.attach(x.clone(), guarded);
        a.attach(y.clone(), ptr_load("`y`"));
        b.attach(x.clone(), ptr_load("`x`"));

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert!(ab.state_eq(&ba));
        assert!(a.merge(&a).state_eq(&a));

        // The guard held on only one path did not survive the join.
        let x_consumers = &ab.iter().find(|(p, _)| **p == x).unwrap().1;
        assert!(x_consumers[0].guards.is_empty());
    }

    #[test]
    fn one_sided_consumers_cross_joins_unchanged() {
        let mut a = AssertionTree::new();
        let b = AssertionTree::new();
        let mut guarded = ptr_load("`x`");
        guarded.guards.insert(Nonce(5));
        a.attach(TrackedPath::Var("x".into()), guarded);
        let merged = a.merge(&b);
        let consumers = &merged.iter().next().unwrap().1;
        assert_eq!(consumers[0].guards, std::collections::BTreeSet::from([Nonce(5)]));
    }

    #[test]
    fn field_children_detach_with_their_var() {
        let mut tree = AssertionTree::new();
        let field = FieldId {
            owner: nilgazer_hir::TypeId::new("pkg", "T"),
            name: "f".into(),
        };
        tree.attach(
            TrackedPath::FieldOf {
                base: "x".into(),
                field: field.clone(),
            },
            ptr_load("`x.f`"),
        );
        tree.attach(TrackedPath::Var("x".into()), ptr_load("`x`"));
        let children = tree.take_children_of("x");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, field);
        assert!(tree.is_tracked(&TrackedPath::Var("x".into())));
    }
}
