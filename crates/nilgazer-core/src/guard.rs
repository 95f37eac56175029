//! Guard nonces and rich-check recognition.
//!
//! Every recognized check (a nil comparison, a map-read/channel-receive/
//! type-assertion ok-form, an error- or ok-returning call) gets a fresh
//! [`Nonce`] bound to the expressions it refines. Consumers accumulate
//! nonces while propagating backward across the refining branch; a
//! producer that demands a guard is matched exactly when the consumer
//! holds its nonce at emission.

use crate::tree::TrackedPath;
use nilgazer_hir::{BinaryOp, Expr, FuncSig, Pos, Scope, Stmt, Symbol, UnaryOp};
use serde::{Deserialize, Serialize};

/// A unique token identifying one rich check.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Nonce(pub u64);

/// Per-function nonce source.
#[derive(Debug, Default)]
pub struct NonceGenerator {
    next: u64,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> Nonce {
        let nonce = Nonce(self.next);
        self.next += 1;
        nonce
    }
}

/// The recognized ok-form shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OkFormKind {
    MapRead,
    ChanRecv,
    TypeAssert,
    /// `..., err := f(...)` where `f`'s last result is its only error.
    ErrorCall,
    /// `..., ok := f(...)` where `f`'s last result is its only bool.
    OkCall,
}

impl OkFormKind {
    /// Whether a refinement on the condition variable in the given
    /// direction activates the guard: ok-style guards fire on the true
    /// branch, error-style on the `err == nil` branch.
    pub fn guard_applies(self, positive: bool) -> bool {
        match self {
            OkFormKind::ErrorCall => !positive,
            _ => positive,
        }
    }
}

/// One ok-form statement: the condition variable, the value paths it
/// vouches for, and the nonce bound to the check.
#[derive(Debug, Clone, PartialEq)]
pub struct OkForm {
    pub cond_var: Symbol,
    pub targets: Vec<TrackedPath>,
    pub kind: OkFormKind,
    pub nonce: Nonce,
    /// Position of the ok-form statement; ties the form to its producer
    /// emission site.
    pub pos: Pos,
}

/// Every ok-form in one function, collected in a pre-pass so branch
/// refinements on the condition variable can find their form during the
/// backward walk.
#[derive(Debug, Default)]
pub struct GuardTable {
    forms: Vec<OkForm>,
}

impl GuardTable {
    pub fn collect(body: &[Stmt], scope: &Scope, nonces: &mut NonceGenerator) -> GuardTable {
        let mut table = GuardTable::default();
        collect_stmts(body, scope, nonces, &mut table);
        table
    }

    pub fn forms_for_cond<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a OkForm> + 'a {
        let name = name.to_string();
        self.forms.iter().filter(move |f| f.cond_var == name)
    }

    /// The form introduced by the ok-form statement at `pos`, if any.
    pub fn form_at(&self, pos: &Pos) -> Option<&OkForm> {
        self.forms.iter().find(|f| f.pos == *pos)
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }
}

fn collect_stmts(
    stmts: &[Stmt],
    scope: &Scope,
    nonces: &mut NonceGenerator,
    table: &mut GuardTable,
) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { lhs, rhs, pos, .. } => {
                collect_assign(lhs, rhs, pos, scope, nonces, table);
            }
            Stmt::VarDecl {
                names, init, pos, ..
            } => {
                // `var v, ok = m[k]` behaves like the define form.
                let lhs: Vec<Expr> = names
                    .iter()
                    .map(|n| Expr::Var {
                        name: n.clone(),
                        global: None,
                        ty: nilgazer_hir::Type::Unknown,
                        pos: pos.clone(),
                    })
                    .collect();
                collect_assign(&lhs, init, pos, scope, nonces, table);
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_stmts(then_body, scope, nonces, table);
                if let Some(els) = else_body {
                    collect_stmts(els, scope, nonces, table);
                }
            }
            Stmt::For { body, .. } | Stmt::Range { body, .. } => {
                collect_stmts(body, scope, nonces, table);
            }
            Stmt::Block(inner) => collect_stmts(inner, scope, nonces, table),
            _ => {}
        }
    }
}

fn collect_assign(
    lhs: &[Expr],
    rhs: &[Expr],
    pos: &Pos,
    scope: &Scope,
    nonces: &mut NonceGenerator,
    table: &mut GuardTable,
) {
    if rhs.len() != 1 {
        return;
    }
    match &rhs[0] {
        Expr::Index { base, .. } if lhs.len() == 2 && base.ty(scope).is_map(scope) => {
            push_pair_form(lhs, OkFormKind::MapRead, pos, nonces, table);
        }
        Expr::Recv { .. } if lhs.len() == 2 => {
            push_pair_form(lhs, OkFormKind::ChanRecv, pos, nonces, table);
        }
        Expr::TypeAssert { .. } if lhs.len() == 2 => {
            push_pair_form(lhs, OkFormKind::TypeAssert, pos, nonces, table);
        }
        Expr::Call(call) => {
            let Some(id) = call.callee_id() else { return };
            let Some(sig) = scope.func(id) else { return };
            if lhs.len() != sig.results.len() || lhs.len() < 2 {
                return;
            }
            let kind = if sig.is_error_returning(scope) {
                OkFormKind::ErrorCall
            } else if sig.is_ok_returning(scope) {
                OkFormKind::OkCall
            } else {
                return;
            };
            push_call_form(lhs, sig, kind, pos, nonces, table);
        }
        _ => {}
    }
}

fn push_pair_form(
    lhs: &[Expr],
    kind: OkFormKind,
    pos: &Pos,
    nonces: &mut NonceGenerator,
    table: &mut GuardTable,
) {
    let Some(cond_var) = var_name(&lhs[1]) else {
        return;
    };
    let targets = TrackedPath::from_expr(&lhs[0]).into_iter().collect();
    table.forms.push(OkForm {
        cond_var,
        targets,
        kind,
        nonce: nonces.fresh(),
        pos: pos.clone(),
    });
}

fn push_call_form(
    lhs: &[Expr],
    _sig: &FuncSig,
    kind: OkFormKind,
    pos: &Pos,
    nonces: &mut NonceGenerator,
    table: &mut GuardTable,
) {
    let Some(cond_var) = var_name(&lhs[lhs.len() - 1]) else {
        return;
    };
    let targets = lhs[..lhs.len() - 1]
        .iter()
        .filter_map(TrackedPath::from_expr)
        .collect();
    table.forms.push(OkForm {
        cond_var,
        targets,
        kind,
        nonce: nonces.fresh(),
        pos: pos.clone(),
    });
}

fn var_name(expr: &Expr) -> Option<Symbol> {
    match expr {
        Expr::Var {
            name, global: None, ..
        } => Some(name.clone()),
        _ => None,
    }
}

/// A branch-local fact: `path` is known non-nil (or, for condition
/// variables, true) when `positive`, nil/false otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refinement {
    pub path: TrackedPath,
    pub positive: bool,
}

/// Extracts the refinements a condition establishes on the given branch.
/// Handles nil comparisons and their `!`/`&&`/`||` combinations, plus
/// bare condition variables (ok-form tests). Conjunctions refine only
/// their true branch, disjunctions only their false branch.
pub fn refinements(cond: &Expr, branch: bool, out: &mut Vec<Refinement>) {
    match cond {
        Expr::Unary {
            op: UnaryOp::Not,
            operand,
            ..
        } => refinements(operand, !branch, out),
        Expr::Binary { op, lhs, rhs, .. } => match op {
            BinaryOp::Eq | BinaryOp::Neq => {
                let (nil_side, value_side) = match (lhs.as_ref(), rhs.as_ref()) {
                    (Expr::Nil { .. }, value) => (true, value),
                    (value, Expr::Nil { .. }) => (true, value),
                    _ => (false, lhs.as_ref()),
                };
                if !nil_side {
                    return;
                }
                if let Some(path) = TrackedPath::from_expr(value_side) {
                    let positive = match op {
                        BinaryOp::Neq => branch,
                        _ => !branch,
                    };
                    out.push(Refinement { path, positive });
                }
            }
            BinaryOp::And => {
                if branch {
                    refinements(lhs, true, out);
                    refinements(rhs, true, out);
                }
            }
            BinaryOp::Or => {
                if !branch {
                    refinements(lhs, false, out);
                    refinements(rhs, false, out);
                }
            }
        },
        Expr::Var { .. } => {
            if let Some(path) = TrackedPath::from_expr(cond) {
                out.push(Refinement {
                    path,
                    positive: branch,
                });
            }
        }
        // Literal conditions refine nothing.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_hir::Type;

    fn var(name: &str) -> Expr {
        Expr::Var {
            name: name.into(),
            global: None,
            ty: Type::Pointer(Box::new(Type::Int)),
            pos: Pos::default(),
        }
    }

    fn neq_nil(name: &str) -> Expr {
        Expr::Binary {
            op: BinaryOp::Neq,
            lhs: Box::new(var(name)),
            rhs: Box::new(Expr::Nil { pos: Pos::default() }),
            pos: Pos::default(),
        }
    }

    #[test]
    fn neq_nil_refines_true_branch_positive() {
        let mut out = Vec::new();
        refinements(&neq_nil("x"), true, &mut out);
        assert_eq!(
            out,
            vec![Refinement {
                path: TrackedPath::Var("x".into()),
                positive: true
            }]
        );
    }

    #[test]
    fn negation_flips_the_branch() {
        let cond = Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(neq_nil("x")),
            pos: Pos::default(),
        };
        let mut out = Vec::new();
        refinements(&cond, true, &mut out);
        assert_eq!(out[0].positive, false);
    }

    #[test]
    fn conjunction_refines_both_on_true_only() {
        let cond = Expr::Binary {
            op: BinaryOp::And,
            lhs: Box::new(neq_nil("x")),
            rhs: Box::new(neq_nil("y")),
            pos: Pos::default(),
        };
        let mut on_true = Vec::new();
        refinements(&cond, true, &mut on_true);
        assert_eq!(on_true.len(), 2);
        let mut on_false = Vec::new();
        refinements(&cond, false, &mut on_false);
        assert!(on_false.is_empty());
    }

    #[test]
    fn disjunction_refines_both_on_false_only() {
        // `x == nil || y == nil`: the false branch knows both non-nil.
        let eq_nil = |name: &str| Expr::Binary {
            op: BinaryOp::Eq,
            lhs: Box::new(var(name)),
            rhs: Box::new(Expr::Nil { pos: Pos::default() }),
            pos: Pos::default(),
        };
        let cond = Expr::Binary {
            op: BinaryOp::Or,
            lhs: Box::new(eq_nil("x")),
            rhs: Box::new(eq_nil("y")),
            pos: Pos::default(),
        };
        let mut on_false = Vec::new();
        refinements(&cond, false, &mut on_false);
        assert_eq!(on_false.len(), 2);
        assert!(on_false.iter().all(|r| r.positive));
    }

    #[test]
    fn error_call_guard_applies_on_err_nil_branch() {
        assert!(OkFormKind::ErrorCall.guard_applies(false));
        assert!(!OkFormKind::ErrorCall.guard_applies(true));
        assert!(OkFormKind::MapRead.guard_applies(true));
    }
}
