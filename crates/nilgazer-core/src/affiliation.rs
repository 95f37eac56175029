//! Affiliation: pairing interface methods with their implementations.
//!
//! Whenever a concrete type flows into an interface position (an
//! assignment, an argument, a return, a type assertion), every method of
//! the interface is paired with the implementing method and two families
//! of triggers are emitted:
//!
//! - parameters, contravariantly: the implementation may declare a
//!   parameter nilable only if the interface does;
//! - results, covariantly: the interface may promise a non-nil result
//!   only if the implementation delivers one.

use crate::consumer::{ConsumeTrigger, Consumer};
use crate::producer::{ProduceTrigger, Producer};
use crate::trigger::{dedup_triggers, FullTrigger};
use indexmap::IndexSet;
use nilgazer_annotations::Site;
use nilgazer_hir::{Callee, Expr, FuncDecl, FuncId, Package, Pos, Scope, Stmt, Type, TypeId};
use tracing::debug;

/// One observed affiliation: a concrete named type reaching a named
/// interface type, at a position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Affiliation {
    iface: TypeId,
    implementer: TypeId,
    pos: Pos,
}

/// Scans the package for affiliations and returns the cross-method
/// triggers they induce.
pub fn affiliations(pkg: &Package, scope: &Scope) -> Vec<FullTrigger> {
    let mut observed: IndexSet<Affiliation> = IndexSet::new();
    for func in pkg.functions() {
        if let Some(body) = &func.body {
            scan_stmts(body, func, scope, &mut observed);
        }
    }
    for group in pkg.global_groups() {
        for spec in &group.specs {
            for init in &spec.init {
                observe_flow(&spec.ty, init, scope, &spec.pos, &mut observed);
                scan_expr(init, None, scope, &mut observed);
            }
        }
    }

    let mut triggers = Vec::new();
    for aff in &observed {
        emit_pairs(aff, scope, &mut triggers);
    }
    dedup_triggers(&mut triggers);
    debug!(pkg = %pkg.path, pairs = observed.len(), triggers = triggers.len(), "affiliation scan");
    triggers
}

fn scan_stmts(
    stmts: &[Stmt],
    func: &FuncDecl,
    scope: &Scope,
    observed: &mut IndexSet<Affiliation>,
) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { lhs, rhs, pos, .. } => {
                for (l, r) in lhs.iter().zip(rhs.iter()) {
                    observe_flow(&l.ty(scope), r, scope, pos, observed);
                    scan_expr(r, Some(func), scope, observed);
                }
            }
            Stmt::VarDecl { ty, init, pos, .. } => {
                for e in init {
                    observe_flow(ty, e, scope, pos, observed);
                    scan_expr(e, Some(func), scope, observed);
                }
            }
            Stmt::Return { results, pos } => {
                for (i, e) in results.iter().enumerate() {
                    if let Some(result) = func.results.get(i) {
                        observe_flow(&result.ty, e, scope, pos, observed);
                    }
                    scan_expr(e, Some(func), scope, observed);
                }
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                scan_expr(cond, Some(func), scope, observed);
                scan_stmts(then_body, func, scope, observed);
                if let Some(els) = else_body {
                    scan_stmts(els, func, scope, observed);
                }
            }
            Stmt::For { cond, body, .. } => {
                if let Some(c) = cond {
                    scan_expr(c, Some(func), scope, observed);
                }
                scan_stmts(body, func, scope, observed);
            }
            Stmt::Range { over, body, .. } => {
                scan_expr(over, Some(func), scope, observed);
                scan_stmts(body, func, scope, observed);
            }
            Stmt::Send { chan, value, .. } => {
                scan_expr(chan, Some(func), scope, observed);
                scan_expr(value, Some(func), scope, observed);
            }
            Stmt::Expr(e) => scan_expr(e, Some(func), scope, observed),
            Stmt::Block(inner) => scan_stmts(inner, func, scope, observed),
        }
    }
}

fn scan_expr(
    expr: &Expr,
    func: Option<&FuncDecl>,
    scope: &Scope,
    observed: &mut IndexSet<Affiliation>,
) {
    match expr {
        Expr::Call(call) => {
            // Arguments flowing into interface-typed parameters.
            if let Some(sig) = call.callee_id().and_then(|id| scope.func(id)) {
                for (i, arg) in call.args.iter().enumerate() {
                    let param = if sig.variadic && !sig.params.is_empty() {
                        sig.params.get(i.min(sig.params.len() - 1))
                    } else {
                        sig.params.get(i)
                    };
                    if let Some(param) = param {
                        observe_flow(&param.ty, arg, scope, &call.pos, observed);
                    }
                    scan_expr(arg, func, scope, observed);
                }
            } else {
                for arg in &call.args {
                    scan_expr(arg, func, scope, observed);
                }
            }
            if let Callee::Method { recv, .. } = &call.callee {
                scan_expr(recv, func, scope, observed);
            }
        }
        Expr::TypeAssert { base, ty, .. } => {
            // `x.(Impl)` affiliates the asserted type with x's interface.
            observe_pair(&base.ty(scope), ty, scope, &expr.pos(), observed);
            scan_expr(base, func, scope, observed);
        }
        Expr::Field { base, .. } | Expr::Deref { base, .. } => {
            scan_expr(base, func, scope, observed);
        }
        Expr::Index { base, index, .. } => {
            scan_expr(base, func, scope, observed);
            scan_expr(index, func, scope, observed);
        }
        Expr::Recv { chan, .. } => scan_expr(chan, func, scope, observed),
        Expr::Unary { operand, .. } => scan_expr(operand, func, scope, observed),
        Expr::Binary { lhs, rhs, .. } => {
            scan_expr(lhs, func, scope, observed);
            scan_expr(rhs, func, scope, observed);
        }
        Expr::Composite { fields, .. } => {
            for (_, e) in fields {
                scan_expr(e, func, scope, observed);
            }
        }
        Expr::FuncLit { decl, .. } => {
            if let Some(body) = &decl.body {
                scan_stmts(body, decl, scope, observed);
            }
        }
        _ => {}
    }
}

/// Records an affiliation when `value` (of concrete named type) flows
/// into a position of named interface type `target`.
fn observe_flow(
    target: &Type,
    value: &Expr,
    scope: &Scope,
    pos: &Pos,
    observed: &mut IndexSet<Affiliation>,
) {
    observe_pair(target, &value.ty(scope), scope, pos, observed);
}

fn observe_pair(
    iface_ty: &Type,
    impl_ty: &Type,
    scope: &Scope,
    pos: &Pos,
    observed: &mut IndexSet<Affiliation>,
) {
    let Some(iface_id) = named_interface(iface_ty, scope) else {
        return;
    };
    let Some(impl_id) = impl_ty.named_id() else {
        return;
    };
    if matches!(scope.underlying(impl_id), Type::Interface(_)) {
        // Interface-to-interface conversions are handled transitively.
        return;
    }
    observed.insert(Affiliation {
        iface: iface_id.clone(),
        implementer: impl_id.clone(),
        pos: pos.clone(),
    });
}

fn named_interface<'a>(ty: &'a Type, scope: &Scope) -> Option<&'a TypeId> {
    match ty {
        Type::Named(id) => match scope.underlying(id) {
            Type::Interface(_) => Some(id),
            _ => None,
        },
        _ => None,
    }
}

/// Emits the parameter (contravariant) and result (covariant) trigger
/// pair for every method shared by the affiliation.
fn emit_pairs(aff: &Affiliation, scope: &Scope, out: &mut Vec<FullTrigger>) {
    let Type::Interface(methods) = scope.underlying(&aff.iface) else {
        return;
    };
    for method in methods.clone() {
        let iface_fid = FuncId::new(
            aff.iface.pkg.clone(),
            format!("{}.{}", aff.iface.name, method.name),
        );
        let Some(impl_fid) = scope.method(&aff.implementer, &method.name).cloned() else {
            continue;
        };
        let Some(impl_sig) = scope.func(&impl_fid) else {
            continue;
        };
        let iface_sig = method.sig();

        for i in 0..method.params.len().min(impl_sig.params.len()) {
            let producer = Producer::InterfaceParamReachesImplementation {
                site: Site::param(&iface_fid, &iface_sig, i),
            };
            let consumer = Consumer::MethodParamFromInterface {
                site: Site::param(&impl_fid, impl_sig, i),
            };
            let mut consume =
                ConsumeTrigger::new(consumer, format!("param {i} of `{impl_fid}`"), aff.pos.clone());
            consume.needs_guard = false;
            consume.guard_matched = true;
            out.push(FullTrigger::new(
                ProduceTrigger::new(producer, aff.pos.clone()),
                consume,
            ));
        }
        for i in 0..method.results.len().min(impl_sig.results.len()) {
            let producer = Producer::MethodResultReachesInterface {
                site: Site::result(&impl_fid, i),
            };
            let consumer = Consumer::InterfaceResultFromImplementation {
                site: Site::result(&iface_fid, i),
            };
            let mut consume = ConsumeTrigger::new(
                consumer,
                format!("result {i} of `{impl_fid}`"),
                aff.pos.clone(),
            );
            consume.needs_guard = false;
            consume.guard_matched = true;
            out.push(FullTrigger::new(
                ProduceTrigger::new(producer, aff.pos.clone()),
                consume,
            ));
        }
    }
}
