//! Struct-initialization checking (experimental).
//!
//! Tracks struct literals whose nil-admitting fields are left
//! uninitialized at an escape point: returned, passed as an argument, or
//! assigned into longer-lived storage. Each such field yields an
//! `UnassignedField` producer paired with the escape-shaped consumer;
//! the solver fires the pair when the field's site is fixed non-nil.

use crate::consumer::{ConsumeTrigger, Consumer};
use crate::producer::{ProduceTrigger, Producer};
use crate::trigger::{dedup_triggers, FullTrigger};
use nilgazer_annotations::Site;
use nilgazer_hir::{Expr, FieldId, FuncDecl, Package, Pos, Scope, Stmt, Type};
use tracing::debug;

/// Scans `pkg` for escaping struct literals with unassigned nil-admitting
/// fields.
pub fn struct_init_triggers(pkg: &Package, scope: &Scope) -> Vec<FullTrigger> {
    let mut triggers = Vec::new();
    for func in pkg.functions() {
        if let Some(body) = &func.body {
            scan_stmts(body, func, scope, &mut triggers);
        }
    }
    dedup_triggers(&mut triggers);
    debug!(pkg = %pkg.path, triggers = triggers.len(), "struct-init scan");
    triggers
}

fn scan_stmts(stmts: &[Stmt], func: &FuncDecl, scope: &Scope, out: &mut Vec<FullTrigger>) {
    for stmt in stmts {
        match stmt {
            Stmt::Return { results, pos } => {
                for (i, e) in results.iter().enumerate() {
                    if let Some(lit) = composite(e) {
                        emit_for_literal(
                            lit,
                            EscapeShape::Result {
                                func,
                                index: i,
                            },
                            pos,
                            scope,
                            out,
                        );
                    }
                }
            }
            Stmt::Assign { lhs, rhs, pos, .. } => {
                for (l, r) in lhs.iter().zip(rhs.iter()) {
                    if let Some(lit) = composite(r) {
                        // Assignment into a field or global outlives the
                        // constructing function.
                        let escapes = matches!(
                            l,
                            Expr::Field { .. } | Expr::Var { global: Some(_), .. }
                        );
                        if escapes {
                            emit_for_literal(lit, EscapeShape::Stored, pos, scope, out);
                        }
                    }
                }
                scan_call_args(rhs, scope, out);
            }
            Stmt::Expr(e) => scan_call_args(std::slice::from_ref(e), scope, out),
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                scan_stmts(then_body, func, scope, out);
                if let Some(els) = else_body {
                    scan_stmts(els, func, scope, out);
                }
            }
            Stmt::For { body, .. } | Stmt::Range { body, .. } => {
                scan_stmts(body, func, scope, out);
            }
            Stmt::Block(inner) => scan_stmts(inner, func, scope, out),
            _ => {}
        }
    }
}

fn scan_call_args(exprs: &[Expr], scope: &Scope, out: &mut Vec<FullTrigger>) {
    for expr in exprs {
        let Expr::Call(call) = expr else { continue };
        let Some(id) = call.callee_id() else { continue };
        let Some(sig) = scope.func(id).cloned() else {
            continue;
        };
        for (i, arg) in call.args.iter().enumerate() {
            if let Some(lit) = composite(arg) {
                if i < sig.params.len() || sig.variadic {
                    emit_for_literal(
                        lit,
                        EscapeShape::Arg {
                            func: id.clone(),
                            sig: &sig,
                            index: i,
                        },
                        &call.pos,
                        scope,
                        out,
                    );
                }
            }
        }
    }
}

/// Looks through one level of address-of-style wrapping to the literal.
fn composite(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::Composite { .. } => Some(expr),
        _ => None,
    }
}

enum EscapeShape<'a> {
    Result { func: &'a FuncDecl, index: usize },
    Arg {
        func: nilgazer_hir::FuncId,
        sig: &'a nilgazer_hir::FuncSig,
        index: usize,
    },
    Stored,
}

fn emit_for_literal(
    lit: &Expr,
    shape: EscapeShape<'_>,
    pos: &Pos,
    scope: &Scope,
    out: &mut Vec<FullTrigger>,
) {
    let Expr::Composite { ty, fields, .. } = lit else {
        return;
    };
    let Some(owner) = ty.named_id() else { return };
    let Some(declared) = ty.struct_fields(scope) else {
        return;
    };
    for field_def in declared {
        if !field_def.ty.admits_nil(scope) {
            continue;
        }
        let initialized = fields.iter().any(|(name, _)| *name == field_def.name);
        if initialized {
            continue;
        }
        let field = FieldId {
            owner: owner.clone(),
            name: field_def.name.clone(),
        };
        let producer = Producer::UnassignedField {
            site: Site::Field(field.clone()),
        };
        let consumer = match &shape {
            EscapeShape::Result { func, index } => Consumer::UseAsFieldOfReturn {
                site: Site::ResultField {
                    func: func.id.clone(),
                    index: *index,
                    field: field.clone(),
                },
            },
            EscapeShape::Arg { func, sig, index } => Consumer::ArgFieldPass {
                site: Site::ParamField {
                    func: func.clone(),
                    index: sig.fold_param_index(*index),
                    field: field.clone(),
                },
            },
            EscapeShape::Stored => Consumer::FieldEscape {
                site: Site::EscapeField(field.clone()),
            },
        };
        let mut consume = ConsumeTrigger::new(
            consumer,
            format!("field `{}`", field_def.name),
            pos.clone(),
        );
        consume.needs_guard = false;
        consume.guard_matched = true;
        out.push(FullTrigger::new(
            ProduceTrigger::new(producer, pos.clone()),
            consume,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_hir::{
        Decl, FieldDef, FuncId, Param, SourceFile, TypeDecl, TypeId,
    };
    use smallvec::smallvec;

    /// `type Box struct { ptr *int; n int }` and
    /// `func fresh() Box { return Box{n: 1} }`
    fn package() -> Package {
        let box_ty = TypeDecl {
            id: TypeId::new("pkg", "Box"),
            doc: vec![],
            ty: Type::Struct(vec![
                FieldDef {
                    name: "ptr".into(),
                    ty: Type::Pointer(Box::new(Type::Int)),
                    pos: Pos::default(),
                },
                FieldDef {
                    name: "n".into(),
                    ty: Type::Int,
                    pos: Pos::default(),
                },
            ]),
            pos: Pos::default(),
        };
        let fresh = FuncDecl {
            id: FuncId::new("pkg", "fresh"),
            doc: vec![],
            receiver: None,
            params: smallvec![],
            variadic: false,
            results: smallvec![Param::unnamed(
                Type::Named(TypeId::new("pkg", "Box")),
                Pos::default()
            )],
            body: Some(vec![Stmt::Return {
                results: vec![Expr::Composite {
                    ty: Type::Named(TypeId::new("pkg", "Box")),
                    fields: vec![(
                        "n".into(),
                        Expr::Int {
                            value: 1,
                            pos: Pos::default(),
                        },
                    )],
                    pos: Pos::new("pkg.src", 5, 9),
                }],
                pos: Pos::new("pkg.src", 5, 2),
            }]),
            pos: Pos::default(),
        };
        Package {
            path: "pkg".into(),
            files: vec![SourceFile {
                name: "pkg.src".into(),
                doc: vec![],
                decls: vec![Decl::Type(box_ty), Decl::Func(fresh)],
            }],
        }
    }

    #[test]
    fn unassigned_nilable_field_escaping_via_return() {
        let pkg = package();
        let mut scope = Scope::new();
        scope.add_package(&pkg);
        let triggers = struct_init_triggers(&pkg, &scope);
        assert_eq!(triggers.len(), 1);
        assert!(matches!(
            triggers[0].producer.producer,
            Producer::UnassignedField { .. }
        ));
        assert!(matches!(
            triggers[0].consumer.consumer,
            Consumer::UseAsFieldOfReturn {
                site: Site::ResultField { .. },
                ..
            }
        ));
    }

    #[test]
    fn initialized_and_primitive_fields_are_silent() {
        let mut pkg = package();
        // Initialize `ptr` as well: nothing left to flag.
        if let Decl::Func(f) = &mut pkg.files[0].decls[1] {
            if let Some(Stmt::Return { results, .. }) = f.body.as_mut().map(|b| &mut b[0]) {
                if let Expr::Composite { fields, .. } = &mut results[0] {
                    fields.push((
                        "ptr".into(),
                        Expr::Nil { pos: Pos::default() },
                    ));
                }
            }
        }
        let mut scope = Scope::new();
        scope.add_package(&pkg);
        assert!(struct_init_triggers(&pkg, &scope).is_empty());
    }
}
