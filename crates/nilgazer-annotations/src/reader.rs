//! The annotation reader: declarations and doc-comments in, an
//! [`ObservedMap`] out.
//!
//! Recognized comment forms, attached to a function, type, value, or
//! field-group declaration:
//!
//! ```text
//! // nilable(<tokens>)   // nonnil(<tokens>)
//! token := ident | "param" N | "result" N | "*" inner | inner "[]" | "<-" inner
//! ```
//!
//! Deep forms (`*x`, `x[]`, `<-x`) target the deep annotation of the
//! resolved site. A call expression may carry the same syntax in its
//! same-line comment; that form fills the call-site submaps.

use crate::contract::{parse_contracts, Contract};
use crate::{AnnotationError, ObservedMap, Site, Val};
use indexmap::IndexMap;
use nilgazer_hir::{
    Callee, CallExpr, Decl, Expr, FieldId, FuncDecl, FuncId, GlobalGroup, GlobalId, Package,
    Scope, Stmt, Type, TypeDecl,
};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// The outcome of reading one package. `errors` collects malformed
/// annotations without aborting the read; the map is complete for every
/// well-formed annotation.
#[derive(Debug, Clone, Default)]
pub struct ReaderResult {
    pub map: ObservedMap,
    pub contracts: IndexMap<FuncId, Vec<Contract>>,
    pub errors: Vec<AnnotationError>,
}

fn annot_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(nilable|nonnil)\(([^)]*)\)\s*$").expect("static regex")
    })
}

/// One parsed annotation token.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Inner {
    Ident(String),
    Param(usize),
    Result(usize),
}

fn parse_inner(token: &str) -> Result<Inner, AnnotationError> {
    let token = token.trim();
    if let Some(rest) = token.strip_prefix("param ") {
        let n = rest.trim().parse::<usize>().map_err(|_| {
            AnnotationError::InvalidSyntax(format!("bad positional token `{token}`"))
        })?;
        return Ok(Inner::Param(n));
    }
    if let Some(rest) = token.strip_prefix("result ") {
        let n = rest.trim().parse::<usize>().map_err(|_| {
            AnnotationError::InvalidSyntax(format!("bad positional token `{token}`"))
        })?;
        return Ok(Inner::Result(n));
    }
    if token.is_empty() || !token.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(AnnotationError::InvalidSyntax(format!(
            "bad annotation token `{token}`"
        )));
    }
    Ok(Inner::Ident(token.to_string()))
}

/// Parses one token into its inner form and whether it targets the deep
/// position.
fn parse_token(token: &str) -> Result<(Inner, bool), AnnotationError> {
    let token = token.trim();
    if let Some(rest) = token.strip_prefix('*') {
        return Ok((parse_inner(rest)?, true));
    }
    if let Some(rest) = token.strip_prefix("<-") {
        return Ok((parse_inner(rest)?, true));
    }
    if let Some(rest) = token.strip_suffix("[]") {
        return Ok((parse_inner(rest)?, true));
    }
    Ok((parse_inner(token)?, false))
}

/// One annotation line split into polarity and tokens.
struct AnnotLine {
    nilable: bool,
    tokens: Vec<(Inner, bool)>,
}

fn parse_annot_lines(doc: &[String], errors: &mut Vec<AnnotationError>) -> Vec<AnnotLine> {
    let mut lines = Vec::new();
    for line in doc {
        let Some(captures) = annot_line_re().captures(line) else {
            continue;
        };
        let nilable = &captures[1] == "nilable";
        let mut tokens = Vec::new();
        let mut bad = false;
        for raw in captures[2].split(',') {
            if raw.trim().is_empty() {
                continue;
            }
            match parse_token(raw) {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    errors.push(e);
                    bad = true;
                }
            }
        }
        if !bad {
            lines.push(AnnotLine { nilable, tokens });
        }
    }
    lines
}

/// Reads a package's annotations and contracts into a fresh map, applying
/// type defaults where no literal annotation fixed a site. Files whose
/// doc-comment contains any of `exclude_file_docstrings` are skipped
/// entirely.
pub fn read_package(
    pkg: &Package,
    scope: &Scope,
    exclude_file_docstrings: &[String],
) -> ReaderResult {
    let mut out = ReaderResult::default();
    for file in &pkg.files {
        let excluded = exclude_file_docstrings
            .iter()
            .any(|needle| file.doc.iter().any(|line| line.contains(needle)));
        if excluded {
            debug!(file = %file.name, "skipping file via docstring exclusion");
            continue;
        }
        for decl in &file.decls {
            match decl {
                Decl::Func(func) => read_func(func, scope, &mut out),
                Decl::Type(ty) => read_type(ty, scope, &mut out),
                Decl::Globals(group) => read_globals(pkg, group, scope, &mut out),
            }
        }
    }
    debug!(
        pkg = %pkg.path,
        sites = out.map.len(),
        errors = out.errors.len(),
        "annotation read complete"
    );
    out
}

fn read_func(func: &FuncDecl, scope: &Scope, out: &mut ReaderResult) {
    for line in parse_annot_lines(&func.doc, &mut out.errors) {
        for (inner, deep) in &line.tokens {
            match resolve_on_func(func, inner) {
                Ok(site) => insert_bit(&mut out.map, site, line.nilable, *deep),
                Err(e) => out.errors.push(e),
            }
        }
    }
    match parse_contracts(&func.doc) {
        Ok(contracts) if !contracts.is_empty() => {
            out.contracts.insert(func.id.clone(), contracts);
        }
        Ok(_) => {}
        Err(e) => out.errors.push(e),
    }

    // Type defaults for every declared position; set bits dominate.
    if let Some(recv) = &func.receiver {
        out.map.apply_default(
            Site::Receiver {
                func: func.id.clone(),
            },
            Val::from_type(&recv.ty, scope),
        );
    }
    for (i, param) in func.params.iter().enumerate() {
        // The variadic parameter's site stands for its element.
        let ty = if func.variadic && i == func.params.len() - 1 {
            param
                .ty
                .deep_target(scope)
                .cloned()
                .unwrap_or_else(|| param.ty.clone())
        } else {
            param.ty.clone()
        };
        out.map.apply_default(
            Site::Param {
                func: func.id.clone(),
                index: i,
            },
            Val::from_type(&ty, scope),
        );
    }
    for (i, result) in func.results.iter().enumerate() {
        out.map.apply_default(
            Site::Result {
                func: func.id.clone(),
                index: i,
            },
            Val::from_type(&result.ty, scope),
        );
    }

    // Call-site annotations inside the body.
    if let Some(body) = &func.body {
        visit_calls(body, &mut |call| read_call_site(call, scope, out));
    }
}

fn resolve_on_func(func: &FuncDecl, inner: &Inner) -> Result<Site, AnnotationError> {
    let id = func.id.clone();
    match inner {
        Inner::Param(n) => {
            if *n < func.params.len() {
                Ok(Site::Param { func: id, index: *n })
            } else {
                Err(AnnotationError::BadPosition {
                    token: format!("param {n}"),
                    decl: id.to_string(),
                })
            }
        }
        Inner::Result(n) => {
            if *n < func.results.len() {
                Ok(Site::Result { func: id, index: *n })
            } else {
                Err(AnnotationError::BadPosition {
                    token: format!("result {n}"),
                    decl: id.to_string(),
                })
            }
        }
        Inner::Ident(name) => {
            if let Some(recv) = &func.receiver {
                if recv.name.as_deref() == Some(name) {
                    return Ok(Site::Receiver { func: id });
                }
            }
            if let Some(i) = func
                .params
                .iter()
                .position(|p| p.name.as_deref() == Some(name))
            {
                return Ok(Site::Param { func: id, index: i });
            }
            if let Some(i) = func
                .results
                .iter()
                .position(|r| r.name.as_deref() == Some(name))
            {
                return Ok(Site::Result { func: id, index: i });
            }
            Err(AnnotationError::UnknownTarget {
                token: name.clone(),
                decl: id.to_string(),
            })
        }
    }
}

fn read_type(decl: &TypeDecl, scope: &Scope, out: &mut ReaderResult) {
    for line in parse_annot_lines(&decl.doc, &mut out.errors) {
        for (inner, deep) in &line.tokens {
            match inner {
                Inner::Ident(name) if *name == decl.id.name => {
                    // The type's own name targets the type-level deep
                    // position regardless of token shape.
                    let _ = deep;
                    out.map.insert(
                        Site::TypeName(decl.id.clone()),
                        Val::nilable(line.nilable),
                    );
                }
                Inner::Ident(name) => {
                    let field_exists = matches!(
                        decl.ty.underlying(scope),
                        Type::Struct(fields) if fields.iter().any(|f| f.name == *name)
                    );
                    if field_exists {
                        let site = Site::Field(FieldId {
                            owner: decl.id.clone(),
                            name: name.clone(),
                        });
                        insert_bit(&mut out.map, site, line.nilable, *deep);
                    } else {
                        out.errors.push(AnnotationError::UnknownTarget {
                            token: name.clone(),
                            decl: decl.id.to_string(),
                        });
                    }
                }
                other => out.errors.push(AnnotationError::UnknownTarget {
                    token: format!("{other:?}"),
                    decl: decl.id.to_string(),
                }),
            }
        }
    }

    // Interface methods carry their own doc-comments; their annotation
    // sites hang off the synthetic `Iface.method` function ids the scope
    // registers.
    if let Type::Interface(methods) = &decl.ty {
        for method in methods {
            let method_id = FuncId::new(
                decl.id.pkg.clone(),
                format!("{}.{}", decl.id.name, method.name),
            );
            for line in parse_annot_lines(&method.doc, &mut out.errors) {
                for (inner, deep) in &line.tokens {
                    let site = match inner {
                        Inner::Param(n) if *n < method.params.len() => Some(Site::Param {
                            func: method_id.clone(),
                            index: *n,
                        }),
                        Inner::Result(n) if *n < method.results.len() => Some(Site::Result {
                            func: method_id.clone(),
                            index: *n,
                        }),
                        Inner::Ident(name) => method
                            .params
                            .iter()
                            .position(|p| p.name.as_deref() == Some(name))
                            .map(|i| Site::Param {
                                func: method_id.clone(),
                                index: i,
                            })
                            .or_else(|| {
                                method
                                    .results
                                    .iter()
                                    .position(|r| r.name.as_deref() == Some(name))
                                    .map(|i| Site::Result {
                                        func: method_id.clone(),
                                        index: i,
                                    })
                            }),
                        _ => None,
                    };
                    match site {
                        Some(site) => insert_bit(&mut out.map, site, line.nilable, *deep),
                        None => out.errors.push(AnnotationError::UnknownTarget {
                            token: format!("{inner:?}"),
                            decl: method_id.to_string(),
                        }),
                    }
                }
            }
            for (i, param) in method.params.iter().enumerate() {
                out.map.apply_default(
                    Site::Param {
                        func: method_id.clone(),
                        index: i,
                    },
                    Val::from_type(&param.ty, scope),
                );
            }
            for (i, result) in method.results.iter().enumerate() {
                out.map.apply_default(
                    Site::Result {
                        func: method_id.clone(),
                        index: i,
                    },
                    Val::from_type(&result.ty, scope),
                );
            }
        }
    }

    // Defaults: struct fields by their type, the type-level deep position
    // by the deep default of the declared type.
    if let Type::Struct(fields) = decl.ty.underlying(scope) {
        for field in fields {
            out.map.apply_default(
                Site::Field(FieldId {
                    owner: decl.id.clone(),
                    name: field.name.clone(),
                }),
                Val::from_type(&field.ty, scope),
            );
        }
    }
    let type_default = Val::from_type(&decl.ty, scope);
    out.map.apply_default(
        Site::TypeName(decl.id.clone()),
        Val {
            is_nilable: type_default.is_deep_nilable,
            ..Val::EMPTY
        },
    );
}

fn read_globals(pkg: &Package, group: &GlobalGroup, scope: &Scope, out: &mut ReaderResult) {
    let group_lines = parse_annot_lines(&group.doc, &mut out.errors);
    for spec in &group.specs {
        // A spec's own comment overrides the group comment.
        let own_lines = parse_annot_lines(&spec.doc, &mut out.errors);
        let lines = if own_lines.is_empty() && spec.doc.is_empty() {
            &group_lines
        } else {
            &own_lines
        };
        for line in lines {
            for (inner, deep) in &line.tokens {
                match inner {
                    Inner::Ident(name) if spec.names.contains(name) => {
                        let site = Site::GlobalVar(GlobalId {
                            pkg: pkg.path.clone(),
                            name: name.clone(),
                        });
                        insert_bit(&mut out.map, site, line.nilable, *deep);
                    }
                    Inner::Ident(_) => {
                        // Group-level tokens name one spec's variable;
                        // silently skip the others.
                    }
                    other => out.errors.push(AnnotationError::UnknownTarget {
                        token: format!("{other:?}"),
                        decl: spec.names.join(", "),
                    }),
                }
            }
        }
        for name in &spec.names {
            out.map.apply_default(
                Site::GlobalVar(GlobalId {
                    pkg: pkg.path.clone(),
                    name: name.clone(),
                }),
                Val::from_type(&spec.ty, scope),
            );
        }
    }
}

fn read_call_site(call: &CallExpr, scope: &Scope, out: &mut ReaderResult) {
    let Some(annot) = &call.annot else { return };
    let Some(callee) = call.callee_id() else { return };
    let Some(sig) = scope.func(callee) else { return };
    let doc = vec![annot.clone()];
    for line in parse_annot_lines(&doc, &mut out.errors) {
        for (inner, deep) in &line.tokens {
            let site = match inner {
                Inner::Param(n) if *n < sig.params.len() => Some(Site::CallSiteParam {
                    func: callee.clone(),
                    index: *n,
                    loc: call.pos.clone(),
                }),
                Inner::Result(n) if *n < sig.results.len() => Some(Site::CallSiteResult {
                    func: callee.clone(),
                    index: *n,
                    loc: call.pos.clone(),
                }),
                Inner::Ident(name) => sig
                    .params
                    .iter()
                    .position(|p| p.name.as_deref() == Some(name))
                    .map(|i| Site::CallSiteParam {
                        func: callee.clone(),
                        index: i,
                        loc: call.pos.clone(),
                    })
                    .or_else(|| {
                        sig.results
                            .iter()
                            .position(|r| r.name.as_deref() == Some(name))
                            .map(|i| Site::CallSiteResult {
                                func: callee.clone(),
                                index: i,
                                loc: call.pos.clone(),
                            })
                    }),
                _ => None,
            };
            match site {
                Some(site) => insert_bit(&mut out.map, site, line.nilable, *deep),
                None => out.errors.push(AnnotationError::UnknownTarget {
                    token: format!("{inner:?}"),
                    decl: callee.to_string(),
                }),
            }
        }
    }
}

fn insert_bit(map: &mut ObservedMap, site: Site, nilable: bool, deep: bool) {
    let val = if deep {
        Val::deep_nilable(nilable)
    } else {
        Val::nilable(nilable)
    };
    map.insert(site, val);
}

/// Walks every call expression in a statement list, including calls nested
/// in sub-expressions and function literal bodies.
fn visit_calls(stmts: &[Stmt], f: &mut impl FnMut(&CallExpr)) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { lhs, rhs, .. } => {
                for e in lhs.iter().chain(rhs) {
                    visit_calls_expr(e, f);
                }
            }
            Stmt::VarDecl { init, .. } => {
                for e in init {
                    visit_calls_expr(e, f);
                }
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                visit_calls_expr(cond, f);
                visit_calls(then_body, f);
                if let Some(els) = else_body {
                    visit_calls(els, f);
                }
            }
            Stmt::For { cond, body, .. } => {
                if let Some(c) = cond {
                    visit_calls_expr(c, f);
                }
                visit_calls(body, f);
            }
            Stmt::Range { over, body, .. } => {
                visit_calls_expr(over, f);
                visit_calls(body, f);
            }
            Stmt::Return { results, .. } => {
                for e in results {
                    visit_calls_expr(e, f);
                }
            }
            Stmt::Send { chan, value, .. } => {
                visit_calls_expr(chan, f);
                visit_calls_expr(value, f);
            }
            Stmt::Expr(e) => visit_calls_expr(e, f),
            Stmt::Block(inner) => visit_calls(inner, f),
        }
    }
}

fn visit_calls_expr(expr: &Expr, f: &mut impl FnMut(&CallExpr)) {
    match expr {
        Expr::Call(call) => {
            f(call);
            if let Callee::Method { recv, .. } = &call.callee {
                visit_calls_expr(recv, f);
            }
            if let Callee::Value { expr } = &call.callee {
                visit_calls_expr(expr, f);
            }
            for arg in &call.args {
                visit_calls_expr(arg, f);
            }
        }
        Expr::Field { base, .. }
        | Expr::Deref { base, .. }
        | Expr::TypeAssert { base, .. } => visit_calls_expr(base, f),
        Expr::Index { base, index, .. } => {
            visit_calls_expr(base, f);
            visit_calls_expr(index, f);
        }
        Expr::Recv { chan, .. } => visit_calls_expr(chan, f),
        Expr::Unary { operand, .. } => visit_calls_expr(operand, f),
        Expr::Binary { lhs, rhs, .. } => {
            visit_calls_expr(lhs, f);
            visit_calls_expr(rhs, f);
        }
        Expr::Composite { fields, .. } => {
            for (_, e) in fields {
                visit_calls_expr(e, f);
            }
        }
        Expr::FuncLit { decl, .. } => {
            if let Some(body) = &decl.body {
                visit_calls(body, f);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_hir::{Param, Pos, SourceFile};
    use smallvec::smallvec;

    fn func_with_doc(doc: &[&str]) -> FuncDecl {
        FuncDecl {
            id: FuncId::new("pkg", "f"),
            doc: doc.iter().map(ToString::to_string).collect(),
            receiver: None,
            params: smallvec![
                Param::named("p", Type::Pointer(Box::new(Type::Int)), Pos::default()),
                Param::named("items", Type::Slice(Box::new(Type::Pointer(Box::new(Type::Int)))), Pos::default()),
            ],
            variadic: false,
            results: smallvec![Param::unnamed(
                Type::Pointer(Box::new(Type::Int)),
                Pos::default()
            )],
            body: None,
            pos: Pos::default(),
        }
    }

    fn read_one(func: FuncDecl) -> ReaderResult {
        let pkg = Package {
            path: "pkg".into(),
            files: vec![SourceFile {
                name: "f.src".into(),
                doc: vec![],
                decls: vec![Decl::Func(func)],
            }],
        };
        let mut scope = Scope::new();
        scope.add_package(&pkg);
        read_package(&pkg, &scope, &[])
    }

    #[test]
    fn named_and_positional_tokens_resolve() {
        let out = read_one(func_with_doc(&["nilable(p, result 0)"]));
        assert!(out.errors.is_empty());
        let (p, found) = out.map.lookup(&Site::Param {
            func: FuncId::new("pkg", "f"),
            index: 0,
        });
        assert!(found && p.is_nilable && p.is_nilable_set);
        let (r, _) = out.map.lookup(&Site::Result {
            func: FuncId::new("pkg", "f"),
            index: 0,
        });
        assert!(r.is_nilable && r.is_nilable_set);
    }

    #[test]
    fn deep_tokens_target_deep_bit() {
        let out = read_one(func_with_doc(&["nilable(items[])"]));
        let (val, _) = out.map.lookup(&Site::Param {
            func: FuncId::new("pkg", "f"),
            index: 1,
        });
        assert!(val.is_deep_nilable && val.is_deep_nilable_set);
        assert!(!val.is_nilable_set);
    }

    #[test]
    fn nonnil_dominates_slice_default() {
        let func = FuncDecl {
            params: smallvec![Param::named(
                "xs",
                Type::Slice(Box::new(Type::Int)),
                Pos::default()
            )],
            ..func_with_doc(&["nonnil(xs)"])
        };
        let out = read_one(func);
        let (val, _) = out.map.lookup(&Site::Param {
            func: FuncId::new("pkg", "f"),
            index: 0,
        });
        assert!(!val.is_nilable);
        assert!(val.is_nilable_set);
    }

    #[test]
    fn unknown_ident_is_reported_not_fatal() {
        let out = read_one(func_with_doc(&["nilable(q)"]));
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(
            out.errors[0],
            AnnotationError::UnknownTarget { .. }
        ));
    }

    #[test]
    fn docstring_exclusion_skips_file() {
        let pkg = Package {
            path: "pkg".into(),
            files: vec![SourceFile {
                name: "gen.src".into(),
                doc: vec!["Code generated by mockery. DO NOT EDIT.".into()],
                decls: vec![Decl::Func(func_with_doc(&["nilable(p)"]))],
            }],
        };
        let mut scope = Scope::new();
        scope.add_package(&pkg);
        let out = read_package(&pkg, &scope, &["DO NOT EDIT".to_string()]);
        assert!(out.map.is_empty());
    }

    #[test]
    fn contracts_attach_to_their_function() {
        let out = read_one(func_with_doc(&["contract(nonnil -> nonnil)"]));
        let contracts = out.contracts.get(&FuncId::new("pkg", "f")).unwrap();
        assert_eq!(contracts.len(), 1);
    }
}
