//! Contract handling: call-site duplication and inference.
//!
//! A contracted function's declaration-site triggers are re-keyed per
//! call site onto `CallSiteParam`/`CallSiteResult` copies, and each
//! duplicated result trigger carries a *controller*: the call-site copy
//! of a `nonnil` contract input. The solver only evaluates a controlled
//! trigger once its controller site is known nilable, which is exactly
//! "the contract's promise does not apply at this call".

use crate::consumer::Consumer;
use crate::producer::Producer;
use crate::trigger::FullTrigger;
use indexmap::IndexMap;
use nilgazer_annotations::{Contract, ContractVal};
use nilgazer_hir::{
    Callee, Expr, FuncDecl, FuncId, Package, Pos, Scope, Stmt, Symbol,
};
use std::collections::HashMap;
use tracing::debug;

/// Functions whose branch count exceeds this skip contract inference;
/// a non-fatal internal event, not a diagnostic.
pub const CONTRACT_BRANCH_BUDGET: usize = 8;

/// Collects every call position of the contracted functions in `pkg`.
pub fn collect_call_sites(
    pkg: &Package,
    contracts: &IndexMap<FuncId, Vec<Contract>>,
) -> IndexMap<FuncId, Vec<Pos>> {
    let mut sites: IndexMap<FuncId, Vec<Pos>> = IndexMap::new();
    for func in pkg.functions() {
        if let Some(body) = &func.body {
            collect_in_stmts(body, contracts, &mut sites);
        }
    }
    for entry in sites.values_mut() {
        entry.sort();
        entry.dedup();
    }
    sites
}

fn record(
    expr: &Expr,
    contracts: &IndexMap<FuncId, Vec<Contract>>,
    sites: &mut IndexMap<FuncId, Vec<Pos>>,
) {
    visit_exprs(expr, &mut |e| {
        if let Expr::Call(call) = e {
            if let Some(id) = call.callee_id() {
                if contracts.contains_key(id) {
                    sites.entry(id.clone()).or_default().push(call.pos.clone());
                }
            }
        }
    });
}

fn collect_in_stmts(
    stmts: &[Stmt],
    contracts: &IndexMap<FuncId, Vec<Contract>>,
    sites: &mut IndexMap<FuncId, Vec<Pos>>,
) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { lhs, rhs, .. } => {
                for e in lhs.iter().chain(rhs) {
                    record(e, contracts, sites);
                }
            }
            Stmt::VarDecl { init, .. } => {
                for e in init {
                    record(e, contracts, sites);
                }
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                record(cond, contracts, sites);
                collect_in_stmts(then_body, contracts, sites);
                if let Some(els) = else_body {
                    collect_in_stmts(els, contracts, sites);
                }
            }
            Stmt::For { cond, body, .. } => {
                if let Some(c) = cond {
                    record(c, contracts, sites);
                }
                collect_in_stmts(body, contracts, sites);
            }
            Stmt::Range { over, body, .. } => {
                record(over, contracts, sites);
                collect_in_stmts(body, contracts, sites);
            }
            Stmt::Return { results, .. } => {
                for e in results {
                    record(e, contracts, sites);
                }
            }
            Stmt::Send { chan, value, .. } => {
                record(chan, contracts, sites);
                record(value, contracts, sites);
            }
            Stmt::Expr(e) => record(e, contracts, sites),
            Stmt::Block(inner) => collect_in_stmts(inner, contracts, sites),
        }
    }
}

fn visit_exprs(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::Field { base, .. }
        | Expr::Deref { base, .. }
        | Expr::TypeAssert { base, .. } => visit_exprs(base, f),
        Expr::Index { base, index, .. } => {
            visit_exprs(base, f);
            visit_exprs(index, f);
        }
        Expr::Recv { chan, .. } => visit_exprs(chan, f),
        Expr::Unary { operand, .. } => visit_exprs(operand, f),
        Expr::Binary { lhs, rhs, .. } => {
            visit_exprs(lhs, f);
            visit_exprs(rhs, f);
        }
        Expr::Call(call) => {
            if let Callee::Method { recv, .. } = &call.callee {
                visit_exprs(recv, f);
            }
            if let Callee::Value { expr: callee } = &call.callee {
                visit_exprs(callee, f);
            }
            for arg in &call.args {
                visit_exprs(arg, f);
            }
        }
        Expr::Composite { fields, .. } => {
            for (_, e) in fields {
                visit_exprs(e, f);
            }
        }
        _ => {}
    }
}

/// Re-keys triggers touching contracted functions onto call-site copies.
///
/// - `FuncReturn` producers from a contracted result become one trigger
///   per call site on the `CallSiteResult` copy, gated by a controller
///   when the contract names a `nonnil` input; with no gating input the
///   contract promises the result unconditionally and the trigger drops.
/// - `ArgPass` consumers into a contracted parameter become per-call-site
///   copies on `CallSiteParam`, ungated.
pub fn duplicate_contracted_triggers(
    triggers: &mut Vec<FullTrigger>,
    contracts: &IndexMap<FuncId, Vec<Contract>>,
    call_sites: &IndexMap<FuncId, Vec<Pos>>,
) {
    use nilgazer_annotations::Site;

    let mut out: Vec<FullTrigger> = Vec::with_capacity(triggers.len());
    for trigger in triggers.drain(..) {
        // Producer side: contracted results.
        if let Producer::FuncReturn { site, guarded } = &trigger.producer.producer {
            if let Site::Result { func, index } = site {
                if let (Some(contract_list), Some(locs)) =
                    (contracts.get(func), call_sites.get(func))
                {
                    let contract = &contract_list[0];
                    let applies = contract.outs.get(*index) == Some(&ContractVal::Nonnil);
                    if applies {
                        let gate = contract
                            .ins
                            .iter()
                            .position(|v| *v == ContractVal::Nonnil);
                        for loc in locs {
                            match gate {
                                Some(j) => {
                                    let mut dup = trigger.deep_copy();
                                    dup.producer.producer = Producer::FuncReturn {
                                        site: Site::CallSiteResult {
                                            func: func.clone(),
                                            index: *index,
                                            loc: loc.clone(),
                                        },
                                        guarded: *guarded,
                                    };
                                    dup.controller = Some(Site::CallSiteParam {
                                        func: func.clone(),
                                        index: j,
                                        loc: loc.clone(),
                                    });
                                    dup.created_from_duplication = true;
                                    out.push(dup);
                                }
                                // Unconditional promise: nothing to check.
                                None => {}
                            }
                        }
                        continue;
                    }
                }
            }
        }
        // Consumer side: contracted parameters.
        if let Consumer::ArgPass { site } = &trigger.consumer.consumer {
            if let Site::Param { func, index } = site {
                if let (Some(_), Some(locs)) = (contracts.get(func), call_sites.get(func)) {
                    for loc in locs {
                        let mut dup = trigger.deep_copy();
                        dup.consumer.consumer = Consumer::ArgPass {
                            site: Site::CallSiteParam {
                                func: func.clone(),
                                index: *index,
                                loc: loc.clone(),
                            },
                        };
                        dup.created_from_duplication = true;
                        out.push(dup);
                    }
                    continue;
                }
            }
        }
        out.push(trigger);
    }
    *triggers = out;
}

/// Abstract nullness used by contract inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nullness {
    Nil,
    NonNil,
    Unknown,
}

/// Infers `contract(nonnil -> nonnil)`-shaped contracts for small
/// functions: for each nil-admitting parameter, assume it non-nil,
/// simulate every path, and record the contract when the first result is
/// non-nil on all of them.
pub fn infer_contracts(func: &FuncDecl, scope: &Scope) -> Vec<Contract> {
    let Some(body) = &func.body else {
        return Vec::new();
    };
    if func.results.is_empty() || func.params.is_empty() {
        return Vec::new();
    }
    if !func.results[0].ty.admits_nil(scope) {
        return Vec::new();
    }
    if branch_count(body) > CONTRACT_BRANCH_BUDGET {
        debug!(func = %func.id, "contract inference budget exceeded, skipping");
        return Vec::new();
    }

    let mut contracts = Vec::new();
    for (j, param) in func.params.iter().enumerate() {
        let Some(name) = &param.name else { continue };
        if !param.ty.admits_nil(scope) {
            continue;
        }
        let mut env: HashMap<Symbol, Nullness> = HashMap::new();
        env.insert(name.clone(), Nullness::NonNil);
        let mut returns = Vec::new();
        simulate(body, scope, env, &mut returns);
        let holds = !returns.is_empty() && returns.iter().all(|r| *r == Nullness::NonNil);
        if holds {
            let mut ins = vec![ContractVal::Any; func.params.len()];
            ins[j] = ContractVal::Nonnil;
            let mut outs = vec![ContractVal::Any; func.results.len()];
            outs[0] = ContractVal::Nonnil;
            contracts.push(Contract { ins, outs });
        }
    }
    contracts
}

fn branch_count(stmts: &[Stmt]) -> usize {
    stmts
        .iter()
        .map(|stmt| match stmt {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                1 + branch_count(then_body)
                    + else_body.as_deref().map_or(0, branch_count)
            }
            Stmt::For { body, .. } | Stmt::Range { body, .. } => 1 + branch_count(body),
            Stmt::Block(inner) => branch_count(inner),
            _ => 0,
        })
        .sum()
}

/// Walks every path through `stmts`, collecting the nullness of the
/// first returned result. Loops run their body once; the approximation
/// only ever weakens an inferred contract, never fabricates one.
fn simulate(
    stmts: &[Stmt],
    scope: &Scope,
    mut env: HashMap<Symbol, Nullness>,
    returns: &mut Vec<Nullness>,
) {
    for (i, stmt) in stmts.iter().enumerate() {
        match stmt {
            Stmt::Assign { lhs, rhs, .. } => {
                for (l, r) in lhs.iter().zip(rhs.iter()) {
                    if let Expr::Var {
                        name, global: None, ..
                    } = l
                    {
                        env.insert(name.clone(), eval(r, &env, scope));
                    }
                }
            }
            Stmt::VarDecl { names, init, .. } => {
                for (k, name) in names.iter().enumerate() {
                    let status = init
                        .get(k)
                        .map_or(Nullness::Nil, |e| eval(e, &env, scope));
                    env.insert(name.clone(), status);
                }
            }
            Stmt::Return { results, .. } => {
                let status = results
                    .first()
                    .map_or(Nullness::Unknown, |e| eval(e, &env, scope));
                returns.push(status);
                return;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                let rest = &stmts[i + 1..];
                let mut then_env = env.clone();
                refine_env(cond, true, &mut then_env);
                let mut then_path = then_body.to_vec();
                then_path.extend_from_slice(rest);
                simulate(&then_path, scope, then_env, returns);

                let mut else_env = env;
                refine_env(cond, false, &mut else_env);
                let mut else_path = else_body.clone().unwrap_or_default();
                else_path.extend_from_slice(rest);
                simulate(&else_path, scope, else_env, returns);
                return;
            }
            Stmt::For { body, .. } | Stmt::Range { body, .. } => {
                simulate(body, scope, env.clone(), &mut Vec::new());
            }
            Stmt::Block(inner) => {
                let mut path = inner.clone();
                path.extend_from_slice(&stmts[i + 1..]);
                simulate(&path, scope, env, returns);
                return;
            }
            _ => {}
        }
    }
}

fn refine_env(cond: &Expr, branch: bool, env: &mut HashMap<Symbol, Nullness>) {
    let mut refs = Vec::new();
    crate::guard::refinements(cond, branch, &mut refs);
    for refinement in refs {
        if let crate::tree::TrackedPath::Var(name) = refinement.path {
            env.insert(
                name,
                if refinement.positive {
                    Nullness::NonNil
                } else {
                    Nullness::Nil
                },
            );
        }
    }
}

fn eval(expr: &Expr, env: &HashMap<Symbol, Nullness>, scope: &Scope) -> Nullness {
    match expr {
        Expr::Nil { .. } => Nullness::Nil,
        Expr::Composite { .. } | Expr::FuncLit { .. } | Expr::Str { .. } => Nullness::NonNil,
        Expr::Var {
            name, global: None, ..
        } => env.get(name).copied().unwrap_or(Nullness::Unknown),
        Expr::Call(call) => match call.callee_id() {
            Some(_) => Nullness::Unknown,
            None => match &call.callee {
                Callee::Builtin { name } if name == "new" || name == "make" => Nullness::NonNil,
                _ => Nullness::Unknown,
            },
        },
        _ => {
            let _ = scope;
            Nullness::Unknown
        }
    }
}
