//! The backward pass: walks each function's CFG from the exit toward the
//! entry, maintaining an [`AssertionTree`] of tracked expressions and
//! their pending consumers, and emits a [`FullTrigger`] whenever a
//! tracked value is bound to a concrete producer.
//!
//! The pass runs the fixpoint without recording, then replays one
//! recording sweep over the stabilized states so each emission lands
//! exactly once.

use crate::cfg::{BasicBlock, Cfg, CfgEdge, FlatStmt};
use crate::consumer::{Assignment, ConsumeTrigger, Consumer};
use crate::guard::{refinements, GuardTable, Nonce, NonceGenerator, OkForm, OkFormKind};
use crate::producer::{ProduceTrigger, Producer};
use crate::tree::{AssertionTree, TrackedPath};
use crate::trigger::{apply_guard_missing_rewrite, dedup_triggers, FullTrigger};
use crate::AnalysisError;
use nilgazer_annotations::Site;
use nilgazer_hir::{Callee, Expr, FieldId, FuncDecl, FuncId, Pos, Scope, Symbol};
use fnv::FnvHashMap;
use petgraph::graph::NodeIndex;
use tracing::{debug, trace};

/// Built-in constructors whose results are always non-nil.
const TRUSTED_NONNIL_BUILTINS: &[&str] = &["new", "make", "append"];
/// Library functions trusted to return non-nil.
const TRUSTED_NONNIL_FUNCS: &[&str] = &["errors.New", "fmt.Errorf", "context.Background"];
/// Built-ins whose results must be assumed nilable.
const TRUSTED_NILABLE_BUILTINS: &[&str] = &["recover"];

#[derive(Debug, Clone)]
pub struct BackpropOptions {
    /// Emit a consumer when a possibly-nil map is read from, not only
    /// written to.
    pub error_on_nilable_map_read: bool,
    /// Descend into function literals.
    pub experimental_anonymous_func: bool,
    /// Hard bound on fixpoint sweeps; the merge is monotone so this only
    /// trips on a logic error.
    pub max_fixpoint_iters: usize,
}

impl Default for BackpropOptions {
    fn default() -> Self {
        Self {
            error_on_nilable_map_read: false,
            experimental_anonymous_func: false,
            max_fixpoint_iters: 256,
        }
    }
}

/// Runs the backward pass over one function and returns its full
/// triggers, guard-rewritten, deduplicated, and in deterministic order.
pub fn analyze_func(
    func: &FuncDecl,
    scope: &Scope,
    opts: &BackpropOptions,
) -> Result<Vec<FullTrigger>, AnalysisError> {
    let Some(body) = &func.body else {
        return Err(AnalysisError::MissingBody {
            func: func.id.to_string(),
        });
    };
    let mut nonces = NonceGenerator::new();
    let guards = GuardTable::collect(body, scope, &mut nonces);
    let cfg = Cfg::build(body);
    let mut engine = Engine::new(func, scope, opts, guards);
    engine.run(&cfg)?;
    let mut triggers = engine.triggers;
    apply_guard_missing_rewrite(&mut triggers);
    dedup_triggers(&mut triggers);
    triggers.sort_by(|a, b| {
        (&a.consumer.pos, &a.producer.pos, &a.consumer.expr_desc)
            .cmp(&(&b.consumer.pos, &b.producer.pos, &b.consumer.expr_desc))
    });
    debug!(func = %func.id, triggers = triggers.len(), "backward pass complete");
    Ok(triggers)
}

struct Engine<'a> {
    func: &'a FuncDecl,
    scope: &'a Scope,
    opts: &'a BackpropOptions,
    guards: GuardTable,
    triggers: Vec<FullTrigger>,
    param_index: FnvHashMap<Symbol, usize>,
    result_index: FnvHashMap<Symbol, usize>,
    recv_name: Option<Symbol>,
}

impl<'a> Engine<'a> {
    fn new(
        func: &'a FuncDecl,
        scope: &'a Scope,
        opts: &'a BackpropOptions,
        guards: GuardTable,
    ) -> Self {
        let param_index = func
            .params
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.name.clone().map(|n| (n, i)))
            .collect();
        let result_index = func
            .results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.name.clone().map(|n| (n, i)))
            .collect();
        let recv_name = func.receiver.as_ref().and_then(|r| r.name.clone());
        Self {
            func,
            scope,
            opts,
            guards,
            triggers: Vec::new(),
            param_index,
            result_index,
            recv_name,
        }
    }

    fn fid(&self) -> FuncId {
        self.func.id.clone()
    }

    fn run(&mut self, cfg: &Cfg) -> Result<(), AnalysisError> {
        let order = cfg.backward_order();
        let mut entry_states: FnvHashMap<NodeIndex, AssertionTree> = FnvHashMap::default();

        // Fixpoint sweeps without recording.
        let mut iterations = 0usize;
        loop {
            let mut changed = false;
            for &node in &order {
                let exit_state = self.exit_state(cfg, node, &entry_states, false);
                let new_entry = self.transfer_block(&cfg.graph[node], exit_state, false);
                let stale = entry_states
                    .get(&node)
                    .is_none_or(|old| !old.state_eq(&new_entry));
                if stale {
                    entry_states.insert(node, new_entry);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            iterations += 1;
            if iterations > self.opts.max_fixpoint_iters {
                return Err(AnalysisError::FixpointOverrun {
                    func: self.func.id.to_string(),
                    limit: self.opts.max_fixpoint_iters,
                });
            }
        }
        trace!(func = %self.func.id, iterations, "fixpoint reached");

        // One recording sweep over the stabilized states.
        for &node in &order {
            let exit_state = self.exit_state(cfg, node, &entry_states, true);
            let entry = self.transfer_block(&cfg.graph[node], exit_state, true);
            entry_states.insert(node, entry);
        }
        let entry_state = entry_states.remove(&cfg.entry).unwrap_or_default();
        self.resolve_entry(entry_state, true);
        Ok(())
    }

    /// The state at a block's exit: the merge of its successors' entry
    /// states, each pulled backward across its edge.
    fn exit_state(
        &mut self,
        cfg: &Cfg,
        node: NodeIndex,
        entry_states: &FnvHashMap<NodeIndex, AssertionTree>,
        record: bool,
    ) -> AssertionTree {
        let successors: Vec<(NodeIndex, CfgEdge)> = cfg
            .successors(node)
            .map(|(target, edge)| (target, edge.clone()))
            .collect();
        let mut merged: Option<AssertionTree> = None;
        for (target, edge) in successors {
            let succ_entry = entry_states.get(&target).cloned().unwrap_or_default();
            let crossed = self.apply_edge(&edge, succ_entry, record);
            merged = Some(match merged {
                None => crossed,
                Some(prev) => prev.merge(&crossed),
            });
        }
        merged.unwrap_or_default()
    }

    /// Pulls a successor's entry state backward across one edge, applying
    /// rich-check refinements on conditional edges.
    fn apply_edge(&mut self, edge: &CfgEdge, state: AssertionTree, record: bool) -> AssertionTree {
        let (cond, branch) = match edge {
            CfgEdge::Fallthrough => return state,
            CfgEdge::CondTrue(c) => (c, true),
            CfgEdge::CondFalse(c) => (c, false),
        };
        let mut state = state;
        let mut refs = Vec::new();
        refinements(cond, branch, &mut refs);
        for refinement in refs {
            // Ok-form condition variables distribute their nonce to the
            // guarded targets (Tracked -> TrackedGuarded).
            if let TrackedPath::Var(name) = &refinement.path {
                let forms: Vec<OkForm> = self.guards.forms_for_cond(name).cloned().collect();
                for form in forms {
                    if form.kind.guard_applies(refinement.positive) {
                        for target in &form.targets {
                            state.mutate(target, |t| {
                                t.guards.insert(form.nonce);
                            });
                        }
                    }
                }
            }
            // A direct nil check resolves pending consumers on the spot:
            // the refined branch pairs them with a never-nil (or
            // known-nil) producer.
            let consumers = state.take(&refinement.path);
            if !consumers.is_empty() {
                let producer = if refinement.positive {
                    Producer::NegativeNilCheck
                } else {
                    Producer::PositiveNilCheck
                };
                for trigger in consumers {
                    self.emit(record, producer.clone(), cond.pos(), trigger, None);
                }
            }
        }
        state
    }

    fn transfer_block(
        &mut self,
        block: &BasicBlock,
        mut state: AssertionTree,
        record: bool,
    ) -> AssertionTree {
        for stmt in block.stmts.iter().rev() {
            state = self.transfer_stmt(stmt, state, record);
        }
        state
    }

    fn transfer_stmt(
        &mut self,
        stmt: &FlatStmt,
        mut state: AssertionTree,
        record: bool,
    ) -> AssertionTree {
        match stmt {
            FlatStmt::Expr(e) => {
                self.walk_uses(e, &mut state, record);
                state
            }
            FlatStmt::Send { chan, value, pos: _ } => {
                if let Some(consumer) = self.deep_assign_consumer(chan, DeepForm::ChanSend) {
                    self.bind_new(value, consumer, &mut state, record);
                }
                self.walk_uses(chan, &mut state, record);
                self.walk_uses(value, &mut state, record);
                state
            }
            FlatStmt::Return { results, pos } => {
                self.transfer_return(results, pos, &mut state, record);
                state
            }
            FlatStmt::RangeBind {
                key,
                value,
                over,
                pos,
            } => {
                let container = self.container_site(over);
                for name in [key, value].into_iter().flatten() {
                    let path = TrackedPath::Var(name.clone());
                    let consumers = state.take(&path);
                    if consumers.is_empty() {
                        continue;
                    }
                    let producer = match &container {
                        Some(site) => Producer::RangeOver { site: site.clone() },
                        None => Producer::Never,
                    };
                    for trigger in consumers {
                        self.emit(record, producer.clone(), pos.clone(), trigger, None);
                    }
                }
                // Ranging over a nil container yields zero iterations, so
                // the container itself is not consumed.
                self.walk_uses(over, &mut state, record);
                state
            }
            FlatStmt::VarDecl {
                names,
                ty,
                init,
                pos,
            } => {
                if init.is_empty() {
                    for name in names {
                        let consumers = state.take(&TrackedPath::Var(name.clone()));
                        if consumers.is_empty() {
                            continue;
                        }
                        let producer = if ty.admits_nil(self.scope) {
                            Producer::NoVarAssign {
                                site: Site::LocalVar {
                                    func: self.fid(),
                                    name: name.clone(),
                                },
                            }
                        } else {
                            Producer::Never
                        };
                        for trigger in consumers {
                            self.emit(record, producer.clone(), pos.clone(), trigger, None);
                        }
                        self.rebind_children(name, None, pos, &mut state, record);
                    }
                    return state;
                }
                let lhs: Vec<Expr> = names
                    .iter()
                    .map(|n| Expr::Var {
                        name: n.clone(),
                        global: None,
                        ty: ty.clone(),
                        pos: pos.clone(),
                    })
                    .collect();
                self.transfer_assign(&lhs, init, pos, state, record)
            }
            FlatStmt::Assign { lhs, rhs, pos } => self.transfer_assign(lhs, rhs, pos, state, record),
        }
    }

    fn transfer_assign(
        &mut self,
        lhs: &[Expr],
        rhs: &[Expr],
        pos: &Pos,
        mut state: AssertionTree,
        record: bool,
    ) -> AssertionTree {
        if let Some(form) = self.guards.form_at(pos).cloned() {
            self.transfer_okform(&form, lhs, rhs, &mut state, record);
            return state;
        }
        // Multi-result call destructuring.
        if lhs.len() > 1 && rhs.len() == 1 {
            if let Expr::Call(call) = &rhs[0] {
                if let Some(callee) = call.callee_id().cloned() {
                    for (i, l) in lhs.iter().enumerate() {
                        let producer = Producer::FuncReturn {
                            site: Site::result(&callee, i),
                            guarded: false,
                        };
                        self.resolve_target(l, producer, call.pos.clone(), None, &mut state, record);
                    }
                    self.walk_uses(&rhs[0], &mut state, record);
                    return state;
                }
            }
        }
        for (l, r) in lhs.iter().zip(rhs.iter()) {
            self.assign_pair(l, r, pos, &mut state, record);
        }
        state
    }

    /// One `l = r` pair: write-target requirements, shallow/deep site
    /// consumers for the incoming value, then the lift of pending
    /// consumers from `l` onto `r`.
    fn assign_pair(
        &mut self,
        l: &Expr,
        r: &Expr,
        pos: &Pos,
        state: &mut AssertionTree,
        record: bool,
    ) {
        // Consumers the write itself imposes on the value.
        match l {
            Expr::Field { field, owner, .. } => {
                let site = Site::Field(FieldId {
                    owner: owner.clone(),
                    name: field.clone(),
                });
                self.bind_new(r, Consumer::FieldAssign { site }, state, record);
            }
            Expr::Var {
                global: Some(g), ..
            } => {
                self.bind_new(r, Consumer::GlobalVarAssign {
                        site: Site::GlobalVar(g.clone()),
                    }, state, record);
            }
            Expr::Deref { base, .. } => {
                self.bind_new(base, Consumer::PtrLoad, state, record);
                if let Some(consumer) = self.deep_assign_consumer(base, DeepForm::Ptr) {
                    self.bind_new(r, consumer, state, record);
                }
            }
            Expr::Index { base, index, .. } => {
                let base_ty = base.ty(self.scope);
                if base_ty.is_map(self.scope) {
                    self.bind_new(base, Consumer::MapWrittenTo, state, record);
                    if let Some(consumer) = self.deep_assign_consumer(base, DeepForm::Map) {
                        self.bind_new(r, consumer, state, record);
                    }
                } else {
                    self.bind_new(base, Consumer::SliceAccess, state, record);
                    if let Some(consumer) = self.deep_assign_consumer(base, DeepForm::Slice) {
                        self.bind_new(r, consumer, state, record);
                    }
                }
                self.walk_uses(index, state, record);
            }
            _ => {}
        }

        // Lift: pending consumers on the target move onto the value.
        if let Some(lpath) = TrackedPath::from_expr(l) {
            let consumers = state.take(&lpath);
            if let TrackedPath::Var(var) = &lpath {
                let rebase = match TrackedPath::from_expr(r) {
                    Some(TrackedPath::Var(rname)) => Some(rname),
                    _ => None,
                };
                self.rebind_children(var, rebase.as_deref(), pos, state, record);
            }
            for mut trigger in consumers {
                trigger.push_trail(Assignment {
                    lhs: lpath.to_string(),
                    rhs: r.describe(),
                    pos: pos.clone(),
                });
                self.bind_trigger(r, trigger, state, record);
            }
        }

        self.walk_uses(r, state, record);
    }

    /// Re-roots the depth-1 field children of `var` onto variable
    /// `rebase`, or resolves them against their field's declared site
    /// when the new value is opaque.
    fn rebind_children(
        &mut self,
        var: &str,
        rebase: Option<&str>,
        pos: &Pos,
        state: &mut AssertionTree,
        record: bool,
    ) {
        for (field, consumers) in state.take_children_of(var) {
            match rebase {
                Some(new_base) => {
                    for trigger in consumers {
                        state.attach(
                            TrackedPath::FieldOf {
                                base: new_base.to_string(),
                                field: field.clone(),
                            },
                            trigger,
                        );
                    }
                }
                None => {
                    let producer = Producer::FieldRead {
                        site: Site::Field(field.clone()),
                    };
                    for trigger in consumers {
                        self.emit(record, producer.clone(), pos.clone(), trigger, None);
                    }
                }
            }
        }
    }

    fn transfer_okform(
        &mut self,
        form: &OkForm,
        lhs: &[Expr],
        rhs: &[Expr],
        state: &mut AssertionTree,
        record: bool,
    ) {
        let rhs0 = &rhs[0];
        match form.kind {
            OkFormKind::MapRead => {
                let Expr::Index { base, index, .. } = rhs0 else {
                    return;
                };
                let producer = match self.container_site(base) {
                    Some(site) => Producer::MapRead {
                        site,
                        needs_guard: true,
                    },
                    None => Producer::Never,
                };
                self.resolve_target(
                    &lhs[0],
                    producer,
                    rhs0.pos(),
                    Some(form.nonce),
                    state,
                    record,
                );
                if self.opts.error_on_nilable_map_read {
                    self.bind_new(base, Consumer::MapAccess, state, record);
                }
                self.walk_uses(base, state, record);
                self.walk_uses(index, state, record);
            }
            OkFormKind::ChanRecv => {
                let Expr::Recv { chan, .. } = rhs0 else {
                    return;
                };
                let producer = match self.container_site(chan) {
                    Some(site) => Producer::ChanRecv {
                        site,
                        needs_guard: true,
                    },
                    None => Producer::Never,
                };
                self.resolve_target(
                    &lhs[0],
                    producer,
                    rhs0.pos(),
                    Some(form.nonce),
                    state,
                    record,
                );
                self.walk_uses(chan, state, record);
            }
            OkFormKind::TypeAssert => {
                let Expr::TypeAssert { base, .. } = rhs0 else {
                    return;
                };
                self.resolve_target(
                    &lhs[0],
                    Producer::OkReadReflCheck,
                    rhs0.pos(),
                    Some(form.nonce),
                    state,
                    record,
                );
                self.walk_uses(base, state, record);
            }
            OkFormKind::ErrorCall | OkFormKind::OkCall => {
                let Expr::Call(call) = rhs0 else { return };
                let Some(callee) = call.callee_id().cloned() else {
                    return;
                };
                let last = lhs.len() - 1;
                for (i, l) in lhs.iter().enumerate() {
                    let producer = Producer::FuncReturn {
                        site: Site::result(&callee, i),
                        guarded: i != last,
                    };
                    let nonce = (i != last).then_some(form.nonce);
                    self.resolve_target(l, producer, call.pos.clone(), nonce, state, record);
                }
                self.walk_uses(rhs0, state, record);
            }
        }
    }

    /// Resolves an assignment target against a concrete producer: pending
    /// consumers on the target's path are emitted against it.
    fn resolve_target(
        &mut self,
        l: &Expr,
        producer: Producer,
        prod_pos: Pos,
        nonce: Option<Nonce>,
        state: &mut AssertionTree,
        record: bool,
    ) {
        let Some(path) = TrackedPath::from_expr(l) else {
            return;
        };
        let consumers = state.take(&path);
        if let TrackedPath::Var(var) = &path {
            self.rebind_children(var, None, &prod_pos, state, record);
        }
        for trigger in consumers {
            self.emit(record, producer.clone(), prod_pos.clone(), trigger, nonce);
        }
    }

    fn transfer_return(
        &mut self,
        results: &[Expr],
        pos: &Pos,
        state: &mut AssertionTree,
        record: bool,
    ) {
        let fid = self.fid();
        // A naked return flows the named results.
        let synthesized: Vec<Expr>;
        let results: &[Expr] = if results.is_empty() && !self.func.results.is_empty() {
            synthesized = self
                .func
                .results
                .iter()
                .map(|r| match &r.name {
                    Some(name) if name != "_" => Expr::Var {
                        name: name.clone(),
                        global: None,
                        ty: r.ty.clone(),
                        pos: pos.clone(),
                    },
                    _ => Expr::Blank { pos: pos.clone() },
                })
                .collect();
            &synthesized
        } else {
            results
        };
        if results.len() != self.func.results.len() {
            return;
        }

        // The error/ok return protocols: the trailing result decides
        // whether the value results are promised. A literal bool or nil
        // decides statically; a trusted constructor marks the failure
        // path; anything else leaves the results unpromised.
        let sig = self.func.sig();
        let protocol = if results.len() >= 2 && sig.is_error_returning(self.scope) {
            let last = &results[results.len() - 1];
            Some(match self.nil_status(last) {
                NilStatus::Nil => RetOutcome::Success,
                NilStatus::NonNil => RetOutcome::Failure,
                NilStatus::Unknown => RetOutcome::Undecided,
            })
        } else if results.len() >= 2 && sig.is_ok_returning(self.scope) {
            Some(match &results[results.len() - 1] {
                Expr::Bool { value: true, .. } => RetOutcome::Success,
                Expr::Bool { value: false, .. } => RetOutcome::Failure,
                _ => RetOutcome::Undecided,
            })
        } else {
            None
        };
        if let Some(outcome) = protocol {
            let last = results.len() - 1;
            let last_expr = &results[last];
            for (i, e) in results.iter().enumerate().take(last) {
                let consumer = match outcome {
                    RetOutcome::Success => Consumer::UseAsNonErrorRetDependentOnErrorRet {
                        site: Site::result(&fid, i),
                        ret_stmt: pos.clone(),
                    },
                    RetOutcome::Failure => continue,
                    RetOutcome::Undecided => Consumer::UseAsReturn {
                        site: Site::result(&fid, i),
                        ret_stmt: pos.clone(),
                    },
                };
                self.bind_new(e, consumer, state, record);
                self.walk_uses(e, state, record);
            }
            if outcome == RetOutcome::Undecided
                && self.func.results[last].ty.is_error(self.scope)
            {
                self.bind_new(last_expr, Consumer::UseAsErrorRetWithNilabilityUnknown {
                        site: Site::result(&fid, last),
                        ret_stmt: pos.clone(),
                    }, state, record);
            }
            self.walk_uses(last_expr, state, record);
            return;
        }

        for (i, e) in results.iter().enumerate() {
            let consumer = if self.func.results[i].ty.is_error(self.scope) {
                Consumer::UseAsErrorResult {
                    site: Site::result(&fid, i),
                }
            } else {
                Consumer::UseAsReturn {
                    site: Site::result(&fid, i),
                    ret_stmt: pos.clone(),
                }
            };
            self.bind_new(e, consumer, state, record);
            self.walk_uses(e, state, record);
        }
    }

    /// Attaches a fresh consumer to the value of `expr`, or emits it
    /// directly when the value is produced on the spot.
    fn bind_new(
        &mut self,
        expr: &Expr,
        consumer: Consumer,
        state: &mut AssertionTree,
        record: bool,
    ) {
        // Synthesized named-result reads carry the return statement's
        // position, so the consumer points at the `return` itself.
        let trigger = ConsumeTrigger::new(consumer, expr.describe(), expr.pos());
        self.bind_trigger(expr, trigger, state, record);
    }

    /// Routes an existing consumer (with its guards and trail) onto the
    /// value of `expr`.
    fn bind_trigger(
        &mut self,
        expr: &Expr,
        trigger: ConsumeTrigger,
        state: &mut AssertionTree,
        record: bool,
    ) {
        if let Some(path) = TrackedPath::from_expr(expr) {
            state.attach(path, trigger);
            return;
        }
        match expr {
            // A single-form type assertion passes its operand through.
            Expr::TypeAssert { base, .. } => self.bind_trigger(base, trigger, state, record),
            _ => match self.produce_expr(expr) {
                Some(producer) => {
                    self.emit(record, producer, expr.pos(), trigger, None);
                }
                // Values that cannot be nil drop their consumers.
                None => {}
            },
        }
    }

    /// The producer for an expression whose value is created on the spot;
    /// `None` when the expression cannot carry nil.
    fn produce_expr(&self, expr: &Expr) -> Option<Producer> {
        match expr {
            Expr::Nil { .. } => Some(Producer::ConstNil),
            Expr::Blank { .. } => Some(Producer::BlankVarReturn),
            Expr::Bool { .. } | Expr::Int { .. } | Expr::Str { .. } => None,
            Expr::Composite { .. } | Expr::FuncLit { .. } => Some(Producer::Never),
            Expr::Unary { .. } | Expr::Binary { .. } => None,
            Expr::Call(call) => Some(self.call_producer(call)),
            Expr::Index { base, .. } => {
                let base_ty = base.ty(self.scope);
                if base_ty.is_map(self.scope) {
                    match self.container_site(base) {
                        Some(site) => Some(Producer::MapRead {
                            site,
                            needs_guard: false,
                        }),
                        None => Some(Producer::Never),
                    }
                } else {
                    Some(self.deep_read_producer(base))
                }
            }
            Expr::Deref { base, .. } => Some(self.deep_read_producer(base)),
            Expr::Recv { chan, .. } => match self.container_site(chan) {
                Some(site) => Some(Producer::ChanRecv {
                    site,
                    needs_guard: false,
                }),
                None => Some(Producer::Never),
            },
            Expr::Field { field, owner, .. } => Some(Producer::FieldRead {
                site: Site::Field(FieldId {
                    owner: owner.clone(),
                    name: field.clone(),
                }),
            }),
            Expr::TypeAssert { .. } | Expr::Var { .. } => None,
        }
    }

    fn call_producer(&self, call: &nilgazer_hir::CallExpr) -> Producer {
        match &call.callee {
            Callee::Builtin { name } => {
                if TRUSTED_NONNIL_BUILTINS.contains(&name.as_str()) {
                    Producer::TrustedFuncNonnil
                } else if TRUSTED_NILABLE_BUILTINS.contains(&name.as_str()) {
                    Producer::TrustedFuncNilable
                } else {
                    Producer::Never
                }
            }
            Callee::Func { id } | Callee::Method { id, .. } => {
                let display = id.to_string();
                if TRUSTED_NONNIL_FUNCS.contains(&display.as_str()) {
                    return Producer::TrustedFuncNonnil;
                }
                match self.scope.func(id) {
                    Some(sig) if !sig.results.is_empty() => Producer::FuncReturn {
                        site: Site::result(id, 0),
                        guarded: false,
                    },
                    // Out-of-scope callee: optimistic.
                    _ => Producer::Never,
                }
            }
            Callee::Value { .. } => Producer::Never,
        }
    }

    /// Producer for a value read out of the deep position of `base`
    /// (`*p`, `s[i]`), selected by what the container resolves to.
    fn deep_read_producer(&self, base: &Expr) -> Producer {
        if let Some(path) = TrackedPath::from_expr(base) {
            if let Some((site, role)) = self.path_site(&path) {
                return match role {
                    PathRole::Param { variadic: false } => Producer::FuncParamDeep { site },
                    PathRole::Param { variadic: true } => {
                        Producer::VariadicFuncParamDeep { site }
                    }
                    PathRole::Receiver => Producer::MethodRecvDeep { site },
                    PathRole::Global => Producer::GlobalVarReadDeep { site },
                    PathRole::Field => Producer::FieldReadDeep { site },
                    PathRole::NamedResult(_) | PathRole::Local => {
                        Producer::LocalVarReadDeep {
                            site: self.local_site(&path),
                        }
                    }
                };
            }
        }
        if let Expr::Call(call) = base {
            if let Some(id) = call.callee_id() {
                if self.scope.func(id).is_some_and(|s| !s.results.is_empty()) {
                    return Producer::FuncReturnDeep {
                        site: Site::result(id, 0),
                    };
                }
            }
        }
        Producer::Never
    }

    /// The deep-assignment consumer for writing through `container`.
    fn deep_assign_consumer(&self, container: &Expr, form: DeepForm) -> Option<Consumer> {
        let container_ty = container.ty(self.scope);
        let elem_admits_nil = container_ty
            .deep_target(self.scope)
            .is_some_and(|elem| elem.admits_nil(self.scope));
        if !elem_admits_nil {
            return Some(Consumer::DeepAssignPrimitive);
        }
        if let Some(path) = TrackedPath::from_expr(container) {
            if let Some((site, role)) = self.path_site(&path) {
                let consumer = match role {
                    PathRole::Param { variadic: false } => Consumer::ParamAssignDeep { site },
                    PathRole::Param { variadic: true } => {
                        Consumer::VariadicParamAssignDeep { site }
                    }
                    PathRole::NamedResult(i) => Consumer::FuncRetAssignDeep {
                        site: Site::result(&self.fid(), i),
                    },
                    PathRole::Field => Consumer::FieldAssignDeep { site },
                    PathRole::Global => Consumer::GlobalVarAssignDeep { site },
                    PathRole::Receiver => Consumer::ParamAssignDeep { site },
                    PathRole::Local => match form {
                        DeepForm::Ptr => Consumer::PtrAssign { site },
                        DeepForm::Slice => Consumer::SliceAssign { site },
                        DeepForm::Map => Consumer::MapAssign { site },
                        DeepForm::ChanSend => Consumer::ChanSend { site },
                    },
                };
                return Some(consumer);
            }
        }
        if let Expr::Call(call) = container {
            if let Some(id) = call.callee_id() {
                let site = Site::result(id, 0);
                let consumer = match form {
                    DeepForm::Ptr => Consumer::PtrAssign { site },
                    DeepForm::Slice => Consumer::SliceAssign { site },
                    DeepForm::Map => Consumer::MapAssign { site },
                    DeepForm::ChanSend => Consumer::ChanSend { site },
                };
                return Some(consumer);
            }
        }
        None
    }

    /// Attaches the requirement consumers an expression's evaluation
    /// imposes on its sub-expressions, recursively.
    fn walk_uses(&mut self, expr: &Expr, state: &mut AssertionTree, record: bool) {
        match expr {
            Expr::Deref { base, .. } => {
                self.bind_new(base, Consumer::PtrLoad, state, record);
                self.walk_uses(base, state, record);
            }
            Expr::Field { base, .. } => {
                self.bind_new(base, Consumer::FieldAccess, state, record);
                self.walk_uses(base, state, record);
            }
            Expr::Index { base, index, .. } => {
                let base_ty = base.ty(self.scope);
                if base_ty.is_map(self.scope) {
                    if self.opts.error_on_nilable_map_read {
                        self.bind_new(base, Consumer::MapAccess, state, record);
                    }
                } else {
                    self.bind_new(base, Consumer::SliceAccess, state, record);
                }
                self.walk_uses(base, state, record);
                self.walk_uses(index, state, record);
            }
            Expr::Recv { chan, .. } => self.walk_uses(chan, state, record),
            Expr::TypeAssert { base, .. } => {
                // A single-form assertion panics on a nil operand.
                self.bind_new(base, Consumer::Tautology, state, record);
                self.walk_uses(base, state, record);
            }
            Expr::Call(call) => {
                if let Callee::Method { recv, id } = &call.callee {
                    if self.scope.func(id).is_some() {
                        self.bind_new(
                            recv,
                            Consumer::RecvPass {
                                site: Site::Receiver { func: id.clone() },
                            },
                            state,
                            record,
                        );
                    }
                    self.walk_uses(recv, state, record);
                }
                if let Callee::Value { expr: callee } = &call.callee {
                    // Invoking a nil function value panics.
                    self.bind_new(callee, Consumer::Tautology, state, record);
                    self.walk_uses(callee, state, record);
                }
                let sig = call.callee_id().and_then(|id| self.scope.func(id)).cloned();
                for (i, arg) in call.args.iter().enumerate() {
                    if let (Some(sig), Some(id)) = (&sig, call.callee_id()) {
                        let site = Site::param(id, sig, i);
                        self.bind_new(arg, Consumer::ArgPass { site }, state, record);
                    }
                    self.walk_uses(arg, state, record);
                }
            }
            Expr::Unary { operand, .. } => self.walk_uses(operand, state, record),
            Expr::Binary { lhs, rhs, .. } => {
                self.walk_uses(lhs, state, record);
                self.walk_uses(rhs, state, record);
            }
            Expr::Composite { fields, .. } => {
                for (_, e) in fields {
                    self.walk_uses(e, state, record);
                }
            }
            Expr::FuncLit { decl, .. } => {
                if self.opts.experimental_anonymous_func && record {
                    match analyze_func(decl, self.scope, self.opts) {
                        Ok(triggers) => self.triggers.extend(triggers),
                        Err(e) => debug!(func = %decl.id, error = %e, "skipping function literal"),
                    }
                }
            }
            _ => {}
        }
    }

    /// Resolves the entry state: values still tracked at the function's
    /// top bind to their declaration-site producers.
    fn resolve_entry(&mut self, mut state: AssertionTree, record: bool) {
        let fid = self.fid();
        let pos = self.func.pos.clone();
        for (path, consumers) in state.drain_sorted() {
            let producer = match &path {
                TrackedPath::Var(name) => {
                    if self.recv_name.as_deref() == Some(name) {
                        Producer::MethodRecv {
                            site: Site::Receiver { func: fid.clone() },
                        }
                    } else if let Some(&index) = self.param_index.get(name) {
                        let site = Site::Param {
                            func: fid.clone(),
                            index,
                        };
                        if self.func.variadic && index == self.func.params.len() - 1 {
                            Producer::VariadicFuncParam { site }
                        } else {
                            Producer::FuncParam { site }
                        }
                    } else {
                        // A local (or named result) read with no prior
                        // assignment on this path: its zero value is nil.
                        Producer::NoVarAssign {
                            site: Site::LocalVar {
                                func: fid.clone(),
                                name: name.clone(),
                            },
                        }
                    }
                }
                TrackedPath::FieldOf { field, .. } => Producer::FieldRead {
                    site: Site::Field(field.clone()),
                },
                TrackedPath::Global(g) => Producer::GlobalVarRead {
                    site: Site::GlobalVar(g.clone()),
                },
            };
            for trigger in consumers {
                self.emit(record, producer.clone(), pos.clone(), trigger, None);
            }
        }
    }

    /// Maps a tracked path onto its annotation site and role.
    fn path_site(&self, path: &TrackedPath) -> Option<(Site, PathRole)> {
        match path {
            TrackedPath::Var(name) => {
                if self.recv_name.as_deref() == Some(name.as_str()) {
                    return Some((
                        Site::Receiver { func: self.fid() },
                        PathRole::Receiver,
                    ));
                }
                if let Some(&index) = self.param_index.get(name) {
                    let variadic =
                        self.func.variadic && index == self.func.params.len() - 1;
                    return Some((
                        Site::Param {
                            func: self.fid(),
                            index,
                        },
                        PathRole::Param { variadic },
                    ));
                }
                if let Some(&index) = self.result_index.get(name) {
                    return Some((
                        Site::result(&self.fid(), index),
                        PathRole::NamedResult(index),
                    ));
                }
                Some((
                    Site::LocalVar {
                        func: self.fid(),
                        name: name.clone(),
                    },
                    PathRole::Local,
                ))
            }
            TrackedPath::FieldOf { field, .. } => {
                Some((Site::Field(field.clone()), PathRole::Field))
            }
            TrackedPath::Global(g) => {
                Some((Site::GlobalVar(g.clone()), PathRole::Global))
            }
        }
    }

    fn local_site(&self, path: &TrackedPath) -> Site {
        match path {
            TrackedPath::Var(name) => Site::LocalVar {
                func: self.fid(),
                name: name.clone(),
            },
            TrackedPath::FieldOf { field, .. } => Site::Field(field.clone()),
            TrackedPath::Global(g) => Site::GlobalVar(g.clone()),
        }
    }

    /// The annotation site the deep position of `container` answers to.
    fn container_site(&self, container: &Expr) -> Option<Site> {
        if let Some(path) = TrackedPath::from_expr(container) {
            if let Some((site, _)) = self.path_site(&path) {
                return Some(site);
            }
        }
        if let Expr::Call(call) = container {
            if let Some(id) = call.callee_id() {
                if self.scope.func(id).is_some_and(|s| !s.results.is_empty()) {
                    return Some(Site::result(id, 0));
                }
            }
        }
        // A named container type answers through its type-level site.
        container
            .ty(self.scope)
            .named_id()
            .map(|id| Site::TypeName(id.clone()))
    }

    fn nil_status(&self, expr: &Expr) -> NilStatus {
        match expr {
            Expr::Nil { .. } => NilStatus::Nil,
            Expr::Composite { .. } | Expr::FuncLit { .. } => NilStatus::NonNil,
            Expr::Call(call) => match self.call_producer(call) {
                Producer::TrustedFuncNonnil => NilStatus::NonNil,
                Producer::TrustedFuncNilable => NilStatus::Unknown,
                _ => NilStatus::Unknown,
            },
            _ => NilStatus::Unknown,
        }
    }

    /// Records one full trigger, computing the consumer's guard match
    /// against the producer's expected nonce.
    fn emit(
        &mut self,
        record: bool,
        producer: Producer,
        prod_pos: Pos,
        mut trigger: ConsumeTrigger,
        nonce: Option<Nonce>,
    ) {
        trigger.guard_matched = if producer.needs_guard_match() {
            nonce.is_some_and(|n| trigger.guards.contains(&n))
        } else {
            true
        };
        if record {
            self.triggers
                .push(FullTrigger::new(ProduceTrigger::new(producer, prod_pos), trigger));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DeepForm {
    Ptr,
    Slice,
    Map,
    ChanSend,
}

#[derive(Debug, Clone, Copy)]
enum PathRole {
    Param { variadic: bool },
    Receiver,
    NamedResult(usize),
    Local,
    Global,
    Field,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NilStatus {
    Nil,
    NonNil,
    Unknown,
}

/// How a protocol return resolves: the trailing error is nil / the
/// trailing bool is true (success), statically failed, or undecided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetOutcome {
    Success,
    Failure,
    Undecided,
}
