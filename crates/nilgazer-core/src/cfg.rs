//! Control-flow graph construction.
//!
//! Function bodies are lowered into basic blocks of flat statements with
//! explicit branch edges; the backward pass walks this graph with a
//! worklist in a deterministic order derived from the reversed graph.

use nilgazer_hir::{Expr, Pos, Stmt, Symbol, Type};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{DfsPostOrder, EdgeRef, Reversed};
use petgraph::Direction;

/// A linearized statement; nesting has been lowered into the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatStmt {
    Assign {
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
        pos: Pos,
    },
    VarDecl {
        names: Vec<Symbol>,
        ty: Type,
        init: Vec<Expr>,
        pos: Pos,
    },
    Return {
        results: Vec<Expr>,
        pos: Pos,
    },
    Send {
        chan: Expr,
        value: Expr,
        pos: Pos,
    },
    Expr(Expr),
    /// The per-iteration binding of a range loop's key/value variables.
    RangeBind {
        key: Option<Symbol>,
        value: Option<Symbol>,
        over: Expr,
        pos: Pos,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicBlock {
    pub stmts: Vec<FlatStmt>,
}

/// Edge labels. Conditional edges carry the branch condition so the
/// backward pass can apply its refinements when crossing them.
#[derive(Debug, Clone, PartialEq)]
pub enum CfgEdge {
    Fallthrough,
    CondTrue(Expr),
    CondFalse(Expr),
}

#[derive(Debug)]
pub struct Cfg {
    pub graph: DiGraph<BasicBlock, CfgEdge>,
    pub entry: NodeIndex,
    pub exit: NodeIndex,
}

impl Cfg {
    pub fn build(body: &[Stmt]) -> Cfg {
        let mut graph = DiGraph::new();
        let entry = graph.add_node(BasicBlock::default());
        let exit = graph.add_node(BasicBlock::default());
        let mut builder = Builder { graph, exit };
        if let Some(end) = builder.lower_list(body, entry) {
            builder
                .graph
                .add_edge(end, builder.exit, CfgEdge::Fallthrough);
        }
        Cfg {
            graph: builder.graph,
            entry,
            exit,
        }
    }

    /// Blocks in the order the backward worklist seeds them: reverse
    /// post-order of the reversed graph, so the exit comes first and a
    /// block follows its successors. Blocks unreachable from the exit
    /// (infinite loops) are appended in index order.
    pub fn backward_order(&self) -> Vec<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut dfs = DfsPostOrder::new(reversed, self.exit);
        let mut postorder = Vec::new();
        while let Some(node) = dfs.next(reversed) {
            postorder.push(node);
        }
        postorder.reverse();
        for idx in self.graph.node_indices() {
            if !postorder.contains(&idx) {
                postorder.push(idx);
            }
        }
        postorder
    }

    pub fn successors(&self, node: NodeIndex) -> impl Iterator<Item = (NodeIndex, &CfgEdge)> {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| (e.target(), e.weight()))
    }

    pub fn predecessors(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(node, Direction::Incoming)
    }
}

struct Builder {
    graph: DiGraph<BasicBlock, CfgEdge>,
    exit: NodeIndex,
}

impl Builder {
    fn push(&mut self, node: NodeIndex, stmt: FlatStmt) {
        self.graph[node].stmts.push(stmt);
    }

    fn fresh(&mut self) -> NodeIndex {
        self.graph.add_node(BasicBlock::default())
    }

    /// Lowers a statement list starting in block `cur`; returns the open
    /// block at the end, or `None` when every path returned.
    fn lower_list(&mut self, stmts: &[Stmt], mut cur: NodeIndex) -> Option<NodeIndex> {
        for stmt in stmts {
            match stmt {
                Stmt::Assign {
                    lhs, rhs, pos, ..
                } => self.push(
                    cur,
                    FlatStmt::Assign {
                        lhs: lhs.clone(),
                        rhs: rhs.clone(),
                        pos: pos.clone(),
                    },
                ),
                Stmt::VarDecl {
                    names,
                    ty,
                    init,
                    pos,
                } => self.push(
                    cur,
                    FlatStmt::VarDecl {
                        names: names.clone(),
                        ty: ty.clone(),
                        init: init.clone(),
                        pos: pos.clone(),
                    },
                ),
                Stmt::Send { chan, value, pos } => self.push(
                    cur,
                    FlatStmt::Send {
                        chan: chan.clone(),
                        value: value.clone(),
                        pos: pos.clone(),
                    },
                ),
                Stmt::Expr(e) => self.push(cur, FlatStmt::Expr(e.clone())),
                Stmt::Block(inner) => {
                    cur = self.lower_list(inner, cur)?;
                }
                Stmt::Return { results, pos } => {
                    self.push(
                        cur,
                        FlatStmt::Return {
                            results: results.clone(),
                            pos: pos.clone(),
                        },
                    );
                    self.graph.add_edge(cur, self.exit, CfgEdge::Fallthrough);
                    return None;
                }
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                    ..
                } => {
                    let then_entry = self.fresh();
                    let else_entry = self.fresh();
                    self.graph
                        .add_edge(cur, then_entry, CfgEdge::CondTrue(cond.clone()));
                    self.graph
                        .add_edge(cur, else_entry, CfgEdge::CondFalse(cond.clone()));
                    let then_end = self.lower_list(then_body, then_entry);
                    let else_end = match else_body {
                        Some(els) => self.lower_list(els, else_entry),
                        None => Some(else_entry),
                    };
                    match (then_end, else_end) {
                        (None, None) => return None,
                        (then_end, else_end) => {
                            let join = self.fresh();
                            if let Some(t) = then_end {
                                self.graph.add_edge(t, join, CfgEdge::Fallthrough);
                            }
                            if let Some(e) = else_end {
                                self.graph.add_edge(e, join, CfgEdge::Fallthrough);
                            }
                            cur = join;
                        }
                    }
                }
                Stmt::For { cond, body, .. } => {
                    let head = self.fresh();
                    self.graph.add_edge(cur, head, CfgEdge::Fallthrough);
                    let body_entry = self.fresh();
                    let after = self.fresh();
                    match cond {
                        Some(c) => {
                            self.graph
                                .add_edge(head, body_entry, CfgEdge::CondTrue(c.clone()));
                            self.graph
                                .add_edge(head, after, CfgEdge::CondFalse(c.clone()));
                        }
                        None => {
                            self.graph
                                .add_edge(head, body_entry, CfgEdge::Fallthrough);
                            self.graph.add_edge(head, after, CfgEdge::Fallthrough);
                        }
                    }
                    if let Some(body_end) = self.lower_list(body, body_entry) {
                        self.graph.add_edge(body_end, head, CfgEdge::Fallthrough);
                    }
                    cur = after;
                }
                Stmt::Range {
                    key,
                    value,
                    over,
                    body,
                    pos,
                } => {
                    let head = self.fresh();
                    self.push(
                        head,
                        FlatStmt::RangeBind {
                            key: key.clone(),
                            value: value.clone(),
                            over: over.clone(),
                            pos: pos.clone(),
                        },
                    );
                    self.graph.add_edge(cur, head, CfgEdge::Fallthrough);
                    let body_entry = self.fresh();
                    let after = self.fresh();
                    self.graph
                        .add_edge(head, body_entry, CfgEdge::Fallthrough);
                    self.graph.add_edge(head, after, CfgEdge::Fallthrough);
                    if let Some(body_end) = self.lower_list(body, body_entry) {
                        self.graph.add_edge(body_end, head, CfgEdge::Fallthrough);
                    }
                    cur = after;
                }
            }
        }
        Some(cur)
    }
}
