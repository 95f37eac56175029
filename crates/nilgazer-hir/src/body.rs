//! Statements and expressions of function bodies.
//!
//! The shape is deliberately small: the analysis only distinguishes the
//! constructs that can produce, consume, move, or refine a nil value.
//! Every expression carries enough type information to recover its static
//! type through [`Expr::ty`] without a separate environment.

use crate::types::Type;
use crate::{FuncDecl, FuncId, GlobalId, Pos, Scope, Symbol, TypeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `lhs... = rhs...` (or `:=` when `define`). Multi-position forms
    /// cover ok-form reads (`v, ok = m[k]`) and multi-result calls.
    Assign {
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
        define: bool,
        pos: Pos,
    },
    VarDecl {
        names: Vec<Symbol>,
        ty: Type,
        init: Vec<Expr>,
        pos: Pos,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
        pos: Pos,
    },
    /// A loop; `cond: None` loops forever (exits via enclosing control).
    For {
        cond: Option<Expr>,
        body: Vec<Stmt>,
        pos: Pos,
    },
    /// `for key, value := range over { ... }`
    Range {
        key: Option<Symbol>,
        value: Option<Symbol>,
        over: Expr,
        body: Vec<Stmt>,
        pos: Pos,
    },
    Return {
        results: Vec<Expr>,
        pos: Pos,
    },
    /// `chan <- value`
    Send {
        chan: Expr,
        value: Expr,
        pos: Pos,
    },
    Expr(Expr),
    Block(Vec<Stmt>),
}

impl Stmt {
    pub fn pos(&self) -> Pos {
        match self {
            Stmt::Assign { pos, .. }
            | Stmt::VarDecl { pos, .. }
            | Stmt::If { pos, .. }
            | Stmt::For { pos, .. }
            | Stmt::Range { pos, .. }
            | Stmt::Return { pos, .. }
            | Stmt::Send { pos, .. } => pos.clone(),
            Stmt::Expr(e) => e.pos(),
            Stmt::Block(stmts) => stmts.first().map(Stmt::pos).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    Neq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// The untyped nil literal.
    Nil { pos: Pos },
    Bool { value: bool, pos: Pos },
    Int { value: i64, pos: Pos },
    Str { value: String, pos: Pos },
    /// The blank identifier `_`; writes are discarded.
    Blank { pos: Pos },
    /// A named variable. `global` is set for package-level variables.
    Var {
        name: Symbol,
        global: Option<GlobalId>,
        ty: Type,
        pos: Pos,
    },
    /// `base.field` on a struct of named type `owner`.
    Field {
        base: Box<Expr>,
        field: Symbol,
        owner: TypeId,
        ty: Type,
        pos: Pos,
    },
    /// `base[index]` on a map or slice.
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        pos: Pos,
    },
    /// `*base`
    Deref { base: Box<Expr>, pos: Pos },
    /// `<-chan`
    Recv { chan: Box<Expr>, pos: Pos },
    /// `base.(T)`
    TypeAssert {
        base: Box<Expr>,
        ty: Type,
        pos: Pos,
    },
    Call(CallExpr),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        pos: Pos,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        pos: Pos,
    },
    /// A struct literal, with explicitly initialized fields.
    Composite {
        ty: Type,
        fields: Vec<(Symbol, Expr)>,
        pos: Pos,
    },
    /// A function literal with a synthetic id assigned by the driver.
    FuncLit { decl: Box<FuncDecl>, pos: Pos },
}

/// A call expression. `annot` carries a same-line comment attached to the
/// call, scanned for call-site annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExpr {
    pub callee: Callee,
    pub args: Vec<Expr>,
    pub pos: Pos,
    pub annot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Callee {
    Func { id: FuncId },
    Method { recv: Box<Expr>, id: FuncId },
    /// Calling a function-typed value.
    Value { expr: Box<Expr> },
    Builtin { name: Symbol },
}

impl CallExpr {
    /// The callee's declared function id, when statically known.
    pub fn callee_id(&self) -> Option<&FuncId> {
        match &self.callee {
            Callee::Func { id } | Callee::Method { recv: _, id } => Some(id),
            _ => None,
        }
    }

    /// Static result types of the call, empty when the callee is unknown.
    pub fn result_types(&self, scope: &Scope) -> Vec<Type> {
        match &self.callee {
            Callee::Func { id } | Callee::Method { recv: _, id } => scope
                .func(id)
                .map(|sig| sig.results.iter().map(|r| r.ty.clone()).collect())
                .unwrap_or_default(),
            Callee::Value { expr } => match expr.ty(scope).underlying(scope) {
                Type::Func(f) => f.results.clone(),
                _ => Vec::new(),
            },
            Callee::Builtin { .. } => Vec::new(),
        }
    }
}

impl Expr {
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Nil { pos }
            | Expr::Bool { pos, .. }
            | Expr::Int { pos, .. }
            | Expr::Str { pos, .. }
            | Expr::Blank { pos }
            | Expr::Var { pos, .. }
            | Expr::Field { pos, .. }
            | Expr::Index { pos, .. }
            | Expr::Deref { pos, .. }
            | Expr::Recv { pos, .. }
            | Expr::TypeAssert { pos, .. }
            | Expr::Unary { pos, .. }
            | Expr::Binary { pos, .. }
            | Expr::Composite { pos, .. }
            | Expr::FuncLit { pos, .. } => pos.clone(),
            Expr::Call(call) => call.pos.clone(),
        }
    }

    /// The static type of this expression, `Unknown` when indeterminate.
    /// Multi-result calls report the type of their first result; the
    /// destructuring forms read the full list via
    /// [`CallExpr::result_types`].
    pub fn ty(&self, scope: &Scope) -> Type {
        match self {
            Expr::Nil { .. } | Expr::Blank { .. } => Type::Unknown,
            Expr::Bool { .. } => Type::Bool,
            Expr::Int { .. } => Type::Int,
            Expr::Str { .. } => Type::Str,
            Expr::Var { ty, .. } | Expr::Field { ty, .. } | Expr::TypeAssert { ty, .. } => {
                ty.clone()
            }
            Expr::Index { base, .. } => match base.ty(scope).underlying(scope) {
                Type::Map(_, value) => (**value).clone(),
                Type::Slice(elem) | Type::Array(_, elem) => (**elem).clone(),
                _ => Type::Unknown,
            },
            Expr::Deref { base, .. } => match base.ty(scope).underlying(scope) {
                Type::Pointer(elem) => (**elem).clone(),
                _ => Type::Unknown,
            },
            Expr::Recv { chan, .. } => match chan.ty(scope).underlying(scope) {
                Type::Chan(elem) => (**elem).clone(),
                _ => Type::Unknown,
            },
            Expr::Call(call) => call
                .result_types(scope)
                .into_iter()
                .next()
                .unwrap_or(Type::Unknown),
            Expr::Unary { .. } | Expr::Binary { .. } => Type::Bool,
            Expr::Composite { ty, .. } => ty.clone(),
            Expr::FuncLit { decl, .. } => Type::Func(Box::new(crate::types::FuncType {
                params: decl.params.iter().map(|p| p.ty.clone()).collect(),
                results: decl.results.iter().map(|r| r.ty.clone()).collect(),
            })),
        }
    }

    /// A compact rendering used in diagnostics and assignment trails.
    pub fn describe(&self) -> String {
        match self {
            Expr::Nil { .. } => "nil".into(),
            Expr::Bool { value, .. } => value.to_string(),
            Expr::Int { value, .. } => value.to_string(),
            Expr::Str { .. } => "<string>".into(),
            Expr::Blank { .. } => "_".into(),
            Expr::Var { name, .. } => format!("`{name}`"),
            Expr::Field { base, field, .. } => format!("{}.{field}", base.describe_bare()),
            Expr::Index { base, .. } => format!("{}[...]", base.describe_bare()),
            Expr::Deref { base, .. } => format!("*{}", base.describe_bare()),
            Expr::Recv { chan, .. } => format!("<-{}", chan.describe_bare()),
            Expr::TypeAssert { base, .. } => format!("{}.(...)", base.describe_bare()),
            Expr::Call(call) => match call.callee_id() {
                Some(id) => format!("`{}()`", id.name),
                None => "call".into(),
            },
            Expr::Unary { operand, .. } => format!("!{}", operand.describe_bare()),
            Expr::Binary { .. } => "<cond>".into(),
            Expr::Composite { ty, .. } => format!("{ty}{{...}}"),
            Expr::FuncLit { .. } => "func literal".into(),
        }
    }

    fn describe_bare(&self) -> String {
        let described = self.describe();
        described.trim_matches('`').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, ty: Type) -> Expr {
        Expr::Var {
            name: name.into(),
            global: None,
            ty,
            pos: Pos::default(),
        }
    }

    #[test]
    fn index_type_follows_container() {
        let scope = Scope::new();
        let m = var("m", Type::Map(Box::new(Type::Str), Box::new(Type::Pointer(Box::new(Type::Int)))));
        let read = Expr::Index {
            base: Box::new(m),
            index: Box::new(Expr::Str {
                value: "k".into(),
                pos: Pos::default(),
            }),
            pos: Pos::default(),
        };
        assert_eq!(read.ty(&scope), Type::Pointer(Box::new(Type::Int)));
    }

    #[test]
    fn deref_type_is_pointee() {
        let scope = Scope::new();
        let p = var("p", Type::Pointer(Box::new(Type::Str)));
        let deref = Expr::Deref {
            base: Box::new(p),
            pos: Pos::default(),
        };
        assert_eq!(deref.ty(&scope), Type::Str);
    }

    #[test]
    fn describe_renders_field_chains() {
        let base = var("x", Type::Unknown);
        let field = Expr::Field {
            base: Box::new(base),
            field: "next".into(),
            owner: TypeId::new("lists", "Node"),
            ty: Type::Unknown,
            pos: Pos::default(),
        };
        assert_eq!(field.describe(), "x.next");
    }
}
