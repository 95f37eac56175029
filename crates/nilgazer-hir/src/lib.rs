//! Typed intermediate representation of analyzed packages.
//!
//! The analyzer does not parse source itself: the driver hands it a typed,
//! scoped package tree in this representation, together with a [`Scope`]
//! covering the package's transitive type dependencies. Declarations carry
//! their doc-comment lines verbatim so the annotation reader can scan them.

pub mod body;
pub mod types;

pub use body::{BinaryOp, Callee, CallExpr, Expr, Stmt, UnaryOp};
pub use types::{FieldDef, FuncType, MethodSig, Type};

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

pub type Symbol = String;

/// A source position, `file:line:column`.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Pos {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Pos {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Identity of a function or method.
///
/// Methods are qualified by their receiver type (`"List.head"`), interface
/// methods by the interface name (`"Store.Get"`). Function literals get
/// synthetic names assigned by the driver (`"outer$1"`).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FuncId {
    pub pkg: String,
    pub name: Symbol,
}

impl FuncId {
    pub fn new(pkg: impl Into<String>, name: impl Into<Symbol>) -> Self {
        Self {
            pkg: pkg.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pkg, self.name)
    }
}

/// Identity of a named type.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TypeId {
    pub pkg: String,
    pub name: Symbol,
}

impl TypeId {
    pub fn new(pkg: impl Into<String>, name: impl Into<Symbol>) -> Self {
        Self {
            pkg: pkg.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pkg, self.name)
    }
}

/// Identity of a package-level variable.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GlobalId {
    pub pkg: String,
    pub name: Symbol,
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pkg, self.name)
    }
}

/// Identity of a named struct field.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FieldId {
    pub owner: TypeId,
    pub name: Symbol,
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.name)
    }
}

/// One analyzed package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub path: String,
    pub files: Vec<SourceFile>,
}

impl Package {
    /// Iterates every function declaration in the package, in file order.
    pub fn functions(&self) -> impl Iterator<Item = &FuncDecl> {
        self.files.iter().flat_map(|f| {
            f.decls.iter().filter_map(|d| match d {
                Decl::Func(func) => Some(func),
                _ => None,
            })
        })
    }

    pub fn type_decls(&self) -> impl Iterator<Item = &TypeDecl> {
        self.files.iter().flat_map(|f| {
            f.decls.iter().filter_map(|d| match d {
                Decl::Type(ty) => Some(ty),
                _ => None,
            })
        })
    }

    pub fn global_groups(&self) -> impl Iterator<Item = &GlobalGroup> {
        self.files.iter().flat_map(|f| {
            f.decls.iter().filter_map(|d| match d {
                Decl::Globals(g) => Some(g),
                _ => None,
            })
        })
    }
}

/// One source file: its doc-comment lines and top-level declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub doc: Vec<String>,
    pub decls: Vec<Decl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decl {
    Func(FuncDecl),
    Type(TypeDecl),
    Globals(GlobalGroup),
}

/// A function or method declaration. `body` is `None` for declarations
/// without bodies (externally implemented, interface method stubs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDecl {
    pub id: FuncId,
    pub doc: Vec<String>,
    pub receiver: Option<Param>,
    pub params: SmallVec<[Param; 4]>,
    pub variadic: bool,
    pub results: SmallVec<[Param; 2]>,
    pub body: Option<Vec<Stmt>>,
    pub pos: Pos,
}

impl FuncDecl {
    pub fn sig(&self) -> FuncSig {
        FuncSig {
            receiver: self.receiver.as_ref().map(|r| r.ty.clone()),
            params: self.params.clone(),
            variadic: self.variadic,
            results: self.results.clone(),
        }
    }
}

/// A parameter or result position. Unnamed positions carry `name: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: Option<Symbol>,
    pub ty: Type,
    pub pos: Pos,
}

impl Param {
    pub fn named(name: impl Into<Symbol>, ty: Type, pos: Pos) -> Self {
        Self {
            name: Some(name.into()),
            ty,
            pos,
        }
    }

    pub fn unnamed(ty: Type, pos: Pos) -> Self {
        Self {
            name: None,
            ty,
            pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub id: TypeId,
    pub doc: Vec<String>,
    pub ty: Type,
    pub pos: Pos,
}

/// A grouped variable declaration. A group-level doc applies to every spec
/// in the group unless the spec carries its own doc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalGroup {
    pub doc: Vec<String>,
    pub specs: Vec<GlobalSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSpec {
    pub doc: Vec<String>,
    pub names: Vec<Symbol>,
    pub ty: Type,
    pub init: Vec<Expr>,
    pub pos: Pos,
}

/// The signature of a function, detached from its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncSig {
    pub receiver: Option<Type>,
    pub params: SmallVec<[Param; 4]>,
    pub variadic: bool,
    pub results: SmallVec<[Param; 2]>,
}

impl FuncSig {
    /// Folds an argument index onto a declared parameter index. For a
    /// variadic signature with k parameters every index >= k-1 folds onto
    /// k-1; out-of-bounds indices on non-variadic signatures are the
    /// caller's type error and panic.
    pub fn fold_param_index(&self, index: usize) -> usize {
        if self.variadic && !self.params.is_empty() {
            index.min(self.params.len() - 1)
        } else {
            assert!(
                index < self.params.len(),
                "argument index {index} out of bounds for non-variadic signature"
            );
            index
        }
    }

    /// Whether `index` addresses the folded variadic parameter.
    pub fn is_variadic_index(&self, index: usize) -> bool {
        self.variadic && !self.params.is_empty() && index >= self.params.len() - 1
    }

    /// True when the last result is the error interface and no other
    /// result is. Such functions participate in the error-return guard
    /// protocol.
    pub fn is_error_returning(&self, scope: &Scope) -> bool {
        let Some(last) = self.results.last() else {
            return false;
        };
        last.ty.is_error(scope)
            && self.results[..self.results.len() - 1]
                .iter()
                .all(|r| !r.ty.is_error(scope))
    }

    /// True when the last result is `bool` and no other result is. Such
    /// functions participate in the ok-return guard protocol.
    pub fn is_ok_returning(&self, scope: &Scope) -> bool {
        let Some(last) = self.results.last() else {
            return false;
        };
        last.ty.is_bool(scope)
            && self.results[..self.results.len() - 1]
                .iter()
                .all(|r| !r.ty.is_bool(scope))
    }
}

/// Resolved signatures and type definitions for the package under analysis
/// and its transitive dependencies.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    funcs: FnvHashMap<FuncId, FuncSig>,
    types: FnvHashMap<TypeId, Type>,
    methods: FnvHashMap<(TypeId, Symbol), FuncId>,
    in_scope_pkgs: Vec<String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every declaration of `pkg`. Interface methods are entered
    /// as body-less functions named `Iface.method` so annotation sites can
    /// refer to them.
    pub fn add_package(&mut self, pkg: &Package) {
        self.in_scope_pkgs.push(pkg.path.clone());
        for func in pkg.functions() {
            self.funcs.insert(func.id.clone(), func.sig());
            if let Some(recv) = &func.receiver {
                if let Some(owner) = recv.ty.named_id() {
                    let method = func
                        .id
                        .name
                        .rsplit('.')
                        .next()
                        .unwrap_or(&func.id.name)
                        .to_string();
                    self.methods.insert((owner.clone(), method), func.id.clone());
                }
            }
        }
        for decl in pkg.type_decls() {
            self.types.insert(decl.id.clone(), decl.ty.clone());
            if let Type::Interface(methods) = &decl.ty {
                for m in methods {
                    let id = FuncId::new(
                        decl.id.pkg.clone(),
                        format!("{}.{}", decl.id.name, m.name),
                    );
                    self.funcs.insert(id, m.sig());
                }
            }
        }
    }

    pub fn func(&self, id: &FuncId) -> Option<&FuncSig> {
        self.funcs.get(id)
    }

    /// The underlying type of a named type, or `Unknown` for foreign ids.
    pub fn underlying(&self, id: &TypeId) -> &Type {
        self.types.get(id).unwrap_or(&Type::Unknown)
    }

    /// The concrete method `name` on named type `owner`, if declared.
    pub fn method(&self, owner: &TypeId, name: &str) -> Option<&FuncId> {
        self.methods.get(&(owner.clone(), name.to_string()))
    }

    /// Whether `pkg` was registered directly (as opposed to being known
    /// only through imported facts).
    pub fn is_in_scope(&self, pkg: &str) -> bool {
        self.in_scope_pkgs.iter().any(|p| p == pkg)
    }
}
