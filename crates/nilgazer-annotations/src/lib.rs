//! Nullability annotation sites, values, and the doc-comment reader.
//!
//! Annotations are keyed by [`Site`], a stable identity of a program
//! location that can carry nullability, and valued by [`Val`], a pair of
//! shallow/deep nilability bits with "explicitly set" markers. The reader
//! turns a package's declarations and doc-comments into an
//! [`ObservedMap`]; everything downstream (assertion generation and
//! inference) consults that map.

pub mod contract;
pub mod map;
pub mod reader;
pub mod site;
pub mod value;

pub use contract::{Contract, ContractVal};
pub use map::ObservedMap;
pub use reader::{read_package, ReaderResult};
pub use site::{Site, SiteObject};
pub use value::Val;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("invalid annotation syntax: {0}")]
    InvalidSyntax(String),
    #[error("annotation token `{token}` does not name anything on `{decl}`")]
    UnknownTarget { token: String, decl: String },
    #[error("annotation position `{token}` is out of bounds on `{decl}`")]
    BadPosition { token: String, decl: String },
    #[error("invalid contract: {0}")]
    InvalidContract(String),
}
