//! The inference solver.
//!
//! Consumes the annotation maps and full triggers of every package in the
//! import closure, assigns each site a `{nilable, non-nil}` label per
//! dimension (shallow, deep) with a full explanation chain, and reports
//! every contradiction; the contradictions are the source-level
//! diagnostics.

pub mod explanation;
pub mod solver;

pub use explanation::{ConstraintCause, ExplainedBool};
pub use solver::{solve, Conflict, Dim, DirectFailure, InferredMap, SolveResult};
