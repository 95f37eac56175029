//! The assertion generation engine.
//!
//! For each function the engine runs a backward dataflow over the
//! control-flow graph, pairing every place a value may be produced as nil
//! with every place one is required non-nil. The resulting
//! [`FullTrigger`]s are the unit the inference solver evaluates across
//! packages.
//!
//! Values in this crate follow the one-writer pattern: producers,
//! consumers, and full triggers are never mutated after construction;
//! anything that needs a variant takes a deep copy.

pub mod affiliation;
pub mod backprop;
pub mod cfg;
pub mod consumer;
pub mod contracts;
pub mod guard;
pub mod producer;
pub mod struct_init;
pub mod tree;
pub mod trigger;

pub use backprop::{analyze_func, BackpropOptions};
pub use consumer::{Assignment, ConsumeTrigger, Consumer};
pub use guard::{Nonce, NonceGenerator};
pub use producer::{ProduceTrigger, Producer};
pub use trigger::{full_trigger_slices_eq, FullTrigger, TriggerKind};

use thiserror::Error;

/// Internal engine failures. These never abort a package analysis; the
/// facade traps them and attaches them to the package result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("function `{func}` has no body to analyze")]
    MissingBody { func: String },
    #[error("backward pass did not stabilize within {limit} iterations for `{func}`")]
    FixpointOverrun { func: String, limit: usize },
    #[error("internal analyzer panic: {0}")]
    Internal(String),
}
