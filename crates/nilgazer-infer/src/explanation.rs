//! Explained booleans: every fixed label remembers why it was fixed.

use nilgazer_annotations::Site;
use nilgazer_core::Assignment;
use nilgazer_hir::Pos;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The assertion that forced a value, retaining positions and prestrings
/// so a conflict can be reported with its full cause chain. `deeper`
/// links to the next cause (the explanation of the site that propagated
/// into this one); annotations and direct shallow facts end the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintCause {
    pub producer_desc: String,
    pub consumer_desc: String,
    pub producer_pos: Pos,
    pub consumer_pos: Pos,
    pub trail: Vec<Assignment>,
    pub deeper: Option<Box<ExplainedBool>>,
}

/// A fixed boolean label with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExplainedBool {
    TrueBecauseAnnotation { site: Site },
    FalseBecauseAnnotation { site: Site },
    TrueBecauseShallowConstraint { cause: ConstraintCause },
    FalseBecauseShallowConstraint { cause: ConstraintCause },
    TrueBecauseDeepConstraint { cause: ConstraintCause },
    FalseBecauseDeepConstraint { cause: ConstraintCause },
}

impl ExplainedBool {
    pub fn value(&self) -> bool {
        matches!(
            self,
            ExplainedBool::TrueBecauseAnnotation { .. }
                | ExplainedBool::TrueBecauseShallowConstraint { .. }
                | ExplainedBool::TrueBecauseDeepConstraint { .. }
        )
    }

    pub fn cause(&self) -> Option<&ConstraintCause> {
        match self {
            ExplainedBool::TrueBecauseShallowConstraint { cause }
            | ExplainedBool::FalseBecauseShallowConstraint { cause }
            | ExplainedBool::TrueBecauseDeepConstraint { cause }
            | ExplainedBool::FalseBecauseDeepConstraint { cause } => Some(cause),
            _ => None,
        }
    }

    /// The position of the assertion closest to this label.
    pub fn pos(&self) -> Option<&Pos> {
        self.cause().map(|c| &c.consumer_pos)
    }

    /// The cause chain, outermost first, ending at an annotation or a
    /// chain-terminating shallow fact.
    pub fn chain(&self) -> Vec<&ExplainedBool> {
        let mut links = vec![self];
        let mut current = self;
        while let Some(deeper) = current.cause().and_then(|c| c.deeper.as_deref()) {
            links.push(deeper);
            current = deeper;
        }
        links
    }
}

impl fmt::Display for ExplainedBool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExplainedBool::TrueBecauseAnnotation { site } => {
                write!(f, "annotated nilable at {site}")
            }
            ExplainedBool::FalseBecauseAnnotation { site } => {
                write!(f, "annotated nonnil at {site}")
            }
            ExplainedBool::TrueBecauseShallowConstraint { cause }
            | ExplainedBool::TrueBecauseDeepConstraint { cause } => {
                write!(
                    f,
                    "must be nilable: {} at {}",
                    cause.producer_desc, cause.producer_pos
                )
            }
            ExplainedBool::FalseBecauseShallowConstraint { cause }
            | ExplainedBool::FalseBecauseDeepConstraint { cause } => {
                write!(
                    f,
                    "must be nonnil: {} at {}",
                    cause.consumer_desc, cause.consumer_pos
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_hir::FuncId;

    fn site() -> Site {
        Site::Param {
            func: FuncId::new("pkg", "f"),
            index: 0,
        }
    }

    #[test]
    fn value_follows_polarity() {
        assert!(ExplainedBool::TrueBecauseAnnotation { site: site() }.value());
        assert!(!ExplainedBool::FalseBecauseAnnotation { site: site() }.value());
    }

    #[test]
    fn chain_walks_to_the_root_cause() {
        let root = ExplainedBool::TrueBecauseAnnotation { site: site() };
        let mid = ExplainedBool::TrueBecauseShallowConstraint {
            cause: ConstraintCause {
                producer_desc: "read from param".into(),
                consumer_desc: "passed".into(),
                producer_pos: Pos::new("a.src", 1, 1),
                consumer_pos: Pos::new("a.src", 2, 1),
                trail: vec![],
                deeper: Some(Box::new(root.clone())),
            },
        };
        let chain = mid.chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], &root);
    }
}
