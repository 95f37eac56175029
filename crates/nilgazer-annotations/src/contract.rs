//! Function contracts: input-output nullness relations.
//!
//! A contract `contract(nonnil -> nonnil)` on `f` promises that whenever
//! the first argument is non-nil the first result is too. The engine
//! duplicates the annotated function's sites per call site and gates the
//! duplicated triggers with a controller so the solver can evaluate each
//! call in its own context.

use crate::AnnotationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractVal {
    Nilable,
    Nonnil,
    True,
    False,
    Any,
}

impl ContractVal {
    fn parse(token: &str) -> Result<Self, AnnotationError> {
        match token {
            "nilable" => Ok(ContractVal::Nilable),
            "nonnil" => Ok(ContractVal::Nonnil),
            "true" => Ok(ContractVal::True),
            "false" => Ok(ContractVal::False),
            "_" => Ok(ContractVal::Any),
            other => Err(AnnotationError::InvalidContract(format!(
                "unknown contract token `{other}`"
            ))),
        }
    }
}

impl fmt::Display for ContractVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContractVal::Nilable => "nilable",
            ContractVal::Nonnil => "nonnil",
            ContractVal::True => "true",
            ContractVal::False => "false",
            ContractVal::Any => "_",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub ins: Vec<ContractVal>,
    pub outs: Vec<ContractVal>,
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |vals: &[ContractVal]| {
            vals.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "contract({} -> {})", join(&self.ins), join(&self.outs))
    }
}

fn contract_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*contract\((.*)\)\s*$").expect("static regex"))
}

/// Parses every `contract(...)` line in a declaration's doc-comment, one
/// contract per line. Lines that are not contract lines are skipped.
pub fn parse_contracts(doc: &[String]) -> Result<Vec<Contract>, AnnotationError> {
    let mut contracts = Vec::new();
    for line in doc {
        let Some(captures) = contract_line_re().captures(line) else {
            continue;
        };
        let body = &captures[1];
        let Some((ins, outs)) = body.split_once("->") else {
            return Err(AnnotationError::InvalidContract(format!(
                "missing `->` in `{line}`"
            )));
        };
        let parse_side = |side: &str| -> Result<Vec<ContractVal>, AnnotationError> {
            side.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ContractVal::parse)
                .collect()
        };
        contracts.push(Contract {
            ins: parse_side(ins)?,
            outs: parse_side(outs)?,
        });
    }
    Ok(contracts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_contract() {
        let doc = vec!["retMaybe returns the cached entry.".to_string(),
                       "contract(nonnil -> nonnil)".to_string()];
        let contracts = parse_contracts(&doc).unwrap();
        assert_eq!(
            contracts,
            vec![Contract {
                ins: vec![ContractVal::Nonnil],
                outs: vec![ContractVal::Nonnil],
            }]
        );
    }

    #[test]
    fn parses_multi_position_and_wildcards() {
        let doc = vec!["contract(nilable, _ -> false, nonnil)".to_string()];
        let contracts = parse_contracts(&doc).unwrap();
        assert_eq!(contracts[0].ins, vec![ContractVal::Nilable, ContractVal::Any]);
        assert_eq!(contracts[0].outs, vec![ContractVal::False, ContractVal::Nonnil]);
    }

    #[test]
    fn one_contract_per_line() {
        let doc = vec![
            "contract(nonnil -> nonnil)".to_string(),
            "contract(nilable -> nilable)".to_string(),
        ];
        assert_eq!(parse_contracts(&doc).unwrap().len(), 2);
    }

    #[test]
    fn rejects_missing_arrow() {
        let doc = vec!["contract(nonnil, nonnil)".to_string()];
        assert!(parse_contracts(&doc).is_err());
    }

    #[test]
    fn rejects_unknown_token() {
        let doc = vec!["contract(sometimes -> nonnil)".to_string()];
        assert!(parse_contracts(&doc).is_err());
    }
}
