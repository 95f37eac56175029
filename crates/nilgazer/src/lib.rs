//! # Nilgazer: whole-program nil-safety analysis
//!
//! The facade over the analysis pipeline. A driver hands in one typed
//! package (plus the [`Scope`] of its transitive type dependencies), the
//! opaque facts of already-analyzed packages, and a configuration; it
//! gets back diagnostics, internal errors, and this package's fact to
//! persist for dependents.
//!
//! ```rust
//! use nilgazer::{analyze_package, AnalyzerConfig};
//! use nilgazer_hir::{Package, Scope};
//!
//! let pkg = Package { path: "demo".into(), files: vec![] };
//! let mut scope = Scope::new();
//! scope.add_package(&pkg);
//! let result = analyze_package(&pkg, &scope, &[], &AnalyzerConfig::default());
//! assert!(result.diagnostics.is_empty());
//! ```
//!
//! ## Pipeline
//!
//! 1. Annotation read ([`nilgazer_annotations::read_package`])
//! 2. Backward pass per function ([`nilgazer_core::analyze_func`])
//! 3. Affiliation, struct-init, contract passes
//! 4. Solve ([`nilgazer_infer::solve`]) and render diagnostics
//!
//! Internal panics are trapped here and surfaced on
//! [`PackageResult::errors`]; the rest of the package's analysis
//! survives.

pub mod config;
pub mod facts;
pub mod report;

pub use config::AnalyzerConfig;
pub use facts::{decode as decode_fact, encode as encode_fact, FactError, PackageFact};
pub use report::{format_diagnostic, Diagnostic};

use nilgazer_annotations::read_package;
use nilgazer_core::backprop::{analyze_func, BackpropOptions};
use nilgazer_core::affiliation::affiliations;
use nilgazer_core::contracts::{
    collect_call_sites, duplicate_contracted_triggers, infer_contracts,
};
use nilgazer_core::struct_init::struct_init_triggers;
use nilgazer_core::FullTrigger;
use nilgazer_hir::{Package, Scope};
use nilgazer_infer::solve;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// The outcome of analyzing one package.
#[derive(Debug, Clone, Default)]
pub struct PackageResult {
    pub diagnostics: Vec<Diagnostic>,
    /// Internal errors (annotation problems, trapped panics, overruns);
    /// never fatal to the rest of the package.
    pub errors: Vec<String>,
    /// The fact to persist for dependent packages.
    pub fact: Vec<u8>,
}

/// Analyzes one package. This is the only entry point; it never panics.
/// Internal failures are converted into entries on the result's error
/// list.
pub fn analyze_package(
    pkg: &Package,
    scope: &Scope,
    imported_facts: &[Vec<u8>],
    config: &AnalyzerConfig,
) -> PackageResult {
    match catch_unwind(AssertUnwindSafe(|| {
        analyze_inner(pkg, scope, imported_facts, config)
    })) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(pkg = %pkg.path, %message, "analysis aborted by internal panic");
            PackageResult {
                diagnostics: Vec::new(),
                errors: vec![format!("internal panic: {message}")],
                fact: Vec::new(),
            }
        }
    }
}

fn analyze_inner(
    pkg: &Package,
    scope: &Scope,
    imported_facts: &[Vec<u8>],
    config: &AnalyzerConfig,
) -> PackageResult {
    let mut errors = Vec::new();

    if !config.is_pkg_in_scope(&pkg.path) {
        debug!(pkg = %pkg.path, "package out of scope");
        let fact = facts::encode(&PackageFact {
            pkg: pkg.path.clone(),
            ..PackageFact::default()
        })
        .unwrap_or_default();
        return PackageResult {
            diagnostics: Vec::new(),
            errors,
            fact,
        };
    }

    // Annotations and contracts.
    let reader_out = read_package(pkg, scope, &config.exclude_file_docstrings);
    errors.extend(reader_out.errors.iter().map(ToString::to_string));

    // Combine imported maps and triggers with the local view.
    let mut observed = reader_out.map.clone();
    let mut imported_triggers: Vec<FullTrigger> = Vec::new();
    for blob in imported_facts {
        match facts::decode(blob) {
            Ok(fact) => {
                observed.absorb(&fact.map);
                imported_triggers.extend(fact.triggers);
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    // Backward pass, one function at a time; a panic in one function
    // costs only that function.
    let opts = BackpropOptions {
        error_on_nilable_map_read: config.error_on_nilable_map_read,
        experimental_anonymous_func: config.experimental_anonymous_func,
        ..BackpropOptions::default()
    };
    let mut local_triggers: Vec<FullTrigger> = Vec::new();
    for func in pkg.functions() {
        if func.body.is_none() {
            continue;
        }
        match catch_unwind(AssertUnwindSafe(|| analyze_func(func, scope, &opts))) {
            Ok(Ok(triggers)) => local_triggers.extend(triggers),
            Ok(Err(e)) => errors.push(e.to_string()),
            Err(payload) => errors.push(format!(
                "internal panic analyzing `{}`: {}",
                func.id,
                panic_message(payload.as_ref())
            )),
        }
    }

    local_triggers.extend(affiliations(pkg, scope));
    if config.experimental_struct_init {
        local_triggers.extend(struct_init_triggers(pkg, scope));
    }

    // Declared contracts win; inference fills in the rest.
    let mut contracts = reader_out.contracts.clone();
    for func in pkg.functions() {
        if contracts.contains_key(&func.id) {
            continue;
        }
        let inferred = infer_contracts(func, scope);
        if !inferred.is_empty() {
            contracts.insert(func.id.clone(), inferred);
        }
    }
    let call_sites = collect_call_sites(pkg, &contracts);
    duplicate_contracted_triggers(&mut local_triggers, &contracts, &call_sites);

    // Solve over the whole import closure.
    let mut all_triggers = imported_triggers;
    all_triggers.extend(local_triggers.iter().map(FullTrigger::deep_copy));
    let solved = solve(&observed, &all_triggers);
    let diagnostics = report::render(&solved, config);

    // Export: the local annotation map refined by inference, plus the
    // local triggers, as an opaque versioned blob.
    let export_map = solved.inferred.export_over(&reader_out.map);
    let fact = match facts::encode(&PackageFact {
        pkg: pkg.path.clone(),
        map: export_map,
        triggers: local_triggers,
    }) {
        Ok(bytes) => bytes,
        Err(e) => {
            errors.push(e.to_string());
            Vec::new()
        }
    };

    debug!(
        pkg = %pkg.path,
        diagnostics = diagnostics.len(),
        errors = errors.len(),
        "package analysis complete"
    );
    PackageResult {
        diagnostics,
        errors,
        fact,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_package_yields_clean_result() {
        let pkg = Package {
            path: "empty".into(),
            files: vec![],
        };
        let mut scope = Scope::new();
        scope.add_package(&pkg);
        let result = analyze_package(&pkg, &scope, &[], &AnalyzerConfig::default());
        assert!(result.diagnostics.is_empty());
        assert!(result.errors.is_empty());
        let fact = facts::decode(&result.fact).unwrap();
        assert_eq!(fact.pkg, "empty");
    }

    #[test]
    fn out_of_scope_package_exports_an_empty_map() {
        let pkg = Package {
            path: "vendor/dep".into(),
            files: vec![],
        };
        let scope = Scope::new();
        let config = AnalyzerConfig::new().with_exclude("vendor/");
        let result = analyze_package(&pkg, &scope, &[], &config);
        assert!(result.diagnostics.is_empty());
        let fact = facts::decode(&result.fact).unwrap();
        assert!(fact.map.is_empty());
        assert!(fact.triggers.is_empty());
    }

    #[test]
    fn corrupted_imported_fact_is_an_error_not_a_crash() {
        let pkg = Package {
            path: "app".into(),
            files: vec![],
        };
        let mut scope = Scope::new();
        scope.add_package(&pkg);
        let result = analyze_package(
            &pkg,
            &scope,
            &[vec![0xde, 0xad, 0xbe, 0xef]],
            &AnalyzerConfig::default(),
        );
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("magic"));
    }
}
