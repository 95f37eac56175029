//! Diagnostic assembly and rendering.
//!
//! Every diagnostic carries the consumer position as its primary
//! location, the producer position as a related location, and a prose
//! chain assembled from the two prestrings plus the ordered assignment
//! trail.

use crate::config::AnalyzerConfig;
use colored::Colorize;
use indexmap::IndexMap;
use nilgazer_core::Assignment;
use nilgazer_hir::Pos;
use nilgazer_infer::{Conflict, DirectFailure, ExplainedBool, SolveResult};
use serde::{Deserialize, Serialize};

/// One user-facing diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Primary location: where the value is required non-nil.
    pub pos: Pos,
    /// Related location: where the value may become nil.
    pub related: Option<Pos>,
    pub message: String,
    /// Consumption category ("dereferenced", "passed", ...).
    pub category: String,
}

/// Shortens a path to its trailing components; 0 keeps the full path.
fn trim_path(file: &str, levels: usize) -> String {
    if levels == 0 {
        return file.to_string();
    }
    let parts: Vec<&str> = file.split('/').collect();
    if parts.len() <= levels {
        file.to_string()
    } else {
        parts[parts.len() - levels..].join("/")
    }
}

fn show_pos(pos: &Pos, config: &AnalyzerConfig) -> String {
    format!(
        "{}:{}:{}",
        trim_path(&pos.file, config.dir_levels_to_print_for_triggers),
        pos.line,
        pos.column
    )
}

fn trail_lines(trail: &[Assignment], config: &AnalyzerConfig, out: &mut String) {
    if trail.is_empty() {
        return;
    }
    out.push_str(",\n       via the assignment(s):");
    for entry in trail {
        out.push_str(&format!(
            "\n         - `{}` to `{}` at {}",
            entry.rhs,
            entry.lhs,
            show_pos(&entry.pos, config)
        ));
    }
}

/// Assembles the diagnostics for one solve.
pub fn render(result: &SolveResult, config: &AnalyzerConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for failure in &result.failures {
        diagnostics.push(render_failure(failure, config));
    }
    if config.group_error_messages {
        let mut groups: IndexMap<String, Vec<&Conflict>> = IndexMap::new();
        for conflict in &result.conflicts {
            groups
                .entry(conflict.site.to_string())
                .or_default()
                .push(conflict);
        }
        for (site, conflicts) in groups {
            diagnostics.push(render_conflict_group(&site, &conflicts, config));
        }
    } else {
        for conflict in &result.conflicts {
            diagnostics.push(render_conflict(conflict, config));
        }
    }
    diagnostics
}

fn render_failure(failure: &DirectFailure, config: &AnalyzerConfig) -> Diagnostic {
    let mut message = format!("nil value, {}", failure.category);
    message.push_str(&format!(
        "\n  found at {}: {}",
        show_pos(&failure.consumer_pos, config),
        failure.producer_desc
    ));
    trail_lines(&failure.trail, config, &mut message);
    if failure.guard_missing {
        message.push_str("\n  note: the value is only safe behind its ok check, which this path never consults");
    }
    Diagnostic {
        pos: failure.consumer_pos.clone(),
        related: Some(failure.producer_pos.clone()),
        message,
        category: failure.category.clone(),
    }
}

/// The nilable and non-nil halves of a conflict, in that order.
fn split(conflict: &Conflict) -> (&ExplainedBool, &ExplainedBool) {
    if conflict.first.value() {
        (&conflict.first, &conflict.second)
    } else {
        (&conflict.second, &conflict.first)
    }
}

fn describe_side(side: &ExplainedBool, config: &AnalyzerConfig, out: &mut String) {
    for link in side.chain() {
        match link {
            ExplainedBool::TrueBecauseAnnotation { site }
            | ExplainedBool::FalseBecauseAnnotation { site } => {
                out.push_str(&format!("\n       - {link} ({site})"));
            }
            _ => {
                if let Some(cause) = link.cause() {
                    out.push_str(&format!(
                        "\n       - {} at {}",
                        cause.producer_desc,
                        show_pos(&cause.producer_pos, config)
                    ));
                    trail_lines(&cause.trail, config, out);
                }
            }
        }
    }
}

fn render_conflict(conflict: &Conflict, config: &AnalyzerConfig) -> Diagnostic {
    let (nilable, nonnil) = split(conflict);
    let category = nonnil
        .cause()
        .map(|c| c.consumer_desc.clone())
        .unwrap_or_else(|| "required non-nil".to_string());
    let primary = nonnil
        .cause()
        .map(|c| c.consumer_pos.clone())
        .unwrap_or_default();
    let related = nilable.cause().map(|c| c.producer_pos.clone());

    let mut message = format!("nilable value, {category} ({})", conflict.site);
    message.push_str("\n  may be nil because:");
    describe_side(nilable, config, &mut message);
    message.push_str("\n  required non-nil because:");
    describe_side(nonnil, config, &mut message);

    Diagnostic {
        pos: primary,
        related,
        message,
        category,
    }
}

fn render_conflict_group(
    site: &str,
    conflicts: &[&Conflict],
    config: &AnalyzerConfig,
) -> Diagnostic {
    let mut message = format!(
        "nilable value flows into `{site}` in {} conflicting way(s)",
        conflicts.len()
    );
    let mut primary = Pos::default();
    let mut related = None;
    let mut category = "required non-nil".to_string();
    for (i, conflict) in conflicts.iter().enumerate() {
        let single = render_conflict(conflict, config);
        if i == 0 {
            primary = single.pos;
            related = single.related;
            category = single.category;
        }
        message.push_str(&format!("\n  [{0}] ", i + 1));
        message.push_str(&single.message.replace('\n', "\n  "));
    }
    Diagnostic {
        pos: primary,
        related,
        message,
        category,
    }
}

/// Renders one diagnostic for terminal output; honors `pretty_print`.
pub fn format_diagnostic(diag: &Diagnostic, config: &AnalyzerConfig) -> String {
    let location = show_pos(&diag.pos, config);
    if config.pretty_print {
        format!("{}: {} [{}]", "error".red().bold(), diag.message, location)
    } else {
        format!("error: {} [{location}]", diag.message)
    }
}
