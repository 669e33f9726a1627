//! Output formatters for run outcomes and comparison reports.

use bpsync_core::{CompareReport, SyncOutcome};
use clap::ValueEnum;
use comfy_table::{Cell, Table};
use serde::Serialize;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables
    Text,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Format a sync outcome. `examples` bounds the error listing per category.
pub fn format_outcome(outcome: &SyncOutcome, format: OutputFormat, examples: usize) -> String {
    if format == OutputFormat::Json {
        return to_json(outcome);
    }

    let mut table = Table::new();
    table.set_header(vec!["Kind", "Created", "Updated", "Skipped", "Failed"]);
    for (kind, counts) in &outcome.counts {
        table.add_row(vec![
            Cell::new(kind.plural()),
            Cell::new(counts.created),
            Cell::new(counts.updated),
            Cell::new(counts.skipped),
            Cell::new(counts.failed),
        ]);
    }
    let totals = outcome.totals();
    table.add_row(vec![
        Cell::new("total"),
        Cell::new(totals.created),
        Cell::new(totals.updated),
        Cell::new(totals.skipped),
        Cell::new(totals.failed),
    ]);

    let mut output = String::new();
    if outcome.dry_run {
        output.push_str("Dry run, nothing was written.\n\n");
    }
    output.push_str(&table.to_string());

    if let Some(plan) = &outcome.plan {
        output.push_str("\n\nSchema plan:\n");
        for (idx, level) in plan.levels.iter().enumerate() {
            output.push_str(&format!("  level {}: {}\n", idx, level.join(", ")));
        }
        if !plan.cyclic.is_empty() {
            output.push_str(&format!("  cyclic: {}\n", plan.cyclic.join(", ")));
        }
        if !plan.system.is_empty() {
            output.push_str(&format!("  system: {}\n", plan.system.join(", ")));
        }
    }

    if outcome.has_errors() {
        let errors = outcome.error_collector();
        output.push_str("\n\n");
        output.push_str(&errors.summary(examples));
        let retryable = errors.retryable().len();
        if retryable > 0 {
            output.push_str(&format!(
                "{} of {} failure(s) may succeed on retry.",
                retryable,
                errors.len()
            ));
        }
    }
    if outcome.cancelled {
        output.push_str("\n\nRun was cancelled before completion.");
    }
    output
}

/// Format a comparison report. `verbose` lists every differing resource.
pub fn format_report(report: &CompareReport, format: OutputFormat, verbose: bool) -> String {
    if format == OutputFormat::Json {
        return to_json(report);
    }

    let mut output = format!(
        "Comparing {} -> {} at {}\n\n",
        report.source, report.target, report.timestamp
    );

    let mut table = Table::new();
    table.set_header(vec!["Kind", "Added", "Modified", "Removed"]);
    for (kind, diff) in &report.kinds {
        table.add_row(vec![
            Cell::new(kind.plural()),
            Cell::new(diff.summary.added),
            Cell::new(diff.summary.modified),
            Cell::new(diff.summary.removed),
        ]);
    }
    output.push_str(&table.to_string());

    if report.identical {
        output.push_str("\n\nSnapshots are identical.");
        return output;
    }

    for (kind, diff) in &report.kinds {
        if diff.summary.is_empty() {
            continue;
        }
        output.push_str(&format!("\n\n{}:", kind.plural()));
        for change in &diff.added {
            output.push_str(&format!("\n  + {}", change.identifier));
        }
        for change in &diff.removed {
            output.push_str(&format!("\n  - {}", change.identifier));
        }
        for change in &diff.modified {
            output.push_str(&format!("\n  ~ {}", change.identifier));
            if verbose {
                for field in &change.fields {
                    output.push_str(&format!("\n      {}", field.path));
                }
            }
        }
    }
    output
}
