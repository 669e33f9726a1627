//! Subcommand handlers.

use crate::formatter::{self, OutputFormat};
use crate::{SyncFiles, SyncFlags};
use bpsync_core::{
    EngineConfig, MemoryBackend, ResourceKind, Snapshot, SyncEngine, SyncOptions, SyncOutcome,
};
use std::collections::BTreeSet;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl From<&SyncFlags> for EngineConfig {
    fn from(flags: &SyncFlags) -> Self {
        EngineConfig::default()
            .with_schema_concurrency(flags.schema_concurrency)
            .with_record_concurrency(flags.record_concurrency)
    }
}

impl From<&SyncFlags> for SyncOptions {
    fn from(flags: &SyncFlags) -> Self {
        SyncOptions::default()
            .with_kinds(flags.include.iter().copied())
            .with_skip_records(flags.skip_entities)
    }
}

/// Read a snapshot file.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, Box<dyn Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let snapshot: Snapshot = serde_json::from_str(&content)
        .map_err(|e| format!("invalid snapshot {}: {}", path.display(), e))?;
    Ok(snapshot)
}

/// Write a snapshot file.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), Box<dyn Error>> {
    let content = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Target backend seeded with the current state, if any.
fn seeded_target(files: &SyncFiles) -> Result<Arc<MemoryBackend>, Box<dyn Error>> {
    let target = MemoryBackend::with_builtin_schemas();
    if let Some(current) = &files.current {
        target.seed(&load_snapshot(current)?);
    }
    Ok(Arc::new(target))
}

/// Cancel on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight operations");
            token.cancel();
        }
    });
    cancel
}

async fn run_import(
    files: &SyncFiles,
    flags: &SyncFlags,
    dry_run: bool,
) -> Result<(Arc<MemoryBackend>, SyncOutcome), Box<dyn Error>> {
    let desired = load_snapshot(&files.desired)?;
    let target = seeded_target(files)?;
    let options = SyncOptions::from(flags).with_dry_run(dry_run);

    let engine = SyncEngine::new(target.clone(), EngineConfig::from(flags))
        .with_cancellation(interrupt_token());
    let outcome = engine.import(&desired, &options).await?;
    Ok((target, outcome))
}

/// `bpsync plan`
pub async fn plan(files: &SyncFiles, flags: &SyncFlags, format: OutputFormat) -> Result<(), Box<dyn Error>> {
    let (_, outcome) = run_import(files, flags, true).await?;
    println!("{}", formatter::format_outcome(&outcome, format, 0));
    Ok(())
}

/// `bpsync apply`
pub async fn apply(
    files: &SyncFiles,
    flags: &SyncFlags,
    output: Option<&Path>,
    format: OutputFormat,
    verbose: bool,
) -> Result<(), Box<dyn Error>> {
    let (target, outcome) = run_import(files, flags, false).await?;

    if let Some(path) = output {
        save_snapshot(path, &target.snapshot())?;
        info!(path = %path.display(), "wrote resulting state");
    }

    let examples = if verbose {
        outcome.errors.len()
    } else {
        EngineConfig::from(flags).error_examples
    };
    println!("{}", formatter::format_outcome(&outcome, format, examples));

    if outcome.cancelled {
        return Err("run cancelled".into());
    }
    if outcome.has_errors() {
        return Err(format!("{} operation(s) failed", outcome.errors.len()).into());
    }
    Ok(())
}

/// `bpsync compare`
pub fn compare(
    source: &Path,
    target: &Path,
    include: &[ResourceKind],
    fail_on_diff: bool,
    format: OutputFormat,
    verbose: bool,
) -> Result<(), Box<dyn Error>> {
    let source_snapshot = load_snapshot(source)?;
    let target_snapshot = load_snapshot(target)?;
    let kinds: BTreeSet<ResourceKind> = include.iter().copied().collect();

    let report = bpsync_core::compare(
        &source.display().to_string(),
        &source_snapshot,
        &target.display().to_string(),
        &target_snapshot,
        &kinds,
    );
    println!("{}", formatter::format_report(&report, format, verbose));

    if fail_on_diff && !report.identical {
        return Err("snapshots differ".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> SyncFlags {
        SyncFlags {
            include: vec![ResourceKind::Blueprint, ResourceKind::Team],
            skip_entities: true,
            schema_concurrency: 2,
            record_concurrency: 7,
        }
    }

    #[test]
    fn test_flags_into_config() {
        let config = EngineConfig::from(&flags());
        assert_eq!(config.concurrency.schemas, 2);
        assert_eq!(config.concurrency.records, 7);
    }

    #[test]
    fn test_flags_into_options() {
        let options = SyncOptions::from(&flags());
        assert!(options.includes(ResourceKind::Team));
        assert!(!options.includes(ResourceKind::Page));
        assert!(!options.includes(ResourceKind::Entity));
        assert!(!options.dry_run);
    }
}
