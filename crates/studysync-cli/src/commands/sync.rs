use std::sync::Arc;

use studysync_core::models::SyncConflict;
use studysync_core::sync::{CancelHandle, CancelSignal, SyncSummary};
use studysync_core::{SyncEngine, SyncReport};
use tokio::sync::watch;

use crate::cli::SyncCommands;
use crate::commands::common::{
    build_query, format_sync_conflict_lines, format_sync_report, source_key,
    sync_conflict_to_item, SyncConflictItem, Workspace,
};
use crate::error::CliError;

pub async fn run_sync_command(
    source: Option<String>,
    command: Option<SyncCommands>,
    workspace: &Workspace,
) -> Result<(), CliError> {
    match command {
        None => run_sync(workspace, source.as_deref()).await,
        Some(SyncCommands::Conflicts { limit, json }) => {
            run_sync_conflicts(workspace, limit, json).await
        }
        Some(SyncCommands::Watch) => run_sync_watch(workspace).await,
        Some(SyncCommands::Purge { source, filters }) => {
            let purged = purge_remote(workspace, &source, &filters).await?;
            println!("Purged {purged} document(s) from '{source}'");
            Ok(())
        }
    }
}

pub async fn run_sync(workspace: &Workspace, source: Option<&str>) -> Result<(), CliError> {
    let reports = sync_sources(workspace, source).await?;
    for report in &reports.reports {
        println!("{}", format_sync_report(report));
    }
    for (source, error) in &reports.failures {
        eprintln!("{source}: {error}");
    }
    if !reports.failures.is_empty() {
        return Err(CliError::SyncFailed(reports.failures.len()));
    }
    if reports.retry_needed() {
        println!("Some changes are still queued; run `studysync sync` again once the backend is reachable.");
    } else {
        println!("Sync completed");
    }
    Ok(())
}

/// One cycle for one source, or for every source
pub async fn sync_sources(
    workspace: &Workspace,
    source: Option<&str>,
) -> Result<SyncSummary, CliError> {
    workspace.require_backend()?;
    let cancel = CancelSignal::never();
    match source {
        Some(source) => {
            let report: SyncReport = workspace
                .registry
                .sync_source(&source_key(source)?, &cancel)
                .await?;
            Ok(SyncSummary {
                reports: vec![report],
                failures: Vec::new(),
            })
        }
        None => Ok(workspace.registry.sync_all(&cancel).await?),
    }
}

pub async fn list_sync_conflicts(
    workspace: &Workspace,
    limit: usize,
) -> Result<Vec<SyncConflict>, CliError> {
    Ok(workspace.registry.conflicts().list(limit).await?)
}

pub async fn run_sync_conflicts(
    workspace: &Workspace,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = list_sync_conflicts(workspace, limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

/// Run the engine with live updates until Ctrl-C or a fatal local error
pub async fn run_sync_watch(workspace: &Workspace) -> Result<(), CliError> {
    workspace.require_backend()?;
    let (_online_tx, online_rx) = watch::channel(true);
    let engine = SyncEngine::start(
        Arc::clone(&workspace.registry),
        &workspace.engine,
        online_rx,
        true,
    );
    let mut status = engine.status();
    println!("Watching for changes (Ctrl-C to stop)");

    let interrupt = CancelHandle::new();
    let mut interrupted = interrupt.signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    loop {
        tokio::select! {
            () = interrupted.cancelled() => break,
            () = engine.stopped() => {
                tracing::error!("sync engine stopped after a local storage failure");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("status: {}", *status.borrow_and_update());
            }
        }
    }

    let failed = engine.is_stopped() && !interrupted.is_cancelled();
    engine.shutdown().await;
    if failed {
        return Err(CliError::SyncFailed(1));
    }
    Ok(())
}

pub async fn purge_remote(
    workspace: &Workspace,
    source: &str,
    filters: &[String],
) -> Result<usize, CliError> {
    workspace.require_backend()?;
    if filters.is_empty() {
        return Err(CliError::UnfilteredPurge);
    }
    let query = build_query(filters, None)?;
    Ok(workspace.coordinator(source)?.purge_remote(&query).await?)
}
