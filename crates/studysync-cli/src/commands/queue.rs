use studysync_core::models::{ChangeId, ParkedChange};
use studysync_core::{OfflineChange, SourceSyncKey};

use crate::cli::QueueCommands;
use crate::commands::common::{
    change_to_item, format_change_lines, format_parked_lines, parked_to_item, source_key,
    Workspace,
};
use crate::error::CliError;

pub async fn run_queue(command: QueueCommands, workspace: &Workspace) -> Result<(), CliError> {
    match command {
        QueueCommands::List { source, json } => {
            let changes = pending_changes(workspace, source.as_deref()).await?;
            if json {
                let items: Vec<_> = changes.iter().map(change_to_item).collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if changes.is_empty() {
                println!("No pending changes.");
            } else {
                for line in format_change_lines(&changes) {
                    println!("{line}");
                }
            }
        }
        QueueCommands::Parked { source, json } => {
            let parked = parked_changes(workspace, source.as_deref()).await?;
            if json {
                let items: Vec<_> = parked.iter().map(parked_to_item).collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if parked.is_empty() {
                println!("No parked changes.");
            } else {
                for line in format_parked_lines(&parked) {
                    println!("{line}");
                }
            }
        }
        QueueCommands::Retry { id } => {
            let change = retry_parked(workspace, &id).await?;
            println!(
                "Requeued {} for {}/{}",
                change.id, change.source_key, change.document_id
            );
        }
        QueueCommands::Discard { id } => {
            discard_parked(workspace, &id).await?;
            println!("Discarded parked change {id}");
        }
        QueueCommands::Clear { source } => {
            let cleared = clear_queue(workspace, &source).await?;
            println!("Dropped {cleared} pending change(s) for '{source}'");
        }
    }
    Ok(())
}

pub fn parse_change_id(raw: &str) -> Result<ChangeId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidChangeId(raw.to_string()))
}

/// Pending changes of one source, or of every source, in drain order
pub async fn pending_changes(
    workspace: &Workspace,
    source: Option<&str>,
) -> Result<Vec<OfflineChange>, CliError> {
    let queue = workspace.registry.queue();
    let sources: Vec<SourceSyncKey> = match source {
        Some(source) => vec![source_key(source)?],
        None => queue.sources().await?,
    };
    let mut changes = Vec::new();
    for source in &sources {
        changes.extend(queue.list_by_source(source).await?);
    }
    Ok(changes)
}

pub async fn parked_changes(
    workspace: &Workspace,
    source: Option<&str>,
) -> Result<Vec<ParkedChange>, CliError> {
    let source = source.map(source_key).transpose()?;
    Ok(workspace.registry.queue().list_parked(source.as_ref()).await?)
}

pub async fn retry_parked(workspace: &Workspace, id: &str) -> Result<OfflineChange, CliError> {
    Ok(workspace.registry.requeue_parked(&parse_change_id(id)?).await?)
}

pub async fn discard_parked(workspace: &Workspace, id: &str) -> Result<(), CliError> {
    if workspace
        .registry
        .queue()
        .discard_parked(&parse_change_id(id)?)
        .await?
    {
        Ok(())
    } else {
        Err(studysync_core::Error::NotFound(format!("parked change '{id}'")).into())
    }
}

pub async fn clear_queue(workspace: &Workspace, source: &str) -> Result<usize, CliError> {
    let key = source_key(source)?;
    workspace.registry.get(&key)?;
    Ok(workspace.registry.queue().clear_source(&key).await?)
}
