use serde::Serialize;

use crate::commands::common::Workspace;
use crate::error::CliError;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SourceItem {
    pub source: String,
    pub kind: String,
    pub documents: usize,
    pub pending: usize,
}

pub async fn source_items(workspace: &Workspace) -> Result<Vec<SourceItem>, CliError> {
    let mut items = Vec::new();
    for (source, kind) in workspace.registry.sources() {
        let coordinator = workspace.registry.get(source)?;
        items.push(SourceItem {
            source: source.to_string(),
            kind: kind.to_string(),
            documents: coordinator.metadata().await?.len(),
            pending: coordinator.pending_count().await?,
        });
    }
    Ok(items)
}

pub async fn run_sources(workspace: &Workspace, as_json: bool) -> Result<(), CliError> {
    let items = source_items(workspace).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    for item in &items {
        println!(
            "{:<18}  {:<8}  documents={:<5} pending={}",
            item.source, item.kind, item.documents, item.pending
        );
    }
    Ok(())
}
