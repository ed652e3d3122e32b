use crate::cli::DocCommands;
use crate::commands::common::{
    build_query, document_to_item, format_document_lines, format_sync_timestamp,
    normalize_document_id, parse_document_json, source_key, Workspace,
};
use crate::error::CliError;
use studysync_core::sync::ResourceKind;
use studysync_core::Document;

pub async fn run_doc(command: DocCommands, workspace: &Workspace) -> Result<(), CliError> {
    match command {
        DocCommands::Put { source, id, json } => {
            let document = put_document(workspace, &source, id.as_deref(), &json).await?;
            println!(
                "Saved {}/{} at {} (queued for sync)",
                source,
                document.id,
                format_sync_timestamp(document.updated_at)
            );
        }
        DocCommands::Get { source, id } => {
            let document = get_document(workspace, &source, id.as_deref()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&document_to_item(&document))?
            );
        }
        DocCommands::List {
            source,
            filters,
            limit,
            json,
        } => {
            let documents = list_documents(workspace, &source, &filters, limit).await?;
            if json {
                let items: Vec<_> = documents.iter().map(document_to_item).collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if documents.is_empty() {
                println!("No documents in '{source}'.");
            } else {
                for line in format_document_lines(&documents) {
                    println!("{line}");
                }
            }
        }
        DocCommands::Delete { source, ids } => {
            let removed = delete_documents(workspace, &source, &ids).await?;
            println!("Deleted {removed} document(s) from '{source}'");
        }
    }
    Ok(())
}

/// Write a document locally and queue it. Single-document sources are keyed
/// by the signed-in user.
pub async fn put_document(
    workspace: &Workspace,
    source: &str,
    id: Option<&str>,
    raw_json: &str,
) -> Result<Document, CliError> {
    let payload = parse_document_json(raw_json)?;
    let key = source_key(source)?;
    let record = match workspace.kind(source)? {
        ResourceKind::Single => {
            if id.is_some() {
                return Err(CliError::SingleDocumentId(source.to_string()));
            }
            workspace
                .registry
                .single::<serde_json::Value>(&key)?
                .add_or_update(&payload)
                .await?
        }
        ResourceKind::Multiple => {
            let documents = workspace.registry.multiple::<serde_json::Value>(&key)?;
            match id {
                Some(id) => {
                    documents
                        .add_or_update(&normalize_document_id(id)?, &payload)
                        .await?
                }
                None => documents.insert(&payload).await?,
            }
        }
    };
    Ok(Document::new(record.id, record.updated_at, record.value)?)
}

pub async fn get_document(
    workspace: &Workspace,
    source: &str,
    id: Option<&str>,
) -> Result<Document, CliError> {
    let coordinator = workspace.coordinator(source)?;
    let id = match (workspace.kind(source)?, id) {
        (ResourceKind::Single, None) => coordinator.owner()?,
        (ResourceKind::Single, Some(_)) => {
            return Err(CliError::SingleDocumentId(source.to_string()))
        }
        (ResourceKind::Multiple, id) => normalize_document_id(id.unwrap_or_default())?,
    };
    coordinator
        .get(&id)
        .await?
        .ok_or_else(|| CliError::DocumentNotFound {
            source_key: source.to_string(),
            id,
        })
}

pub async fn list_documents(
    workspace: &Workspace,
    source: &str,
    filters: &[String],
    limit: Option<usize>,
) -> Result<Vec<Document>, CliError> {
    let query = build_query(filters, limit)?;
    Ok(workspace.coordinator(source)?.list(&query).await?)
}

pub async fn delete_documents(
    workspace: &Workspace,
    source: &str,
    ids: &[String],
) -> Result<usize, CliError> {
    let ids = ids
        .iter()
        .map(|id| normalize_document_id(id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(workspace.coordinator(source)?.remove(&ids).await?)
}
