use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use clap::CommandFactory;
use pretty_assertions::assert_eq;
use serde_json::json;
use studysync_core::catalog::{HOMEWORKS, SETTINGS};
use studysync_core::models::{Document, SyncConflict};
use studysync_core::remote::{FailureKind, MemoryBackend};
use studysync_core::{BackendConfig, EngineConfig, SourceSyncKey};

use crate::cli::{Cli, CompletionShell};
use crate::commands::common::{
    build_query, format_sync_conflict_lines, format_sync_report, open_database,
    parse_document_json, resolve_profile_from, RemoteMode, Workspace,
};
use crate::commands::completions::render_completions;
use crate::commands::config::{apply_profile_init, missing_fields, ProfileValues, ProfileView};
use crate::commands::doc::{delete_documents, get_document, list_documents, put_document};
use crate::commands::queue::{
    clear_queue, discard_parked, parked_changes, parse_change_id, pending_changes, retry_parked,
};
use crate::commands::sources::source_items;
use crate::commands::sync::{list_sync_conflicts, purge_remote, sync_sources};
use crate::config_profiles::{CliProfile, CliProfilesConfig, LOCAL_USER};
use crate::error::CliError;

const USER: &str = "user-1";

async fn workspace(remote: RemoteMode) -> (tempfile::TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    let service = open_database(&dir.path().join("data").join("studysync.db"))
        .await
        .unwrap();
    let workspace = Workspace::with_remote(service, USER, EngineConfig::default(), remote).unwrap();
    (dir, workspace)
}

fn homeworks() -> SourceSyncKey {
    SourceSyncKey::new(HOMEWORKS).unwrap()
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn document_json_must_be_an_object() {
    assert_eq!(
        parse_document_json(r#" {"title": "Essay"} "#).unwrap(),
        json!({"title": "Essay"})
    );
    assert!(matches!(
        parse_document_json("[1, 2]"),
        Err(CliError::InvalidDocument(_))
    ));
    assert!(matches!(
        parse_document_json("{not json"),
        Err(CliError::InvalidDocument(_))
    ));
}

#[test]
fn build_query_parses_typed_filters() {
    let query = build_query(
        &["subject_id=math".to_string(), "done=false".to_string()],
        Some(5),
    )
    .unwrap();
    assert_eq!(query.filters.len(), 2);
    assert_eq!(query.filters[0].value, json!("math"));
    assert_eq!(query.filters[1].value, json!(false));
    assert_eq!(query.limit, Some(5));

    assert!(build_query(&["no-equals-sign".to_string()], None).is_err());
    assert!(build_query(&["bad field=1".to_string()], None).is_err());
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("studysync"));
    assert!(script.contains("queue"));
}

#[test]
fn conflict_lines_show_strategy_and_document() {
    let conflicts = vec![SyncConflict {
        id: 1,
        source_key: "homeworks".into(),
        document_id: "hw-1".into(),
        local_updated_at: 150,
        incoming_updated_at: 200,
        resolved_at: 1_700_000_000_000,
        strategy: "remote_wins".into(),
    }];
    let lines = format_sync_conflict_lines(&conflicts);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("2023-11-14 22:13:20 UTC"));
    assert!(lines[0].contains("remote_wins"));
    assert!(lines[0].contains("homeworks/hw-1"));
    assert!(lines[0].contains("local=150 incoming=200"));
}

#[test]
fn profile_env_backend_overrides_stored_profile() {
    let mut config = CliProfilesConfig {
        active_profile: Some("work".into()),
        ..CliProfilesConfig::default()
    };
    config.profiles.insert(
        "work".into(),
        CliProfile {
            api_url: Some("https://stored.example.com".into()),
            api_key: Some("stored".into()),
            user_id: Some("stored-user".into()),
            ..CliProfile::default()
        },
    );

    let stored = resolve_profile_from(&config, Some("work"), None, None).unwrap();
    assert_eq!(stored.name, "work");
    assert_eq!(stored.user_id, "stored-user");
    assert_eq!(
        stored.backend.unwrap().base_url,
        "https://stored.example.com"
    );

    let env_backend = BackendConfig::new("https://env.example.com", "env-key").unwrap();
    let overridden =
        resolve_profile_from(&config, Some("work"), Some(env_backend), Some("env-user".into()))
            .unwrap();
    assert_eq!(overridden.user_id, "env-user");
    assert_eq!(overridden.backend.unwrap().base_url, "https://env.example.com");

    let empty = resolve_profile_from(&CliProfilesConfig::default(), Some("none"), None, None)
        .unwrap();
    assert_eq!(empty.user_id, LOCAL_USER);
    assert!(empty.backend.is_none());
}

#[test]
fn config_init_prefers_explicit_then_env_then_stored() {
    let mut config = CliProfilesConfig::default();
    config.profiles.insert(
        "default".into(),
        CliProfile {
            api_url: Some("https://stored.example.com".into()),
            api_key: Some("stored-key".into()),
            user_id: Some("stored-user".into()),
            ..CliProfile::default()
        },
    );
    let env: HashMap<&str, &str> = HashMap::from([("STUDYSYNC_API_KEY", "env-key")]);

    apply_profile_init(
        &mut config,
        "default",
        ProfileValues {
            api_url: Some(" https://explicit.example.com ".into()),
            ..ProfileValues::default()
        },
        |key| env.get(key).map(|value| (*value).to_string()),
    )
    .unwrap();

    let profile = config.profile("default").unwrap();
    assert_eq!(profile.api_url.as_deref(), Some("https://explicit.example.com"));
    assert_eq!(profile.api_key.as_deref(), Some("env-key"));
    assert_eq!(profile.user_id.as_deref(), Some("stored-user"));
    assert!(missing_fields(profile).is_empty());

    let rejected = apply_profile_init(
        &mut config,
        "default",
        ProfileValues {
            realtime_url: Some("https://not-a-socket.example.com".into()),
            ..ProfileValues::default()
        },
        |_| None,
    );
    assert!(matches!(rejected, Err(CliError::Config(_))));
}

#[test]
fn profile_view_redacts_secrets() {
    let profile = CliProfile {
        api_url: Some("https://api.example.com".into()),
        api_key: Some("secret-key".into()),
        ..CliProfile::default()
    };
    let view = ProfileView::new("default", true, &profile);
    let rendered = view.lines().join("\n");
    assert!(rendered.contains("(active)"));
    assert!(rendered.contains("[REDACTED]"));
    assert!(!rendered.contains("secret-key"));
    assert!(rendered.contains(&format!("user_id:      {LOCAL_USER}")));
    assert_eq!(
        missing_fields(&CliProfile::default()),
        vec!["api_url", "api_key"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn documents_round_trip_through_local_replica() {
    let (_dir, workspace) = workspace(RemoteMode::Detached).await;

    let essay = put_document(
        &workspace,
        HOMEWORKS,
        Some("hw-1"),
        r#"{"title": "Essay", "subject_id": "lit"}"#,
    )
    .await
    .unwrap();
    assert_eq!(essay.id, "hw-1");
    let generated = put_document(&workspace, HOMEWORKS, None, r#"{"subject_id": "math"}"#)
        .await
        .unwrap();
    assert!(!generated.id.is_empty());

    let fetched = get_document(&workspace, HOMEWORKS, Some("hw-1")).await.unwrap();
    assert_eq!(fetched.payload["title"], json!("Essay"));

    let math = list_documents(&workspace, HOMEWORKS, &["subject_id=math".into()], None)
        .await
        .unwrap();
    assert_eq!(math.len(), 1);
    assert_eq!(math[0].id, generated.id);

    let removed = delete_documents(&workspace, HOMEWORKS, &["hw-1".into(), "missing".into()])
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(matches!(
        get_document(&workspace, HOMEWORKS, Some("hw-1")).await,
        Err(CliError::DocumentNotFound { .. })
    ));

    // the delete of an unknown id is queued too
    let pending = pending_changes(&workspace, None).await.unwrap();
    assert_eq!(pending.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_document_sources_are_keyed_by_user() {
    let (_dir, workspace) = workspace(RemoteMode::Detached).await;

    let saved = put_document(&workspace, SETTINGS, None, r#"{"theme": "dark"}"#)
        .await
        .unwrap();
    assert_eq!(saved.id, USER);
    assert_eq!(
        get_document(&workspace, SETTINGS, None).await.unwrap().payload,
        json!({"theme": "dark"})
    );
    assert!(matches!(
        put_document(&workspace, SETTINGS, Some("other"), "{}").await,
        Err(CliError::SingleDocumentId(_))
    ));
    assert!(matches!(
        get_document(&workspace, HOMEWORKS, None).await,
        Err(CliError::EmptyDocumentId)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_source_is_reported() {
    let (_dir, workspace) = workspace(RemoteMode::Detached).await;
    let error = put_document(&workspace, "notes", None, "{}").await.unwrap_err();
    assert!(matches!(
        error,
        CliError::Core(studysync_core::Error::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_commands_need_a_backend() {
    let (_dir, workspace) = workspace(RemoteMode::Detached).await;
    assert!(matches!(
        sync_sources(&workspace, None).await,
        Err(CliError::SyncNotConfigured)
    ));
    assert!(matches!(
        purge_remote(&workspace, HOMEWORKS, &["subject_id=math".into()]).await,
        Err(CliError::SyncNotConfigured)
    ));
    assert!(list_sync_conflicts(&workspace, 10).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_pushes_queue_and_pulls_remote_documents() {
    let backend = MemoryBackend::new();
    let (_dir, workspace) = workspace(RemoteMode::Memory(Arc::clone(&backend))).await;
    backend.put(
        &homeworks(),
        USER,
        Document::new("remote-hw", 10, json!({"title": "From phone"})).unwrap(),
    );
    put_document(&workspace, HOMEWORKS, Some("local-hw"), r#"{"title": "Essay"}"#)
        .await
        .unwrap();

    let summary = sync_sources(&workspace, Some(HOMEWORKS)).await.unwrap();
    assert_eq!(summary.reports.len(), 1);
    let report = &summary.reports[0];
    assert_eq!(report.pushed, 1);
    assert_eq!(report.diff.unwrap().fetched, 1);
    assert!(format_sync_report(report).starts_with("homeworks: pushed 1"));

    assert!(backend.document(&homeworks(), USER, "local-hw").is_some());
    assert!(get_document(&workspace, HOMEWORKS, Some("remote-hw")).await.is_ok());

    let items = source_items(&workspace).await.unwrap();
    let homework_item = items
        .iter()
        .find(|item| item.source == HOMEWORKS)
        .unwrap();
    assert_eq!(homework_item.documents, 2);
    assert_eq!(homework_item.pending, 0);
    assert_eq!(homework_item.kind, "multiple");

    let all = sync_sources(&workspace, None).await.unwrap();
    assert!(all.failures.is_empty());
    assert_eq!(all.reports.len(), items.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn parked_changes_can_be_retried_or_discarded() {
    let backend = MemoryBackend::new();
    let (_dir, workspace) = workspace(RemoteMode::Memory(Arc::clone(&backend))).await;
    backend.fail_document("bad-1", FailureKind::Validation);
    backend.fail_document("bad-2", FailureKind::Validation);
    for id in ["bad-1", "bad-2"] {
        put_document(&workspace, HOMEWORKS, Some(id), "{}").await.unwrap();
    }

    let summary = sync_sources(&workspace, Some(HOMEWORKS)).await.unwrap();
    assert_eq!(summary.reports[0].parked, 2);
    let parked = parked_changes(&workspace, Some(HOMEWORKS)).await.unwrap();
    let ids: BTreeMap<String, String> = parked
        .iter()
        .map(|entry| (entry.change.document_id.clone(), entry.change.id.to_string()))
        .collect();
    assert_eq!(ids.len(), 2);

    backend.clear_failures();
    let requeued = retry_parked(&workspace, &ids["bad-1"]).await.unwrap();
    assert_eq!(requeued.document_id, "bad-1");
    discard_parked(&workspace, &ids["bad-2"]).await.unwrap();
    assert!(discard_parked(&workspace, &ids["bad-2"]).await.is_err());
    assert!(matches!(
        retry_parked(&workspace, "not-a-uuid").await,
        Err(CliError::InvalidChangeId(_))
    ));

    sync_sources(&workspace, Some(HOMEWORKS)).await.unwrap();
    assert!(backend.document(&homeworks(), USER, "bad-1").is_some());
    assert!(backend.document(&homeworks(), USER, "bad-2").is_none());
    assert!(parked_changes(&workspace, None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn clearing_queue_keeps_local_documents() {
    let (_dir, workspace) = workspace(RemoteMode::Detached).await;
    put_document(&workspace, HOMEWORKS, Some("hw-1"), "{}").await.unwrap();
    put_document(&workspace, HOMEWORKS, Some("hw-2"), "{}").await.unwrap();

    assert_eq!(clear_queue(&workspace, HOMEWORKS).await.unwrap(), 2);
    assert!(pending_changes(&workspace, Some(HOMEWORKS)).await.unwrap().is_empty());
    assert_eq!(
        list_documents(&workspace, HOMEWORKS, &[], None).await.unwrap().len(),
        2
    );
    assert!(clear_queue(&workspace, "notes").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn purge_removes_matching_documents_everywhere() {
    let backend = MemoryBackend::new();
    let (_dir, workspace) = workspace(RemoteMode::Memory(Arc::clone(&backend))).await;
    put_document(&workspace, HOMEWORKS, Some("a"), r#"{"subject_id": "math"}"#)
        .await
        .unwrap();
    put_document(&workspace, HOMEWORKS, Some("b"), r#"{"subject_id": "art"}"#)
        .await
        .unwrap();
    sync_sources(&workspace, Some(HOMEWORKS)).await.unwrap();

    assert!(matches!(
        purge_remote(&workspace, HOMEWORKS, &[]).await,
        Err(CliError::UnfilteredPurge)
    ));
    let purged = purge_remote(&workspace, HOMEWORKS, &["subject_id=math".into()])
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(backend.document(&homeworks(), USER, "a").is_none());
    let left = list_documents(&workspace, HOMEWORKS, &[], None).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, "b");
}

#[test]
fn change_ids_must_be_uuids() {
    assert!(parse_change_id("0190b7f2-3c1d-7a4e-9f00-123456789abc").is_ok());
    assert!(parse_change_id("hw-1").is_err());
}
