//! REST client for the remote document API.
//!
//! Layout: `{base}/v1/collections/{collection}/documents[/{id}]`, every request
//! scoped with `owner_id` and authenticated with `apikey` plus a bearer token.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{RealtimeSubscription, RemoteStore, WebSocketRealtime};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::{Document, DocumentQuery, MetadataModel, SourceSyncKey};

const METADATA_PROJECTION: &str = "id,updated_at";
/// Characters of an error body kept in messages
const ERROR_BODY_EXCERPT: usize = 180;

/// `RemoteStore` over HTTP
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    config: Arc<BackendConfig>,
    source: SourceSyncKey,
    channel_capacity: usize,
}

impl HttpRemoteStore {
    pub fn new(
        config: Arc<BackendConfig>,
        source: SourceSyncKey,
        channel_capacity: usize,
    ) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(client, config, source, channel_capacity))
    }

    /// Share one connection pool between collections
    pub fn with_client(
        client: reqwest::Client,
        config: Arc<BackendConfig>,
        source: SourceSyncKey,
        channel_capacity: usize,
    ) -> Self {
        Self {
            client,
            config,
            source,
            channel_capacity,
        }
    }

    fn collection_url(&self) -> Result<Url> {
        let raw = format!(
            "{}/v1/collections/{}/documents",
            self.config.base_url.trim_end_matches('/'),
            self.source
        );
        Url::parse(&raw).map_err(|error| Error::InvalidInput(format!("invalid url '{raw}': {error}")))
    }

    fn document_url(&self, id: &str) -> Result<Url> {
        let mut url = self.collection_url()?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidInput(format!("cannot address document '{id}'")))?
            .push(id);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, owner: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(self.config.bearer_token())
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("owner_id", owner)])
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn write(&self, method: Method, url: Url, owner: &str, document: &Document) -> Result<Document> {
        tracing::debug!(
            source = %self.source,
            document = %document.id,
            "{method} remote document"
        );
        let response = self
            .send(self.request(method, url, owner).json(&document.to_wire()))
            .await?;
        let body = response.text().await.map_err(transport_error)?;
        Ok(parse_document_body(&body)?.unwrap_or_else(|| document.clone()))
    }
}

/// Map a request failure to the error taxonomy
fn transport_error(error: reqwest::Error) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        Error::TransientNetwork(error.to_string())
    } else {
        Error::Http(error)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn api_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed: String = body.trim().chars().take(ERROR_BODY_EXCERPT).collect();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

/// Map a non-success status to the error taxonomy
fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = api_error_message(status, body);
    match status.as_u16() {
        408 | 425 | 429 => Error::TransientNetwork(message),
        code if code >= 500 => Error::TransientNetwork(message),
        401 | 403 => Error::Permission(message),
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        _ => Error::Validation(message),
    }
}

/// Accepts an object, a one-element array, or an empty body
fn parse_document_body(body: &str) -> Result<Option<Document>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<serde_json::Value>(body)? {
        serde_json::Value::Array(items) => items.into_iter().next().map(Document::from_wire).transpose(),
        serde_json::Value::Null => Ok(None),
        value => Document::from_wire(value).map(Some),
    }
}

fn filter_params(query: &DocumentQuery) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = query
        .filters
        .iter()
        .map(|filter| {
            let value = match &filter.value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (filter.field.clone(), value)
        })
        .collect();
    if let Some(limit) = query.limit {
        params.push(("limit".into(), limit.to_string()));
    }
    if query.offset > 0 {
        params.push(("offset".into(), query.offset.to_string()));
    }
    params
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DeleteResponse {
    Count { deleted: usize },
    Rows(Vec<serde_json::Value>),
}

#[derive(Deserialize)]
struct MetadataRow {
    id: String,
    updated_at: i64,
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn source(&self) -> &SourceSyncKey {
        &self.source
    }

    async fn get(&self, owner: &str, id: &str) -> Result<Option<Document>> {
        let request = self.request(Method::GET, self.document_url(id)?, owner);
        match self.send(request).await {
            Ok(response) => {
                let body = response.text().await.map_err(transport_error)?;
                parse_document_body(&body)
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn list(&self, owner: &str, query: &DocumentQuery) -> Result<Vec<Document>> {
        query.validate()?;
        let request = self
            .request(Method::GET, self.collection_url()?, owner)
            .query(&filter_params(query));
        let rows: Vec<serde_json::Value> = self.send(request).await?.json().await?;
        rows.into_iter().map(Document::from_wire).collect()
    }

    async fn create(&self, owner: &str, document: &Document) -> Result<Document> {
        self.write(Method::POST, self.collection_url()?, owner, document)
            .await
    }

    async fn update(&self, owner: &str, document: &Document) -> Result<Document> {
        self.write(Method::PATCH, self.document_url(&document.id)?, owner, document)
            .await
    }

    async fn upsert(&self, owner: &str, document: &Document) -> Result<Document> {
        self.write(Method::PUT, self.document_url(&document.id)?, owner, document)
            .await
    }

    async fn delete_by_id(&self, owner: &str, id: &str) -> Result<()> {
        tracing::debug!(source = %self.source, document = id, "DELETE remote document");
        self.send(self.request(Method::DELETE, self.document_url(id)?, owner))
            .await?;
        Ok(())
    }

    async fn delete_by_filter(&self, owner: &str, query: &DocumentQuery) -> Result<usize> {
        query.validate()?;
        if query.filters.is_empty() {
            return Err(Error::InvalidInput(
                "refusing to delete a whole collection without a filter".into(),
            ));
        }
        let request = self
            .request(Method::DELETE, self.collection_url()?, owner)
            .query(&filter_params(query));
        let response = self.send(request).await?;
        let body = response.text().await.map_err(transport_error)?;
        if body.trim().is_empty() {
            return Ok(0);
        }
        Ok(match serde_json::from_str::<DeleteResponse>(&body)? {
            DeleteResponse::Count { deleted } => deleted,
            DeleteResponse::Rows(rows) => rows.len(),
        })
    }

    async fn metadata(&self, owner: &str) -> Result<Vec<MetadataModel>> {
        let request = self
            .request(Method::GET, self.collection_url()?, owner)
            .query(&[("select", METADATA_PROJECTION)]);
        let rows: Vec<MetadataRow> = self.send(request).await?.json().await?;
        Ok(rows
            .into_iter()
            .map(|row| MetadataModel {
                document_id: row.id,
                updated_at: row.updated_at,
            })
            .collect())
    }

    async fn subscribe(&self, owner: &str) -> Result<RealtimeSubscription> {
        WebSocketRealtime::new(Arc::clone(&self.config), self.channel_capacity)
            .subscribe(&self.source, owner)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn store_for(base_url: &str) -> HttpRemoteStore {
        let config = BackendConfig::new(base_url, "anon-key").unwrap();
        HttpRemoteStore::new(Arc::new(config), SourceSyncKey::new("homeworks").unwrap(), 16)
            .unwrap()
    }

    /// Serve one canned response and hand back the raw request head
    async fn serve_once(status_line: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0_u8; 1024];
            let head_end = loop {
                let read = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..read]);
                if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                assert!(read > 0, "connection closed before request head");
            };
            let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while buffer.len() < head_end + content_length {
                let read = socket.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            head
        });

        (base_url, handle)
    }

    #[test]
    fn classify_status_maps_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            Error::TransientNetwork(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_retryable());
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, r#"{"message":"row level security"}"#),
            Error::Permission(message) if message == "row level security (403)"
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad"),
            Error::Validation(_)
        ));
        assert!(matches!(classify_status(StatusCode::CONFLICT, ""), Error::Conflict(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND, ""), Error::NotFound(_)));
    }

    #[test]
    fn urls_escape_document_ids() {
        let store = store_for("https://api.example.com/");
        assert_eq!(
            store.collection_url().unwrap().as_str(),
            "https://api.example.com/v1/collections/homeworks/documents"
        );
        assert_eq!(
            store.document_url("a b/c").unwrap().as_str(),
            "https://api.example.com/v1/collections/homeworks/documents/a%20b%2Fc"
        );
    }

    #[test]
    fn parse_document_body_accepts_common_shapes() {
        let object = parse_document_body(r#"{"id":"a","updated_at":3,"title":"x"}"#).unwrap();
        assert_eq!(object.unwrap().payload, json!({"title": "x"}));
        let array = parse_document_body(r#"[{"id":"a","updated_at":3}]"#).unwrap();
        assert_eq!(array.unwrap().updated_at, 3);
        assert!(parse_document_body("").unwrap().is_none());
        assert!(parse_document_body("[]").unwrap().is_none());
    }

    #[test]
    fn filter_params_stringify_scalars() {
        let query = DocumentQuery::all()
            .where_eq("subject_id", "math")
            .where_eq("week", 3)
            .limit(10);
        assert_eq!(
            filter_params(&query),
            vec![
                ("subject_id".to_string(), "math".to_string()),
                ("week".to_string(), "3".to_string()),
                ("limit".to_string(), "10".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_missing_document_is_none() {
        let (base_url, server) = serve_once("404 Not Found", r#"{"message":"no row"}"#).await;
        let store = store_for(&base_url);

        assert!(store.get("user-1", "hw-1").await.unwrap().is_none());
        let head = server.await.unwrap();
        assert!(head.starts_with("GET /v1/collections/homeworks/documents/hw-1?owner_id=user-1 "));
        assert!(head.to_ascii_lowercase().contains("apikey: anon-key"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer anon-key"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_sends_wire_document() {
        let (base_url, server) =
            serve_once("200 OK", r#"{"id":"hw-1","updated_at":7,"title":"Essay"}"#).await;
        let store = store_for(&base_url);
        let document = Document::new("hw-1", 7, json!({"title": "Essay"})).unwrap();

        let stored = store.upsert("user-1", &document).await.unwrap();
        assert_eq!(stored, document);
        assert!(server.await.unwrap().starts_with("PUT /v1/collections/homeworks/documents/hw-1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_errors_are_transient() {
        let (base_url, server) = serve_once("503 Service Unavailable", "").await;
        let store = store_for(&base_url);
        let document = Document::new("hw-1", 7, json!({})).unwrap();

        let error = store.upsert("user-1", &document).await.unwrap_err();
        assert!(error.is_retryable());
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_uses_projection() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"[{"id":"a","updated_at":1},{"id":"b","updated_at":2}]"#,
        )
        .await;
        let store = store_for(&base_url);

        let metadata = store.metadata("user-1").await.unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[1].document_id, "b");
        assert!(server.await.unwrap().contains("select=id%2Cupdated_at"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_backend_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let error = store_for(&base_url).metadata("user-1").await.unwrap_err();
        assert!(error.is_retryable());
    }
}
