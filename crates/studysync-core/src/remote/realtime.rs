//! WebSocket change feed

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use super::RealtimeSubscription;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::{RealtimeEvent, SourceSyncKey};

/// Opens collection subscriptions on the backend's realtime endpoint
#[derive(Debug, Clone)]
pub struct WebSocketRealtime {
    config: Arc<BackendConfig>,
    channel_capacity: usize,
}

impl WebSocketRealtime {
    pub fn new(config: Arc<BackendConfig>, channel_capacity: usize) -> Self {
        Self {
            config,
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn subscription_url(&self, source: &SourceSyncKey, owner: &str) -> Result<Url> {
        let mut url = self.config.realtime_base()?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidInput("realtime url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["v1", "realtime"]);
        url.query_pairs_mut()
            .append_pair("collection", source.as_str())
            .append_pair("owner_id", owner)
            .append_pair("apikey", &self.config.api_key);
        Ok(url)
    }

    /// Connect, send the subscribe frame, and spawn the reader.
    ///
    /// The subscription ends when the socket closes or errors; reconnecting is
    /// the caller's job.
    pub async fn subscribe(
        &self,
        source: &SourceSyncKey,
        owner: &str,
    ) -> Result<RealtimeSubscription> {
        let url = self.subscription_url(source, owner)?;
        tracing::debug!(source = %source, "connecting realtime feed");

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|error| Error::WebSocket(error.to_string()))?;
        let (mut write, mut read) = stream.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "collection": source.as_str(),
            "owner_id": owner,
            "access_token": self.config.bearer_token(),
        });
        write
            .send(Message::Text(subscribe.to_string().into()))
            .await
            .map_err(|error| Error::WebSocket(error.to_string()))?;

        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let source = source.clone();
        let reader = tokio::spawn(async move {
            // The write half stays here so the socket lives as long as the reader.
            let _write = write;
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(event) => {
                            if sender.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            tracing::trace!(source = %source, "ignoring control frame: {}", text.as_str());
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(source = %source, "realtime feed failed: {error}");
                        break;
                    }
                }
            }
            tracing::debug!(source = %source, "realtime feed closed");
        });

        Ok(RealtimeSubscription::new(receiver, reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RealtimeOperation;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn realtime_for(base_url: &str) -> WebSocketRealtime {
        let config = BackendConfig::new(base_url, "anon-key").unwrap();
        WebSocketRealtime::new(Arc::new(config), 8)
    }

    #[test]
    fn subscription_url_derives_websocket_scheme() {
        let realtime = realtime_for("https://api.example.com");
        let source = SourceSyncKey::new("homeworks").unwrap();
        let url = realtime.subscription_url(&source, "user 1").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.example.com/v1/realtime?collection=homeworks&owner_id=user+1&apikey=anon-key"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forwards_events_and_skips_control_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            let subscribe = ws.next().await.unwrap().unwrap();
            let subscribe: serde_json::Value =
                serde_json::from_str(subscribe.to_text().unwrap()).unwrap();
            assert_eq!(subscribe["collection"], "homeworks");

            ws.send(Message::Text(r#"{"type":"subscribed"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"event":"create","document_id":"hw-1","payload":{"title":"Essay"},"updated_at":5}"#
                    .into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.ok();
        });

        let realtime = realtime_for(&base_url);
        let source = SourceSyncKey::new("homeworks").unwrap();
        let mut subscription = realtime.subscribe(&source, "user-1").await.unwrap();

        let event = subscription.next().await.unwrap();
        assert_eq!(event.operation, RealtimeOperation::Create);
        assert_eq!(event.document_id, "hw-1");
        assert!(subscription.next().await.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let source = SourceSyncKey::new("homeworks").unwrap();
        match realtime_for(&base_url).subscribe(&source, "user-1").await {
            Ok(subscription) => panic!("connected to a closed port: {subscription:?}"),
            Err(error) => assert!(error.is_retryable(), "{error}"),
        }
    }
}
