//! Coordination store client over HTTP
//!
//! Talks to the store surface served by `agentmesh serve`. Connection and
//! timeout failures are retried with bounded backoff; semantic store errors
//! come back as the exact `StoreError` the server produced and are never
//! retried. A retried command may have been applied by an attempt whose
//! reply was lost, so non-idempotent commands are at-least-once.

use crate::retry::{with_retry, RetryConfig};
use crate::MeshError;
use async_trait::async_trait;
use meshstore::{Command, CoordinationStore, Reply, StoreError, Subscription};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Body of `POST /store/transaction`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub commands: Vec<Command>,
}

/// Reply to `POST /store/transaction`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub replies: Vec<Reply>,
}

/// Reply to `POST /store/subscriptions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionCreated {
    pub id: String,
    pub channel: String,
}

/// Reply to `GET /store/subscriptions/{id}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPoll {
    pub messages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Long-poll wait per subscription request
const POLL_WAIT: Duration = Duration::from_secs(20);

/// Extra allowance on top of a blocking read's own wait
const BLOCK_GRACE: Duration = Duration::from_secs(5);

/// HTTP client for a remote coordination store
#[derive(Debug, Clone)]
pub struct RemoteStore {
    base: Url,
    client: reqwest::Client,
    timeout: Duration,
    retry: RetryConfig,
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else {
        StoreError::Transport(e.to_string())
    }
}

async fn status_error(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| "Unknown error".to_string());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::Server(format!("{}: {}", status, message))
    } else {
        StoreError::InvalidArgument(format!("{}: {}", status, message))
    }
}

impl RemoteStore {
    /// Create a client for the store at `base_url` (e.g. `http://127.0.0.1:7420`)
    pub fn new(base_url: &str) -> crate::Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| MeshError::Config(format!("Invalid store URL '{}': {}", base_url, e)))?;
        Ok(Self {
            base,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(35),
            retry: RetryConfig::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> Result<Url, StoreError> {
        self.base
            .join(path)
            .map_err(|e| StoreError::InvalidArgument(format!("bad path {}: {}", path, e)))
    }

    async fn post_json<B, R>(&self, path: &str, body: &B, timeout: Duration) -> Result<R, StoreError>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(self.url(path)?)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response.json::<R>().await.map_err(transport_error)
    }

    async fn send_command(&self, command: &Command) -> Result<Reply, StoreError> {
        let timeout = command
            .block_ms()
            .map(|ms| self.timeout.max(Duration::from_millis(ms) + BLOCK_GRACE))
            .unwrap_or(self.timeout);
        self.post_json::<_, Reply>("store/command", command, timeout)
            .await?
            .into_result()
    }

    async fn create_subscription(&self, channel: &str) -> Result<SubscriptionCreated, StoreError> {
        self.post_json(
            "store/subscriptions",
            &serde_json::json!({ "channel": channel }),
            self.timeout,
        )
        .await
    }

    /// `Ok(None)` once the server has dropped the subscription
    async fn poll_subscription(&self, id: &str) -> Result<Option<Vec<String>>, StoreError> {
        let mut url = self.url(&format!("store/subscriptions/{}", id))?;
        url.query_pairs_mut()
            .append_pair("wait_ms", &POLL_WAIT.as_millis().to_string());

        let response = self
            .client
            .get(url)
            .timeout(POLL_WAIT + BLOCK_GRACE)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let poll: SubscriptionPoll = response.json().await.map_err(transport_error)?;
        Ok(Some(poll.messages))
    }

    async fn delete_subscription(&self, id: &str) {
        let Ok(url) = self.url(&format!("store/subscriptions/{}", id)) else {
            return;
        };
        if let Err(e) = self.client.delete(url).timeout(self.timeout).send().await {
            tracing::debug!(subscription = id, error = %e, "Failed to delete subscription");
        }
    }

    /// Forward polled messages until the local receiver goes away
    async fn pump(self, id: String, channel: String, tx: mpsc::UnboundedSender<String>) {
        let mut failures = 0u32;
        while !tx.is_closed() {
            match self.poll_subscription(&id).await {
                Ok(Some(messages)) => {
                    failures = 0;
                    for message in messages {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(channel = %channel, subscription = %id, "Subscription expired on server");
                    return;
                }
                Err(e) => {
                    if failures >= self.retry.max_retries {
                        tracing::warn!(channel = %channel, error = %e, "Giving up on subscription");
                        return;
                    }
                    let backoff = self.retry.backoff_duration(failures);
                    tracing::debug!(channel = %channel, error = %e, "Subscription poll failed, retrying");
                    tokio::time::sleep(backoff).await;
                    failures += 1;
                }
            }
        }
        self.delete_subscription(&id).await;
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn execute(&self, command: Command) -> Result<Reply, StoreError> {
        with_retry(&self.retry, command.name(), || self.send_command(&command)).await
    }

    async fn transaction(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        let request = TransactionRequest { commands };
        let response: TransactionResponse = with_retry(&self.retry, "transaction", || {
            self.post_json("store/transaction", &request, self.timeout)
        })
        .await?;
        Ok(response.replies)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let created = with_retry(&self.retry, "subscribe", || self.create_subscription(channel)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().pump(created.id, channel.to_string(), tx));
        Ok(Subscription::new(channel, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore::StoreExt;

    fn unreachable_store() -> RemoteStore {
        // Port 9 (discard) is never served in test environments
        RemoteStore::new("http://127.0.0.1:9")
            .unwrap()
            .with_timeout(Duration::from_millis(500))
            .with_retry(RetryConfig {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                multiplier: 1.0,
                jitter: false,
            })
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(matches!(
            RemoteStore::new("not a url"),
            Err(MeshError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_surfaces_transport_error() {
        let store = unreachable_store();
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_wire_bodies() {
        let request = TransactionRequest {
            commands: vec![Command::LLen { key: "q".into() }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["commands"][0]["cmd"], "l_len");

        let poll: SubscriptionPoll = serde_json::from_str(r#"{"messages":["a","b"]}"#).unwrap();
        assert_eq!(poll.messages, vec!["a", "b"]);
    }
}
