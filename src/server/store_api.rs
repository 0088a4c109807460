//! Store surface for remote clients
//!
//! Commands answer `200` with a [`Reply`]; a store error is sent as
//! [`Reply::Error`] so the client gets back the exact variant. Pub/sub
//! subscriptions live in a [`SubscriptionHub`] that buffers messages between
//! polls and drops subscriptions nobody has polled for a while.

use super::{ApiError, AppState};
use crate::store::{
    SharedStore, SubscriptionCreated, SubscriptionPoll, TransactionRequest, TransactionResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use meshstore::{Command, Reply, Subscription};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Longest a blocking read or long-poll may hold a request
pub const MAX_BLOCK: Duration = Duration::from_secs(30);

/// Subscriptions not polled for this long are dropped
pub const SUBSCRIPTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const REAP_INTERVAL: Duration = Duration::from_secs(15);

fn max_block_ms() -> u64 {
    u64::try_from(MAX_BLOCK.as_millis()).unwrap_or(u64::MAX)
}

/// Cap the wait of a blocking group read
fn clamp_block(command: Command) -> Command {
    match command {
        Command::XReadGroup {
            key,
            group,
            consumer,
            cursor,
            count,
            block_ms: Some(ms),
        } => Command::XReadGroup {
            key,
            group,
            consumer,
            cursor,
            count,
            block_ms: Some(ms.min(max_block_ms())),
        },
        other => other,
    }
}

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/store/command", post(execute_command))
        .route("/store/transaction", post(execute_transaction))
        .route("/store/subscriptions", post(create_subscription))
        .route(
            "/store/subscriptions/{id}",
            axum::routing::get(poll_subscription).delete(delete_subscription),
        )
}

struct HubEntry {
    channel: String,
    subscription: Mutex<Subscription>,
    last_polled: std::sync::Mutex<Instant>,
}

impl HubEntry {
    fn touch(&self) {
        *self.last_polled.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(
            *self.last_polled.lock().unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Server-side pub/sub subscriptions held on behalf of remote clients
pub struct SubscriptionHub {
    store: SharedStore,
    entries: Mutex<HashMap<String, Arc<HubEntry>>>,
}

impl SubscriptionHub {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `channel`; returns the subscription id
    pub async fn open(&self, channel: &str) -> crate::Result<String> {
        let subscription = self.store.subscribe(channel).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(HubEntry {
            channel: channel.to_string(),
            subscription: Mutex::new(subscription),
            last_polled: std::sync::Mutex::new(Instant::now()),
        });
        self.entries.lock().await.insert(id.clone(), entry);
        tracing::debug!(subscription = %id, channel, "Opened remote subscription");
        Ok(id)
    }

    /// Messages buffered for `id`, waiting up to `wait` for the first one
    ///
    /// `None` if the subscription does not exist (or was reaped).
    pub async fn poll(&self, id: &str, wait: Duration) -> Option<Vec<String>> {
        let entry = self.entries.lock().await.get(id).cloned()?;
        entry.touch();

        let mut subscription = entry.subscription.lock().await;
        let mut messages = Vec::new();
        while let Some(message) = subscription.try_recv() {
            messages.push(message);
        }
        if messages.is_empty() && !wait.is_zero() {
            match tokio::time::timeout(wait.min(MAX_BLOCK), subscription.recv()).await {
                Ok(Some(message)) => {
                    messages.push(message);
                    while let Some(message) = subscription.try_recv() {
                        messages.push(message);
                    }
                }
                Ok(None) => {
                    drop(subscription);
                    tracing::debug!(subscription = id, channel = %entry.channel, "Store closed subscription");
                    self.close(id).await;
                    return None;
                }
                Err(_) => {}
            }
        }
        entry.touch();
        Some(messages)
    }

    /// Drop a subscription; `false` if it did not exist
    pub async fn close(&self, id: &str) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drop subscriptions idle past [`SUBSCRIPTION_IDLE_TIMEOUT`]
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|id, entry| {
            let keep = entry.idle(now) < SUBSCRIPTION_IDLE_TIMEOUT;
            if !keep {
                tracing::info!(subscription = %id, channel = %entry.channel, "Dropping idle subscription");
            }
            keep
        });
        before - entries.len()
    }

    pub(crate) async fn reap_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            self.reap_idle().await;
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn execute_command(
    State(state): State<Arc<AppState>>,
    Json(command): Json<Command>,
) -> Json<Reply> {
    let command = clamp_block(command);
    let name = command.name();
    match state.mesh.store().execute(command).await {
        Ok(reply) => Json(reply),
        Err(e) => {
            tracing::debug!(command = name, error = %e, "Store command rejected");
            Json(Reply::Error(e))
        }
    }
}

async fn execute_transaction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let commands = request.commands.into_iter().map(clamp_block).collect();
    let replies = state
        .mesh
        .store()
        .transaction(commands)
        .await
        .map_err(crate::MeshError::from)?;
    Ok(Json(TransactionResponse { replies }))
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    channel: String,
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscribeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.channel.is_empty() {
        return Err(ApiError::BadRequest("channel must not be empty".to_string()));
    }
    let id = state.hub.open(&request.channel).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubscriptionCreated {
            id,
            channel: request.channel,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(default)]
    wait_ms: u64,
}

async fn poll_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<SubscriptionPoll>, ApiError> {
    let wait = Duration::from_millis(query.wait_ms);
    match state.hub.poll(&id, wait).await {
        Some(messages) => Ok(Json(SubscriptionPoll { messages })),
        None => Err(ApiError::NotFound(format!("Subscription not found: {}", id))),
    }
}

async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.hub.close(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Subscription not found: {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use meshstore::{MemoryStore, ReadCursor, StoreError, StoreExt};
    use tower::ServiceExt;

    #[test]
    fn test_clamp_block() {
        let command = Command::XReadGroup {
            key: "s".into(),
            group: "g".into(),
            consumer: "c".into(),
            cursor: ReadCursor::New,
            count: 1,
            block_ms: Some(120_000),
        };
        match clamp_block(command) {
            Command::XReadGroup { block_ms, .. } => assert_eq!(block_ms, Some(30_000)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_reply_and_error() {
        let app = server().router();

        let response = app
            .clone()
            .oneshot(post_json(
                "/store/command",
                serde_json::to_value(Command::LPush {
                    key: "q".into(),
                    values: vec!["a".into()],
                })
                .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: Reply = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(reply, Reply::Int(1));

        // Wrong type comes back as a reply, not an HTTP error
        let response = app
            .oneshot(post_json(
                "/store/command",
                serde_json::to_value(Command::Incr { key: "q".into() }).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: Reply = serde_json::from_value(body_json(response).await).unwrap();
        assert!(matches!(reply, Reply::Error(StoreError::WrongType(_))));
    }

    #[tokio::test]
    async fn test_transaction() {
        let app = server().router();
        let request = TransactionRequest {
            commands: vec![
                Command::Incr { key: "n".into() },
                Command::Incr { key: "n".into() },
                Command::Get { key: "n".into() },
            ],
        };
        let response = app
            .oneshot(post_json(
                "/store/transaction",
                serde_json::to_value(&request).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: TransactionResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(
            body.replies,
            vec![Reply::Int(1), Reply::Int(2), Reply::Str("2".into())]
        );
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let server = server();
        let app = server.router();

        let response = app
            .clone()
            .oneshot(post_json(
                "/store/subscriptions",
                serde_json::json!({"channel": "channel:head"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: SubscriptionCreated = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(created.channel, "channel:head");

        server.state.mesh.store().publish("channel:head", "one").await.unwrap();
        server.state.mesh.store().publish("channel:head", "two").await.unwrap();

        let uri = format!("/store/subscriptions/{}?wait_ms=10", created.id);
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let poll: SubscriptionPoll = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(poll.messages, vec!["one", "two"]);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/store/subscriptions/{}", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_subscriptions_reaped() {
        let hub = SubscriptionHub::new(Arc::new(MemoryStore::new()));
        let idle = hub.open("channel:a").await.unwrap();
        let active = hub.open("channel:b").await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(hub.poll(&active, Duration::ZERO).await.is_some());
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(hub.reap_idle().await, 1);
        assert!(hub.poll(&idle, Duration::ZERO).await.is_none());
        assert!(hub.poll(&active, Duration::ZERO).await.is_some());
        assert_eq!(hub.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_for_message() {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(SubscriptionHub::new(store.clone()));
        let id = hub.open("channel:a").await.unwrap();

        let poller = {
            let hub = hub.clone();
            let id = id.clone();
            tokio::spawn(async move { hub.poll(&id, Duration::from_secs(20)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.publish("channel:a", "late").await.unwrap();

        assert_eq!(poller.await.unwrap(), Some(vec!["late".to_string()]));

        // Empty poll returns once the wait runs out
        assert_eq!(hub.poll(&id, Duration::from_secs(5)).await, Some(vec![]));
    }
}
