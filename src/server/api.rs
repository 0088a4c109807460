//! Collaborator API: decisions, escalations, queues, streams, breakers

use super::{ApiError, AppState};
use crate::breaker::BreakerSnapshot;
use crate::bus::StreamDepth;
use crate::decision::{
    Decision, DecisionCoordinator, DecisionStatus, Escalation, EscalationStatus, Tier, Vote, Voter,
};
use crate::metrics;
use crate::queue::{QueueDepth, QueuedTask};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(export_metrics))
        .route("/decisions", get(list_decisions).post(propose_decision))
        .route("/decisions/{id}", get(get_decision))
        .route("/decisions/{id}/votes", post(vote))
        .route("/decisions/{id}/approve", post(approve_decision))
        .route("/decisions/{id}/reject", post(reject_decision))
        .route("/escalations", get(list_escalations))
        .route("/escalations/{id}/respond", post(respond_to_escalation))
        .route("/queues/{agent}/tasks", post(enqueue_task))
        .route("/queues/{agent}", get(queue_depth))
        .route("/streams/{stream}", get(stream_depth))
        .route("/breakers", get(list_breakers))
        .route("/breakers/{name}/{action}", post(breaker_action))
}

fn coordinator(state: &AppState) -> Result<&Arc<DecisionCoordinator>, ApiError> {
    state.mesh.decisions().ok_or_else(|| {
        ApiError::Mesh(crate::MeshError::Other(
            "Decision coordinator is not configured".to_string(),
        ))
    })
}

fn parse_filter<T>(value: Option<String>) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().map_err(ApiError::BadRequest))
        .transpose()
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProposeRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub proposer: String,
    pub tier: Tier,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub voter: Voter,
    pub vote: Vote,
}

/// Manual approve/reject
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub by: String,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub approved: bool,
    pub response: String,
    pub responder: String,
}

#[derive(Debug, Serialize)]
pub struct RespondResponse {
    pub escalation: Escalation,
    pub decision: Decision,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepthResponse {
    pub agent_id: String,
    #[serde(flatten)]
    pub depth: QueueDepth,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn export_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

async fn list_decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<Decision>>, ApiError> {
    let status = parse_filter::<DecisionStatus>(query.status)?;
    let decisions = coordinator(&state)?.list(status).await?;
    Ok(Json(decisions))
}

async fn propose_decision(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProposeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    if req.proposer.trim().is_empty() {
        return Err(ApiError::BadRequest("proposer must not be empty".to_string()));
    }
    let decision = coordinator(&state)?
        .propose(&req.title, &req.description, &req.proposer, req.tier)
        .await?;
    Ok((StatusCode::CREATED, Json(decision)))
}

async fn get_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Decision>, ApiError> {
    Ok(Json(coordinator(&state)?.get(&id).await?))
}

async fn vote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<Decision>, ApiError> {
    let decision = coordinator(&state)?.vote(&id, req.voter, req.vote).await?;
    Ok(Json(decision))
}

async fn approve_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Decision>, ApiError> {
    let decision = coordinator(&state)?.approve(&id, &req.by, req.note).await?;
    Ok(Json(decision))
}

async fn reject_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Decision>, ApiError> {
    let decision = coordinator(&state)?.reject(&id, &req.by, req.note).await?;
    Ok(Json(decision))
}

async fn list_escalations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<Escalation>>, ApiError> {
    let status = parse_filter::<EscalationStatus>(query.status)?;
    Ok(Json(coordinator(&state)?.escalations(status).await?))
}

async fn respond_to_escalation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RespondRequest>,
) -> Result<Json<RespondResponse>, ApiError> {
    let (escalation, decision) = coordinator(&state)?
        .respond_to_escalation(&id, req.approved, &req.response, &req.responder)
        .await?;
    Ok(Json(RespondResponse {
        escalation,
        decision,
    }))
}

async fn enqueue_task(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<QueuedTask>), ApiError> {
    let task = state.mesh.queue.enqueue(&agent, req.payload).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn queue_depth(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
) -> Result<Json<QueueDepthResponse>, ApiError> {
    let depth = state.mesh.queue.depth(&agent).await?;
    Ok(Json(QueueDepthResponse {
        agent_id: agent,
        depth,
    }))
}

async fn stream_depth(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
) -> Result<Json<StreamDepth>, ApiError> {
    Ok(Json(state.mesh.bus.stream_depth(&stream).await?))
}

async fn list_breakers(State(state): State<Arc<AppState>>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.mesh.breakers.snapshots())
}

async fn breaker_action(
    State(state): State<Arc<AppState>>,
    Path((name, action)): Path<(String, String)>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    let breakers = &state.mesh.breakers;
    let snapshot = match action.as_str() {
        "open" => Some(breakers.force_open(&name)),
        "close" => Some(breakers.force_closed(&name)),
        "clear" => breakers.clear_override(&name),
        "reset" => breakers.reset(&name),
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown breaker action '{}' (expected open, close, clear or reset)",
                other
            )))
        }
    };
    snapshot
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Circuit breaker not found: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::test_support::get;
    use super::*;
    use crate::config::MeshConfig;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn propose(app: &Router, tier: &str) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(post_json(
                "/decisions",
                serde_json::json!({"title": "Deploy", "proposer": "a1", "tier": tier}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = server().router();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_decision_vote_flow() {
        let app = server().router();
        let decision = propose(&app, "major").await;
        let id = decision["id"].as_str().unwrap().to_string();
        assert_eq!(decision["status"], "pending");

        for voter in ["ceo", "dao"] {
            let response = app
                .clone()
                .oneshot(post_json(
                    &format!("/decisions/{}/votes", id),
                    serde_json::json!({"voter": voter, "vote": "approve"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(get(&format!("/decisions/{}", id)))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "approved");
        assert_eq!(body["resolutionNote"], "vote");

        let response = app
            .clone()
            .oneshot(get("/decisions?status=approved"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        // Voting on a resolved decision conflicts
        let response = app
            .oneshot(post_json(
                &format!("/decisions/{}/votes", id),
                serde_json::json!({"voter": "ceo", "vote": "veto"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_manual_reject() {
        let app = server().router();
        let decision = propose(&app, "critical").await;
        let id = decision["id"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/decisions/{}/reject", id),
                serde_json::json!({"by": "ops", "note": "too risky"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "rejected");
        assert_eq!(body["humanDecision"], "too risky");
    }

    #[tokio::test]
    async fn test_escalation_respond() {
        let mut config = MeshConfig::new();
        config.decisions.major_timeout = Duration::ZERO;
        let server = server_with(config);
        let app = server.router();
        let decision = propose(&app, "major").await;

        let coordinator = server.state.mesh.decisions().unwrap().clone();
        let report = coordinator.sweep(chrono::Utc::now()).await.unwrap();
        assert_eq!(report.escalated, 1);

        let response = app
            .clone()
            .oneshot(get("/escalations?status=pending"))
            .await
            .unwrap();
        let escalations = body_json(response).await;
        let escalation_id = escalations[0]["id"].as_str().unwrap().to_string();
        assert_eq!(escalations[0]["decisionId"], decision["id"]);

        let response = app
            .oneshot(post_json(
                &format!("/escalations/{}/respond", escalation_id),
                serde_json::json!({"approved": true, "response": "ship it", "responder": "alice"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["escalation"]["status"], "responded");
        assert_eq!(body["decision"]["status"], "approved");
    }

    #[tokio::test]
    async fn test_not_found_and_bad_request() {
        let app = server().router();
        let response = app.clone().oneshot(get("/decisions/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("missing"));

        let response = app
            .clone()
            .oneshot(get("/decisions?status=limbo"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json(
                "/decisions",
                serde_json::json!({"title": " ", "proposer": "a1", "tier": "minor"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queue_routes() {
        let app = server().router();
        let response = app
            .clone()
            .oneshot(post_json(
                "/queues/a1/tasks",
                serde_json::json!({"payload": {"job": "build"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task = body_json(response).await;
        assert_eq!(task["agentId"], "a1");
        assert_eq!(task["payload"]["job"], "build");

        let response = app.clone().oneshot(get("/queues/a1")).await.unwrap();
        let depth = body_json(response).await;
        assert_eq!(depth["agentId"], "a1");
        assert_eq!(depth["queued"], 1);
        assert_eq!(depth["processing"], 0);

        let response = app.oneshot(get("/streams/stream:agent:a1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["length"], 0);
    }

    #[tokio::test]
    async fn test_breaker_routes() {
        let app = server().router();

        let response = app
            .clone()
            .oneshot(post_json("/breakers/claude/reset", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(post_json("/breakers/claude/open", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "open");
        assert_eq!(body["forced"], "open");

        let response = app
            .clone()
            .oneshot(post_json("/breakers/claude/reset", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["state"], "closed");

        let response = app
            .clone()
            .oneshot(post_json("/breakers/claude/explode", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(get("/breakers")).await.unwrap();
        let list = body_json(response).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["name"], "claude");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = server().router();
        metrics::record_sweep("ok");
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("agentmesh_sweep_cycles_total"));
    }
}
