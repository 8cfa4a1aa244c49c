//! HTTP query API.
//!
//! Read-only JSON views over a running node: the peer directory, node
//! statistics, individual events with their consensus metadata, round
//! summaries and the consensus order. Transactions can be queued for the
//! node's next event.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info};
use weave_federation::{Node, NodeStats};
use weave_protocol::{EventHash, EventView, NodeId, RoundSummary};

type ApiError = (StatusCode, String);

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// HTTP server exposing a node's query API.
pub struct HttpServer {
    config: ServerConfig,
    node: Node,
}

impl HttpServer {
    /// Creates a new [`HttpServer`] for `node`.
    pub fn new(config: ServerConfig, node: Node) -> Self {
        Self { config, node }
    }

    /// Access the configuration associated with this server.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until the listener fails.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .with_context(|| format!("Failed to bind HTTP API on {}", self.config.addr))?;
        info!("HTTP API listening on {}", listener.local_addr()?);
        axum::serve(listener, router(self.node))
            .await
            .context("HTTP server failed")?;
        Ok(())
    }
}

/// Build the API router.
pub fn router(node: Node) -> Router {
    Router::new()
        .route("/nodes", get(get_nodes))
        .route("/stats", get(get_stats))
        .route("/tips", get(get_tips))
        .route("/events/:hash", get(get_event))
        .route("/rounds/:round", get(get_round))
        .route("/order", get(get_order))
        .route("/transactions", post(submit_transaction))
        .with_state(node)
}

async fn get_nodes(State(node): State<Node>) -> Json<Vec<NodeId>> {
    Json(node.node_ids().await)
}

async fn get_stats(State(node): State<Node>) -> Json<NodeStats> {
    Json(node.stats().await)
}

async fn get_tips(State(node): State<Node>) -> Json<Vec<EventHash>> {
    Json(node.graph().read().await.tips())
}

async fn get_event(
    State(node): State<Node>,
    Path(hash): Path<String>,
) -> Result<Json<EventView>, ApiError> {
    let hash: EventHash = hash.parse().map_err(|e| {
        debug!("Bad event hash in request: {}", e);
        (StatusCode::BAD_REQUEST, "invalid event hash".to_string())
    })?;
    node.event_view(&hash)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "event not found".to_string()))
}

async fn get_round(
    State(node): State<Node>,
    Path(round): Path<u64>,
) -> Result<Json<RoundSummary>, ApiError> {
    node.round_summary(round)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "round not found".to_string()))
}

#[derive(Debug, Deserialize)]
struct OrderQuery {
    #[serde(default)]
    since: usize,
}

async fn get_order(State(node): State<Node>, Query(query): Query<OrderQuery>) -> Json<Vec<EventView>> {
    Json(node.ordered_events(query.since).await)
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    queued: usize,
}

async fn submit_transaction(
    State(node): State<Node>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "empty transaction".to_string()));
    }
    let queued = body.len();
    node.submit_transaction(body.to_vec()).await;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { queued })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use weave_federation::NodeConfig;

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn get_json(app: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        call(app, Request::builder().uri(path).body(Body::empty()).unwrap()).await
    }

    #[tokio::test]
    async fn nodes_lists_local_node() {
        let node = Node::new(NodeConfig::default()).unwrap();
        let app = router(node.clone());
        let (status, json) = get_json(&app, "/nodes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([node.node_id()]));
    }

    #[tokio::test]
    async fn stats_reports_empty_dag() {
        let app = router(Node::new(NodeConfig::default()).unwrap());
        let (status, json) = get_json(&app, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["dag"]["total_events"], 0);
        assert_eq!(json["peers"], 0);
    }

    #[tokio::test]
    async fn event_lookup_by_hash() {
        let node = Node::new(NodeConfig::default()).unwrap();
        node.submit_transaction(b"hello".to_vec()).await;
        let hash = node.create_event().await.unwrap().unwrap();
        node.recompute().await;
        let app = router(node);

        let (status, json) = get_json(&app, &format!("/events/{}", hash)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["event"]["hash"], hash.to_hex());
        assert_eq!(json["round"], 0);
        assert_eq!(json["witness"], true);
        assert_eq!(json["fame"], "pending");

        let (status, _) = get_json(&app, &format!("/events/{}", "00".repeat(32))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(&app, "/events/not-a-hash").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rounds_and_order() {
        let node = Node::new(NodeConfig::default()).unwrap();
        node.create_event().await.unwrap();
        node.recompute().await;
        let app = router(node);

        let (status, json) = get_json(&app, "/rounds/0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["event_count"], 1);
        assert_eq!(json["decided"], false);

        let (status, _) = get_json(&app, "/rounds/9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = get_json(&app, "/order?since=0").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_transaction_queues_bytes() {
        let node = Node::new(NodeConfig::default()).unwrap();
        let app = router(node.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/transactions")
            .body(Body::from("payload"))
            .unwrap();
        let (status, json) = call(&app, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["queued"], 7);

        let hash = node.create_event().await.unwrap().unwrap();
        let event = node.graph().read().await.get_event(&hash).cloned().unwrap();
        assert_eq!(event.transactions, vec![b"payload".to_vec()]);

        let empty = Request::builder()
            .method("POST")
            .uri("/transactions")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&app, empty).await.0, StatusCode::BAD_REQUEST);
    }
}
