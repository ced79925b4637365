//! Peer-facing HTTP routes, merged into the request server's router.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use super::raft::RaftNode;
use super::rpc::{
    AppendRequest, AppendResponse, JoinRequest, JoinResponse, ProposeRequest, ProposeResponse,
    APPEND_PATH, JOIN_PATH, PROPOSE_PATH,
};
use crate::errors::ClusterError;

/// Build the peer router for `node`.
pub fn router(node: Arc<RaftNode>) -> Router {
    Router::new()
        .route(JOIN_PATH, post(join))
        .route(APPEND_PATH, post(append))
        .route(PROPOSE_PATH, post(propose))
        .with_state(node)
}

async fn join(
    State(node): State<Arc<RaftNode>>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ClusterError> {
    node.handle_join(req).await.map(Json)
}

async fn append(
    State(node): State<Arc<RaftNode>>,
    Json(req): Json<AppendRequest>,
) -> Result<Json<AppendResponse>, ClusterError> {
    node.handle_append(req).map(Json)
}

async fn propose(
    State(node): State<Arc<RaftNode>>,
    Json(req): Json<ProposeRequest>,
) -> Result<Json<ProposeResponse>, ClusterError> {
    node.handle_propose(req).await.map(Json)
}
