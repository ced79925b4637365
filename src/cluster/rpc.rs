//! Peer-to-peer messages and the HTTP client that carries them.
//!
//! Peers talk JSON over HTTP/1.1 on the same listener that serves clients.
//! The client opens one connection per request over TCP or a Unix socket,
//! depending on how the peer's address resolves.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use super::log::{LogEntry, Member};
use super::Proposal;
use crate::address::{self, TransportKind};
use crate::errors::ClusterError;

pub const JOIN_PATH: &str = "/raft/join";
pub const APPEND_PATH: &str = "/raft/append";
pub const PROPOSE_PATH: &str = "/raft/propose";

/// Ask a member to admit `member`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    /// `false` when the contacted node is not the leader.
    pub accepted: bool,
    /// The leader, when the contacted node knows it.
    pub leader: Option<Member>,
}

/// Leader to follower: entries following `prev_index`, plus the leader's
/// commit index. An empty `entries` list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub leader: Member,
    pub prev_index: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    /// `false` when the follower is missing entries before `prev_index`.
    pub success: bool,
    pub last_index: u64,
}

/// Follower to leader: a client command to replicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub kind: String,
    pub data: Vec<u8>,
}

pub type ProposeResponse = Proposal;

/// JSON-over-HTTP client for peer requests.
#[derive(Debug, Clone)]
pub struct PeerClient {
    timeout: Duration,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn join(&self, peer: &str, req: &JoinRequest) -> Result<JoinResponse, ClusterError> {
        self.post(peer, JOIN_PATH, req).await
    }

    pub async fn append(
        &self,
        peer: &str,
        req: &AppendRequest,
    ) -> Result<AppendResponse, ClusterError> {
        self.post(peer, APPEND_PATH, req).await
    }

    pub async fn propose(
        &self,
        peer: &str,
        req: &ProposeRequest,
    ) -> Result<ProposeResponse, ClusterError> {
        self.post(peer, PROPOSE_PATH, req).await
    }

    /// POST `body` as JSON to `path` on `peer` and decode the JSON reply.
    pub async fn post<Req, Resp>(&self, peer: &str, path: &str, body: &Req) -> Result<Resp, ClusterError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let rpc_error = |reason: String| ClusterError::Rpc {
            peer: peer.to_string(),
            reason,
        };

        let payload = serde_json::to_vec(body).map_err(|e| rpc_error(e.to_string()))?;
        let (status, bytes) = tokio::time::timeout(self.timeout, send(peer, path, payload))
            .await
            .map_err(|_| rpc_error(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| rpc_error(format!("{e:#}")))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(rpc_error(format!("{status}: {}", text.trim())));
        }
        serde_json::from_slice(&bytes).map_err(|e| rpc_error(format!("bad response: {e}")))
    }
}

async fn send(peer: &str, path: &str, payload: Vec<u8>) -> anyhow::Result<(StatusCode, Bytes)> {
    match address::resolve(peer) {
        TransportKind::NetworkSocket => {
            let stream = TcpStream::connect(peer)
                .await
                .with_context(|| format!("connecting to {peer}"))?;
            exchange(stream, peer, path, payload).await
        }
        #[cfg(unix)]
        TransportKind::UnixSocket => {
            let stream = UnixStream::connect(peer)
                .await
                .with_context(|| format!("connecting to {peer}"))?;
            exchange(stream, "localhost", path, payload).await
        }
        #[cfg(not(unix))]
        TransportKind::UnixSocket => anyhow::bail!("unix sockets are not supported here"),
    }
}

async fn exchange<S>(
    stream: S,
    authority: &str,
    path: &str,
    payload: Vec<u8>,
) -> anyhow::Result<(StatusCode, Bytes)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Peer connection closed with error");
        }
    });

    let request = Request::post(path)
        .header(header::HOST, authority)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, body))
}
