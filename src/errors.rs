//! Error types for the node.
//!
//! Startup failures ([`StorageError`], [`RegistryError`], [`NodeError`]) are
//! all fatal: the supervisor logs them and the process exits non-zero.
//! [`ClusterError`] also doubles as the HTTP error type for the request and
//! peer routes, so it implements [`axum::response::IntoResponse`].

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure to prepare the storage directory.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The directory (or one of its ancestors) could not be created.
    #[error("Error while creating storage directory {}: {source}", path.display())]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The directory exists but could not be made the working directory.
    #[error("Error while changing to storage directory {}: {source}", path.display())]
    ChdirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Misuse of the replicated command registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command kind {0:?} is already registered")]
    Duplicate(String),

    #[error("command registry is sealed; cannot register {0:?}")]
    Sealed(String),

    #[error("no command registered for kind {0:?}")]
    UnknownKind(String),
}

/// Malformed command line or tuning file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Bad flags or stray positional arguments.
    #[error("{message}")]
    Usage { message: String },

    /// The YAML tuning file could not be read or parsed.
    #[error("Error while loading tuning file {}: {source:#}", path.display())]
    Tuning {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// A fatal condition reported to the supervisor.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Error while registering commands: {0}")]
    Registry(#[from] RegistryError),

    #[error("Error while constructing request server: {0:#}")]
    ServerConstruction(#[source] anyhow::Error),

    #[error("Error while constructing cluster transport: {0:#}")]
    ClusterConstruction(#[source] anyhow::Error),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The node task ended without reporting a result (it panicked).
    #[error("node task ended unexpectedly")]
    Aborted,
}

/// Errors raised by the cluster transport and its HTTP surface.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Error while binding {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error while joining cluster at {target}: {reason}")]
    Join { target: String, reason: String },

    #[error("request to peer {peer} failed: {reason}")]
    Rpc { peer: String, reason: String },

    #[error("node is not the leader")]
    NotLeader,

    #[error("node has not joined a cluster yet")]
    NotReady,

    #[error("entry {index} was not committed within the proposal timeout")]
    Timeout { index: u64 },

    #[error("command at index {index} failed: {message}")]
    Command { index: u64, message: String },

    #[error("replicated log error: {0:#}")]
    Log(#[source] anyhow::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("request server failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("node is shutting down")]
    ShuttingDown,
}

impl ClusterError {
    /// Return the HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::NotLeader
            | ClusterError::NotReady
            | ClusterError::Timeout { .. }
            | ClusterError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Rpc { .. } | ClusterError::Join { .. } => StatusCode::BAD_GATEWAY,
            ClusterError::Command { .. } | ClusterError::Registry(_) => StatusCode::BAD_REQUEST,
            ClusterError::Bind { .. } | ClusterError::Log(_) | ClusterError::Serve(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (
            status,
            [("content-type", "text/plain; charset=utf-8")],
            format!("{self}\n"),
        )
            .into_response();

        if let ClusterError::Command { index, .. } = self {
            if let Ok(value) = index.to_string().parse() {
                response.headers_mut().insert(crate::server::INDEX_HEADER, value);
            }
        }
        response
    }
}
