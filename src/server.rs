//! The client-facing request server.
//!
//! Clients POST SQL to `/sql`. The statement is proposed to the replicated
//! log and the response carries the output of applying it on this node once
//! it has committed. Peer routes from the cluster transport are merged into
//! the same router, so a single listener serves both.

use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::address::Listener;
use crate::cluster::{BoxFuture, Proposal, Proposer, RequestHandle, ServeFn};
use crate::command::{ApplyContext, CommandOutput, SqlAction};
use crate::db::SqlDatabase;
use crate::errors::ClusterError;
use crate::lifecycle::{Lifecycle, LifecycleState, ShutdownSignal};
use crate::metrics::{metrics_handler, metrics_middleware};

/// Response header carrying the log index a statement committed at.
pub const INDEX_HEADER: &str = "x-sqlcluster-index";

/// Serves client SQL and applies committed commands to the local database.
pub struct RequestServer {
    database: SqlDatabase,
    proposer: OnceLock<Arc<dyn Proposer>>,
    lifecycle: Lifecycle,
}

impl RequestServer {
    /// Open a fresh database at `db_path`.
    pub fn new(db_path: &Path, lifecycle: Lifecycle) -> anyhow::Result<Arc<Self>> {
        let database = SqlDatabase::open_fresh(db_path)?;
        info!(path = %db_path.display(), "Local database initialized");
        Ok(Self::with_database(database, lifecycle))
    }

    pub fn with_database(database: SqlDatabase, lifecycle: Lifecycle) -> Arc<Self> {
        Arc::new(Self {
            database,
            proposer: OnceLock::new(),
            lifecycle,
        })
    }

    /// Replicate `sql` and return the committed result.
    pub async fn submit(&self, sql: impl Into<String>) -> Result<Proposal, ClusterError> {
        if matches!(
            self.lifecycle.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        ) {
            return Err(ClusterError::ShuttingDown);
        }
        let proposer = self.proposer.get().ok_or(ClusterError::NotReady)?;
        proposer.propose(Box::new(SqlAction::new(sql))).await
    }

    /// Build the router: client routes, `peer_routes`, and middleware.
    pub fn router(self: &Arc<Self>, peer_routes: Router) -> Router {
        Router::new()
            .route("/sql", post(handle_sql))
            .route("/health", get(health_check))
            .route("/metrics", get(metrics_handler))
            .with_state(self.clone())
            .merge(peer_routes)
            .layer(TraceLayer::new_for_http())
            // metrics_middleware is outermost (captures full request lifecycle).
            .layer(middleware::from_fn(metrics_middleware))
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn listen_and_serve(
        self: Arc<Self>,
        listener: Listener,
        peer_routes: Router,
        shutdown: ShutdownSignal,
    ) -> io::Result<()> {
        let app = self.router(peer_routes);
        match listener {
            Listener::Tcp(l) => {
                axum::serve(l, app)
                    .with_graceful_shutdown(shutdown.wait())
                    .await
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                axum::serve(l, app)
                    .with_graceful_shutdown(shutdown.wait())
                    .await
            }
        }
    }

    /// The serve entry point handed to the cluster transport.
    pub fn serve_fn(self: &Arc<Self>) -> ServeFn {
        let server = self.clone();
        Box::new(
            move |listener: Listener,
                  peer_routes: Router,
                  shutdown: ShutdownSignal|
                  -> BoxFuture<'static, io::Result<()>> {
                Box::pin(server.listen_and_serve(listener, peer_routes, shutdown))
            },
        )
    }
}

impl ApplyContext for RequestServer {
    fn execute_sql(&self, sql: &str) -> anyhow::Result<CommandOutput> {
        self.database.execute(sql)
    }
}

impl RequestHandle for RequestServer {
    fn attach_proposer(&self, proposer: Arc<dyn Proposer>) {
        if self.proposer.set(proposer).is_err() {
            debug!("Proposer already attached");
        }
    }
}

/// `POST /sql` -- Replicate the request body and return its output.
async fn handle_sql(
    State(server): State<Arc<RequestServer>>,
    body: String,
) -> Result<Response, ClusterError> {
    let proposal = server.submit(body).await?;
    match proposal.output {
        Ok(output) => Ok((
            StatusCode::OK,
            [(INDEX_HEADER, proposal.index.to_string())],
            output,
        )
            .into_response()),
        Err(message) => Err(ClusterError::Command {
            index: proposal.index,
            message,
        }),
    }
}

/// `GET /health` -- Returns `{"status", "state", "cluster"}`.
///
/// Answers 503 with status `joining` until the node has entered the cluster
/// and can accept writes.
async fn health_check(State(server): State<Arc<RequestServer>>) -> impl IntoResponse {
    let joined = server.proposer.get().is_some();
    let (code, status) = if joined {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "joining")
    };
    (
        code,
        Json(json!({
            "status": status,
            "state": server.lifecycle.state().as_str(),
            "cluster": if joined { "joined" } else { "joining" },
        })),
    )
}
