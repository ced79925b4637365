//! Cluster coordination and replication.
//!
//! The cluster transport owns the replicated log, the join handshake and
//! replication to peers. It shares one listener with the request server:
//! peer routes are merged into the request server's router and the server's
//! serve entry point is invoked once the listener is bound.
//!
//! Replication is leader based. The node that bootstraps the cluster leads
//! it; later members join through it and receive its log. There is no
//! leader election or failover.

pub mod log;
pub mod raft;
pub mod routes;
pub mod rpc;
pub mod transport;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use axum::Router;
use serde::{Deserialize, Serialize};

use crate::address::Listener;
use crate::command::{ApplyContext, Command, CommandOutput};
use crate::errors::ClusterError;
use crate::lifecycle::ShutdownSignal;

pub use raft::RaftNode;
pub use transport::Cluster;

/// Boxed future returned by trait objects in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The request server's blocking serve entry point.
///
/// Receives the bound listener, the peer routes to merge into its router,
/// and a shutdown signal to stop accepting on.
pub type ServeFn =
    Box<dyn FnOnce(Listener, Router, ShutdownSignal) -> BoxFuture<'static, io::Result<()>> + Send>;

/// How a node enters the cluster, derived from the join flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    /// Start a new single-member cluster and lead it.
    Bootstrap,
    /// Ask the member at this address to admit us.
    Join(String),
}

impl JoinTarget {
    /// Empty means bootstrap; anything else is passed through unmodified.
    pub fn from_flag(join: &str) -> Self {
        if join.is_empty() {
            JoinTarget::Bootstrap
        } else {
            JoinTarget::Join(join.to_string())
        }
    }
}

/// Result of a committed proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Log index the command was committed at.
    pub index: u64,
    /// What applying the command produced; `Err` holds its error message.
    pub output: Result<CommandOutput, String>,
}

/// Submits commands to the replicated log.
pub trait Proposer: Send + Sync {
    /// Replicate `command`, wait for it to commit and return the local
    /// result of applying it.
    fn propose(&self, command: Box<dyn Command>) -> BoxFuture<'_, Result<Proposal, ClusterError>>;
}

/// The request server as seen by the cluster transport.
///
/// Committed commands are applied against it, and the transport hands it a
/// [`Proposer`] once the node has joined or bootstrapped.
pub trait RequestHandle: ApplyContext {
    fn attach_proposer(&self, proposer: Arc<dyn Proposer>);
}

/// The cluster transport's blocking entry point.
pub trait ClusterEntry: Send + 'static {
    /// Bind, bootstrap or join, then serve until `shutdown` fires.
    fn listen_and_serve(
        self: Box<Self>,
        join: JoinTarget,
        shutdown: ShutdownSignal,
    ) -> BoxFuture<'static, Result<(), ClusterError>>;
}
