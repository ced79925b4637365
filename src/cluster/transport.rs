//! The cluster transport: one listener shared by peers and clients.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use super::log::Member;
use super::raft::RaftNode;
use super::{routes, BoxFuture, ClusterEntry, JoinTarget, RequestHandle, ServeFn};
use crate::address::{resolve, Listener, TransportKind};
use crate::command::CommandRegistry;
use crate::config::ClusterTuning;
use crate::errors::ClusterError;
use crate::lifecycle::ShutdownSignal;

/// File holding this node's identity inside the storage directory.
pub const NODE_ID_FILE: &str = "node_id";

/// A constructed, not yet listening, cluster member.
pub struct Cluster {
    node: Arc<RaftNode>,
    listen: String,
    serve: ServeFn,
}

impl Cluster {
    /// Open the replicated state in `directory` and wire in the request
    /// server through its serve function and handle.
    pub fn new<H>(
        directory: &Path,
        listen: &str,
        serve: ServeFn,
        handle: Arc<H>,
        registry: Arc<CommandRegistry>,
        tuning: &ClusterTuning,
    ) -> anyhow::Result<Self>
    where
        H: RequestHandle + 'static,
    {
        let me = Member {
            name: load_or_create_node_id(directory)?,
            address: advertised_address(directory, listen),
        };
        info!(node = %me.name, address = %me.address, "Opening cluster state");
        let node = RaftNode::open(me, directory, registry, handle.clone(), handle, tuning)?;
        Ok(Self {
            node: Arc::new(node),
            listen: listen.to_string(),
            serve,
        })
    }

    pub fn node(&self) -> Arc<RaftNode> {
        self.node.clone()
    }
}

impl ClusterEntry for Cluster {
    fn listen_and_serve(
        self: Box<Self>,
        join: JoinTarget,
        shutdown: ShutdownSignal,
    ) -> BoxFuture<'static, Result<(), ClusterError>> {
        Box::pin(async move {
            let Cluster {
                node,
                listen,
                serve,
            } = *self;

            node.recover()?;

            let listener = Listener::bind(&listen)
                .await
                .map_err(|source| ClusterError::Bind {
                    address: listen.clone(),
                    source,
                })?;
            info!(address = %listener.local_addr(), "Listening for clients and peers");

            let peer_routes = routes::router(node.clone());
            let serving = async {
                serve(listener, peer_routes, shutdown.clone())
                    .await
                    .map_err(ClusterError::Serve)
            };
            tokio::try_join!(serving, node.run(join, shutdown.clone()))?;
            Ok(())
        })
    }
}

/// The address peers should dial to reach `listen`.
///
/// A relative socket path is relative to this node's storage directory, which
/// peers do not share, so it is advertised joined onto that directory.
pub fn advertised_address(directory: &Path, listen: &str) -> String {
    match resolve(listen) {
        TransportKind::UnixSocket if Path::new(listen).is_relative() => {
            directory.join(listen).display().to_string()
        }
        _ => listen.to_string(),
    }
}

/// Read the node identity from `directory`, minting one on first start.
pub fn load_or_create_node_id(directory: &Path) -> anyhow::Result<String> {
    let path = directory.join(NODE_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", path.display()));
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, format!("{id}\n"))
        .with_context(|| format!("writing {}", path.display()))?;
    info!(node = %id, "Generated node identity");
    Ok(id)
}
