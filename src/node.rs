//! Production wiring: SQL actions, the request server and the cluster.

use std::sync::Arc;

use crate::cluster::{Cluster, ClusterEntry};
use crate::command::{CommandRegistry, SqlAction};
use crate::errors::RegistryError;
use crate::lifecycle::{NodeComponents, NodeContext};
use crate::server::RequestServer;

/// The components a `sqlcluster` process runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlNode;

impl NodeComponents for SqlNode {
    type Server = RequestServer;

    fn register_commands(&self, registry: &mut CommandRegistry) -> Result<(), RegistryError> {
        registry.register(SqlAction::KIND, SqlAction::decode)
    }

    fn build_server(&self, ctx: &NodeContext) -> anyhow::Result<Arc<RequestServer>> {
        let db_path = ctx.directory.join(&ctx.config.tuning.database.file);
        RequestServer::new(&db_path, ctx.lifecycle.clone())
    }

    fn build_cluster(
        &self,
        ctx: &NodeContext,
        server: Arc<RequestServer>,
    ) -> anyhow::Result<Box<dyn ClusterEntry>> {
        let cluster = Cluster::new(
            &ctx.directory,
            &ctx.config.listen,
            server.serve_fn(),
            server,
            ctx.registry.clone(),
            &ctx.config.tuning.cluster,
        )?;
        Ok(Box::new(cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_sql_action() {
        let mut registry = CommandRegistry::new();
        SqlNode.register_commands(&mut registry).unwrap();
        assert_eq!(registry.kinds(), vec![SqlAction::KIND]);
    }

    #[test]
    fn test_registering_twice_fails() {
        let mut registry = CommandRegistry::new();
        SqlNode.register_commands(&mut registry).unwrap();
        assert_eq!(
            SqlNode.register_commands(&mut registry),
            Err(RegistryError::Duplicate("sql".to_string()))
        );
    }
}
