//! End-to-end replication between real nodes on TCP and Unix sockets.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlcluster::cluster::{Cluster, ClusterEntry, JoinTarget, RaftNode};
use sqlcluster::command::{ApplyContext, CommandRegistry};
use sqlcluster::config::NodeConfig;
use sqlcluster::errors::ClusterError;
use sqlcluster::lifecycle::{Lifecycle, NodeComponents, NodeContext, ShutdownTrigger};
use sqlcluster::server::{RequestServer, INDEX_HEADER};
use sqlcluster::SqlNode;
use tokio::task::JoinHandle;

struct TestNode {
    server: Arc<RequestServer>,
    node: Arc<RaftNode>,
    trigger: ShutdownTrigger,
    task: JoinHandle<Result<(), ClusterError>>,
}

impl TestNode {
    async fn start(dir: &Path, listen: &str, join: JoinTarget) -> Self {
        std::fs::create_dir_all(dir).unwrap();
        let mut registry = CommandRegistry::new();
        SqlNode.register_commands(&mut registry).unwrap();
        registry.seal();

        let mut config = NodeConfig::new(dir);
        config.listen = listen.to_string();
        let ctx = NodeContext {
            config,
            directory: dir.to_path_buf(),
            registry: Arc::new(registry),
            lifecycle: Lifecycle::new(),
        };

        let server = SqlNode.build_server(&ctx).unwrap();
        let cluster = Cluster::new(
            dir,
            listen,
            server.serve_fn(),
            server.clone(),
            ctx.registry.clone(),
            &ctx.config.tuning.cluster,
        )
        .unwrap();
        let node = cluster.node();
        let trigger = ShutdownTrigger::new();
        let task = tokio::spawn(Box::new(cluster).listen_and_serve(join, trigger.subscribe()));

        let ready = server.clone();
        eventually("node ready", || {
            let ready = ready.clone();
            async move { !matches!(ready.submit("SELECT 1").await, Err(ClusterError::NotReady)) }
        })
        .await;

        Self {
            server,
            node,
            trigger,
            task,
        }
    }

    async fn stop(self) {
        self.trigger.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("node did not stop")
            .unwrap()
            .unwrap();
    }

    fn query(&self, sql: &str) -> String {
        self.server.execute_sql(sql).unwrap()
    }
}

fn free_tcp_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_bootstrap_and_join_over_tcp() {
    let tmp = tempfile::tempdir().unwrap();
    let addr0 = free_tcp_address();
    let addr1 = free_tcp_address();

    let node0 = TestNode::start(&tmp.path().join("node0"), &addr0, JoinTarget::Bootstrap).await;
    assert!(node0.node.is_leader());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr0}/sql"))
        .body("CREATE TABLE ctf3 (name TEXT)")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key(INDEX_HEADER));

    let node1 = TestNode::start(
        &tmp.path().join("node1"),
        &addr1,
        JoinTarget::Join(addr0.clone()),
    )
    .await;
    assert!(!node1.node.is_leader());
    assert_eq!(node1.node.leader().unwrap().address, addr0);

    // A write sent to the follower is forwarded to the leader.
    let response = client
        .post(format!("http://{addr1}/sql"))
        .body("INSERT INTO ctf3 VALUES ('siddarth')")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert_eq!(node1.query("SELECT name FROM ctf3"), "siddarth\n");
    eventually("leader applied insert", || {
        let done = node0.query("SELECT count(*) FROM ctf3") == "1\n";
        async move { done }
    })
    .await;
    assert_eq!(node0.node.members().len(), 2);

    let response = client
        .post(format!("http://{addr1}/sql"))
        .body("SELECT * FROM missing")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(response.text().await.unwrap().contains("no such table"));

    node1.stop().await;
    node0.stop().await;
}

#[tokio::test]
async fn test_join_over_unix_sockets_and_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let dir0 = tmp.path().join("node0");
    let dir1 = tmp.path().join("node1");
    let sock0 = dir0.join("node.sock").to_str().unwrap().to_string();
    let sock1 = dir1.join("node.sock").to_str().unwrap().to_string();

    let node0 = TestNode::start(&dir0, &sock0, JoinTarget::Bootstrap).await;
    node0
        .server
        .submit("CREATE TABLE t (x INTEGER)")
        .await
        .unwrap();

    let node1 = TestNode::start(&dir1, &sock1, JoinTarget::Join(sock0.clone())).await;
    let proposal = node1
        .server
        .submit("INSERT INTO t VALUES (1)")
        .await
        .unwrap();
    assert!(proposal.output.is_ok());
    assert_eq!(node1.query("SELECT x FROM t"), "1\n");

    node1.stop().await;

    // The restarted follower rebuilds its database from its own log and
    // ignores the join target.
    let node1 = TestNode::start(&dir1, &sock1, JoinTarget::Join(sock0.clone())).await;
    assert_eq!(node1.query("SELECT x FROM t"), "1\n");

    node1.stop().await;
    node0.stop().await;
}

#[tokio::test]
async fn test_join_unreachable_target_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("node1");
    std::fs::create_dir_all(&dir).unwrap();

    let mut registry = CommandRegistry::new();
    SqlNode.register_commands(&mut registry).unwrap();
    registry.seal();
    let mut config = NodeConfig::new(&dir);
    config.listen = free_tcp_address();
    let ctx = NodeContext {
        config,
        directory: dir.clone(),
        registry: Arc::new(registry),
        lifecycle: Lifecycle::new(),
    };
    let server = SqlNode.build_server(&ctx).unwrap();
    let cluster = SqlNode.build_cluster(&ctx, server).unwrap();
    let trigger = ShutdownTrigger::new();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        cluster.listen_and_serve(JoinTarget::Join(free_tcp_address()), trigger.subscribe()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(ClusterError::Join { .. })));
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();
    let dir = tmp.path().join("node0");
    std::fs::create_dir_all(&dir).unwrap();

    let mut registry = CommandRegistry::new();
    SqlNode.register_commands(&mut registry).unwrap();
    registry.seal();
    let mut config = NodeConfig::new(&dir);
    config.listen = addr;
    let ctx = NodeContext {
        config,
        directory: dir.clone(),
        registry: Arc::new(registry),
        lifecycle: Lifecycle::new(),
    };
    let server = SqlNode.build_server(&ctx).unwrap();
    let cluster = SqlNode.build_cluster(&ctx, server).unwrap();
    let trigger = ShutdownTrigger::new();

    let result = cluster
        .listen_and_serve(JoinTarget::Bootstrap, trigger.subscribe())
        .await;
    assert!(matches!(result, Err(ClusterError::Bind { .. })));
}
