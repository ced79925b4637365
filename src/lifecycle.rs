//! Node bootstrap and lifecycle supervision.
//!
//! # Startup order
//! ```text
//! prepare storage dir ─▶ register commands ─▶ seal registry ─▶ spawn node unit
//!                                                               │
//!           build request server ◀──────────────────────────────┘
//!           build cluster transport (server serve fn + handle)
//!           Running ─▶ cluster.listen_and_serve(join)   (does not return)
//! ```
//! The supervisor then waits for SIGINT/SIGTERM or for a fatal error from
//! the node unit, whichever comes first. Fatal errors are never retried.
//!
//! # Shutdown
//! In [`ShutdownMode::Abrupt`] (the default) the node unit is dropped on the
//! spot and durability is left to the replicated log. In
//! [`ShutdownMode::Graceful`] cancellation is broadcast and the node unit is
//! awaited up to the configured timeout.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::cluster::ClusterEntry;
use crate::command::CommandRegistry;
use crate::config::{NodeConfig, ShutdownMode};
use crate::errors::{NodeError, RegistryError};
use crate::storage;

/// Where the node is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
                // Fatal errors end the process straight from these states.
                | (Initializing, Stopped)
                | (Running, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable lifecycle state.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Initializing);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn transition(&self, next: LifecycleState) -> bool {
        let mut moved = false;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                info!(from = %state, to = %next, "Lifecycle transition");
                *state = next;
                moved = true;
            } else {
                warn!(from = %state, to = %next, "Ignoring illegal lifecycle transition");
            }
            moved
        });
        moved
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending side of the cancellation broadcast.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the cancellation broadcast.
///
/// A dropped [`ShutdownTrigger`] counts as a shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Everything a node unit needs to build its collaborators.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub config: NodeConfig,
    /// Absolute storage directory, already created.
    pub directory: PathBuf,
    /// Sealed command registry.
    pub registry: Arc<CommandRegistry>,
    pub lifecycle: Lifecycle,
}

/// The collaborators a supervisor starts.
pub trait NodeComponents: Send + Sync + 'static {
    type Server: Send + Sync + 'static;

    /// Register every replicated command kind. Called once, before any
    /// cluster activity.
    fn register_commands(&self, registry: &mut CommandRegistry) -> Result<(), RegistryError>;

    fn build_server(&self, ctx: &NodeContext) -> anyhow::Result<Arc<Self::Server>>;

    fn build_cluster(
        &self,
        ctx: &NodeContext,
        server: Arc<Self::Server>,
    ) -> anyhow::Result<Box<dyn ClusterEntry>>;
}

/// Orchestrates startup and shutdown of one node.
pub struct Supervisor<C> {
    config: NodeConfig,
    components: Arc<C>,
    lifecycle: Lifecycle,
}

impl<C: NodeComponents> Supervisor<C> {
    pub fn new(config: NodeConfig, components: C) -> Self {
        Self {
            config,
            components: Arc::new(components),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Start the node and block until `signal` resolves or a fatal error
    /// occurs. `Ok` means an orderly, signal-triggered exit.
    pub async fn run<F>(self, signal: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()> + Send,
    {
        let lifecycle = self.lifecycle.clone();
        let result = self.start_and_wait(signal).await;
        if let Err(err) = &result {
            error!(error = %err, "Fatal error");
        }
        lifecycle.transition(LifecycleState::Stopped);
        result
    }

    async fn start_and_wait<F>(self, signal: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()> + Send,
    {
        let directory = storage::prepare(&self.config.directory)?;

        let mut registry = CommandRegistry::new();
        self.components.register_commands(&mut registry)?;
        registry.seal();
        info!(kinds = ?registry.kinds(), "Registered replicated commands");

        let ctx = NodeContext {
            config: self.config.clone(),
            directory,
            registry: Arc::new(registry),
            lifecycle: self.lifecycle.clone(),
        };

        let trigger = ShutdownTrigger::new();
        let (done_tx, done_rx) = oneshot::channel();
        let unit = tokio::spawn(run_node_unit(
            self.components.clone(),
            ctx,
            trigger.subscribe(),
            done_tx,
        ));

        tokio::pin!(signal);
        tokio::select! {
            _ = &mut signal => {}
            outcome = done_rx => match outcome {
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(NodeError::Aborted),
                Ok(Ok(())) => {
                    warn!("Cluster entry point returned; waiting for a termination signal");
                    signal.await;
                }
            },
        }

        info!("Termination signal received");
        self.lifecycle.transition(LifecycleState::ShuttingDown);

        match self.config.tuning.shutdown.mode {
            ShutdownMode::Abrupt => unit.abort(),
            ShutdownMode::Graceful => {
                trigger.trigger();
                let limit = Duration::from_secs(self.config.tuning.shutdown.timeout_secs);
                match tokio::time::timeout(limit, unit).await {
                    Ok(_) => info!("Node unit stopped"),
                    Err(_) => warn!(timeout_secs = limit.as_secs(), "Graceful shutdown timed out"),
                }
            }
        }
        Ok(())
    }
}

async fn run_node_unit<C: NodeComponents>(
    components: Arc<C>,
    ctx: NodeContext,
    shutdown: ShutdownSignal,
    done: oneshot::Sender<Result<(), NodeError>>,
) {
    let result = async {
        let server = components
            .build_server(&ctx)
            .map_err(NodeError::ServerConstruction)?;
        let cluster = components
            .build_cluster(&ctx, server)
            .map_err(NodeError::ClusterConstruction)?;

        ctx.lifecycle.transition(LifecycleState::Running);
        cluster
            .listen_and_serve(ctx.config.join_target(), shutdown)
            .await?;
        Ok(())
    }
    .await;
    let _ = done.send(result);
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
///
/// The handlers are installed when this is called, not on first poll, so a
/// signal arriving during startup is not lost to the default disposition.
/// Must be called inside a tokio runtime.
#[cfg(unix)]
pub fn shutdown_signal() -> impl Future<Output = ()> + Send {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    fn install(kind: SignalKind, name: &'static str) -> Option<Signal> {
        signal(kind)
            .map_err(|e| error!(error = %e, signal = name, "Failed to install signal handler"))
            .ok()
    }

    async fn recv(stream: Option<Signal>) {
        match stream {
            Some(mut stream) => {
                stream.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let interrupt = install(SignalKind::interrupt(), "SIGINT");
    let terminate = install(SignalKind::terminate(), "SIGTERM");
    async move {
        tokio::select! {
            _ = recv(interrupt) => {
                info!("Received SIGINT, shutting down");
            },
            _ = recv(terminate) => {
                info!("Received SIGTERM, shutting down");
            },
        }
    }
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
pub fn shutdown_signal() -> impl Future<Output = ()> + Send {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    }
}
