//! Configuration types for a cluster node.
//!
//! [`NodeConfig`] comes from the command line. Optional tuning knobs that have
//! no flag are read from a YAML file into [`Tuning`]; every field has a
//! default so the file may be partial or absent.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::address::{self, TransportKind};
use crate::cluster::JoinTarget;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:4000";

/// Default storage directory.
pub const DEFAULT_DIRECTORY: &str = "/tmp/sqlcluster";

/// Default verbosity.
pub const DEFAULT_VERBOSITY: i32 = 3;

/// Immutable node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Collaborator verbosity; `<= 0` disables debug output.
    pub verbosity: i32,
    /// Address the request server and cluster transport listen on.
    pub listen: String,
    /// Address of an existing member to join; empty bootstraps a new cluster.
    pub join: String,
    /// Storage directory for the log and the local database.
    pub directory: PathBuf,
    /// Settings from the optional tuning file.
    pub tuning: Tuning,
}

impl NodeConfig {
    /// Config with defaults for every flag.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            verbosity: DEFAULT_VERBOSITY,
            listen: DEFAULT_LISTEN.to_string(),
            join: String::new(),
            directory: directory.into(),
            tuning: Tuning::default(),
        }
    }

    pub fn join_target(&self) -> JoinTarget {
        JoinTarget::from_flag(&self.join)
    }

    pub fn transport_kind(&self) -> TransportKind {
        address::resolve(&self.listen)
    }
}

/// Settings read from the YAML tuning file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tuning {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub cluster: ClusterTuning,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Timing knobs for the cluster transport.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterTuning {
    /// Timeout for a single peer request, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// How long a client write waits for its entry to commit, in milliseconds.
    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,

    /// Interval between leader replication rounds, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for ClusterTuning {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            propose_timeout_ms: default_propose_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// File name of the local database, relative to the storage directory.
    #[serde(default = "default_database_file")]
    pub file: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file: default_database_file(),
        }
    }
}

/// What happens to running subsystems when a termination signal arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Exit immediately and let the OS tear everything down.
    #[default]
    Abrupt,
    /// Cancel the request server and replication loop, then wait for them.
    Graceful,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub mode: ShutdownMode,

    /// Upper bound on a graceful shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::default(),
            timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder and serve `/metrics`.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_rpc_timeout_ms() -> u64 {
    2000
}

fn default_propose_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    250
}

fn default_database_file() -> String {
    "sqlcluster.db".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

// -- Loader ------------------------------------------------------------------

/// Load and parse the tuning file at `path`.
pub fn load_tuning<P: AsRef<Path>>(path: P) -> anyhow::Result<Tuning> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let tuning: Tuning = serde_yaml::from_str(&contents)?;
    Ok(tuning)
}
