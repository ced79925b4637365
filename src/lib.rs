//! sqlcluster library: a consensus-replicated SQL node.
//!
//! This crate provides the components for running one member of a
//! replicated SQLite cluster: storage directory preparation, the replicated
//! command registry, the client request server, the cluster transport with
//! its durable log, and the supervisor that starts and stops them.

pub mod address;
pub mod cli;
pub mod cluster;
pub mod command;
pub mod config;
pub mod db;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod server;
pub mod storage;

pub use lifecycle::Supervisor;
pub use node::SqlNode;
