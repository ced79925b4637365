//! Replicated commands and the registry that decodes them.
//!
//! Log entries carry a command kind plus an opaque payload. The registry maps
//! each kind to a decoder so that entries replayed from disk or received from
//! the leader can be turned back into a [`Command`]. It is filled once at
//! startup, sealed, and then shared read-only with the cluster transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::RegistryError;

/// Stable identifier of a command kind, as written to the log.
pub type CommandKind = &'static str;

/// Text produced by applying a command.
pub type CommandOutput = String;

/// Builds a command from its encoded payload.
pub type Decoder = fn(&[u8]) -> anyhow::Result<Box<dyn Command>>;

/// The state a committed command is applied against.
pub trait ApplyContext: Send + Sync {
    /// Execute SQL text against the node's local database.
    fn execute_sql(&self, sql: &str) -> anyhow::Result<CommandOutput>;
}

/// A unit of work replicated through the log.
///
/// `apply` must be deterministic: every node applies the same entries in the
/// same order and must reach the same result, errors included.
pub trait Command: Send + Sync + fmt::Debug {
    fn kind(&self) -> CommandKind;

    fn encode(&self) -> anyhow::Result<Vec<u8>>;

    fn apply(&self, ctx: &dyn ApplyContext) -> anyhow::Result<CommandOutput>;
}

/// Table of command kinds known to this process.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    decoders: BTreeMap<CommandKind, Decoder>,
    sealed: bool,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind`. Fails on a duplicate or once the registry is sealed.
    pub fn register(&mut self, kind: CommandKind, decoder: Decoder) -> Result<(), RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed(kind.to_string()));
        }
        if self.decoders.contains_key(kind) {
            return Err(RegistryError::Duplicate(kind.to_string()));
        }
        self.decoders.insert(kind, decoder);
        Ok(())
    }

    /// Refuse further registrations.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<CommandKind> {
        self.decoders.keys().copied().collect()
    }

    /// Rebuild a command from a log entry.
    pub fn decode(&self, kind: &str, data: &[u8]) -> Result<Box<dyn Command>, DecodeError> {
        let decoder = self
            .decoders
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))?;
        decoder(data).map_err(DecodeError::Payload)
    }
}

/// Failure to turn a log entry back into a command.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("malformed command payload: {0:#}")]
    Payload(anyhow::Error),
}

/// Apply a SQL action to the local database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlAction {
    pub query: String,
}

impl SqlAction {
    pub const KIND: CommandKind = "sql";

    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }

    /// [`Decoder`] for [`SqlAction::KIND`].
    pub fn decode(data: &[u8]) -> anyhow::Result<Box<dyn Command>> {
        let action: SqlAction = serde_json::from_slice(data)?;
        Ok(Box::new(action))
    }
}

impl Command for SqlAction {
    fn kind(&self) -> CommandKind {
        Self::KIND
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn apply(&self, ctx: &dyn ApplyContext) -> anyhow::Result<CommandOutput> {
        ctx.execute_sql(&self.query)
    }
}
