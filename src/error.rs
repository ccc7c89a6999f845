//! Error types shared by the protocol core and the instance runtime.
//!
//! Nothing in here is fatal to a worker: decode failures skip one entry,
//! transport failures are retried by the caller, claim conflicts and
//! dependency cycles surface as alerts.

use thiserror::Error;

/// A channel entry that could not be turned into a protocol message.
#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("entry has no kind separator")]
  MissingSeparator,

  #[error("entry has an empty kind tag")]
  EmptyKind,

  #[error("malformed envelope: {0}")]
  Envelope(#[source] serde_json::Error),

  #[error("malformed {kind} content: {source}")]
  Content {
    kind: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Failure to append to or read from the shared channel.
#[derive(Error, Debug)]
pub enum TransportError {
  #[error("append failed: {0}")]
  Append(String),

  #[error("read failed: {0}")]
  Read(String),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration failed: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Another instance won the claim race for a task this instance reserved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("claim on {task_id} by {loser} lost to {winner}")]
pub struct ClaimConflict {
  pub task_id: String,
  pub loser: String,
  pub winner: String,
}

/// A set of tasks that (transitively) depend on each other.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dependency cycle between tasks [{}]", tasks.join(", "))]
pub struct DependencyCycle {
  /// Members of the cycle, sorted by id.
  pub tasks: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("missing required setting {0}")]
  Missing(&'static str),

  #[error("invalid value {value:?} for {key}: {reason}")]
  Invalid {
    key: &'static str,
    value: String,
    reason: String,
  },

  #[error("inconsistent timeouts: {0}")]
  Inconsistent(String),
}

/// Errors returned by the instance runtime operations.
#[derive(Error, Debug)]
pub enum CoordError {
  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Cycle(#[from] DependencyCycle),

  #[error("failed to encode message: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("invalid id {0:?}")]
  InvalidId(String),

  #[error("{instance} does not own task {task_id}")]
  NotOwner { instance: String, task_id: String },
}
