//! Typed error taxonomy for the gateway core (spec.md §7).
//!
//! Every variant here maps to one of the recoverable error classes from the
//! spec: validation, not-found, permission, spawn failure, or an internal
//! invariant violation. None of these should ever be allowed to propagate
//! as a panic — the session or connection they concern is torn down, and
//! the server continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session capacity exhausted")]
    CapacityExhausted,

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("client is not attached to session {0}")]
    NotInRoster(String),

    #[error("session {0} roster is full")]
    RosterFull(String),

    #[error("shell {0:?} is not in the configured allowlist")]
    ShellNotAllowed(String),

    #[error("working directory {0:?} is not in the configured allowlist")]
    PathNotAllowed(String),

    #[error("container {0:?} is not in the configured allowlist")]
    ContainerNotAllowed(String),

    #[error("container exec/attach is disabled")]
    ContainerExecDisabled,

    #[error("client already owns {0} sessions, at the configured per-client limit")]
    PerClientLimitReached(usize),

    #[error("failed to start pty: {0}")]
    SpawnFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
