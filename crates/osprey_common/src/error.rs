//! Error taxonomy of the ring engine.
//!
//! Recoverable conditions surface as [`RingError`] and leave engine state
//! unchanged (mutation clones are discarded by the snapshot holder).
//! Contract violations — publishing a non-increasing ring version, a pending
//! endpoint unknown to the topology — indicate a programming bug and go
//! through [`on_internal_error`], which never returns.

use thiserror::Error;

use crate::types::{Endpoint, HostId, Token};

/// Convenience alias for `Result<T, RingError>`.
pub type RingResult<T> = Result<T, RingError>;

/// Errors surfaced to callers of the ring engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The endpoint has no topology entry; ring mutations require one.
    #[error("endpoint {0} is not a member of the topology")]
    UnknownEndpoint(Endpoint),

    /// A bootstrap token is already owned (normal or bootstrap) by another
    /// endpoint.
    #[error("bootstrap token collision between {owner} and {candidate} (token {token})")]
    TokenCollision {
        token: Token,
        owner: Endpoint,
        candidate: Endpoint,
    },

    /// The endpoint ↔ host-id bijection would be violated.
    #[error("host id conflict: {host_id} cannot be bound to {endpoint}")]
    HostIdConflict { endpoint: Endpoint, host_id: HostId },

    /// A token query was made against an empty ring.
    #[error("sorted token set is empty")]
    EmptyRing,

    /// The token is not present in the sorted token set.
    #[error("token {0} is not in the ring")]
    UnknownToken(Token),

    /// Parser resolution found neither a host id nor an endpoint in the
    /// cluster.
    #[error("{0} not found in the cluster")]
    NotInCluster(String),

    /// The input string parses as neither a host id nor an endpoint.
    #[error("invalid host id or endpoint: {0}")]
    InvalidInput(String),

    /// Propagated from a replication-strategy callback.
    #[error("replication strategy failed: {0}")]
    Strategy(String),
}

/// Log at `error` level and abort the process.
///
/// Reserved for invariant violations that can only be caused by a bug in
/// the engine or its caller; recoverable conditions use [`RingError`].
#[track_caller]
pub fn on_internal_error(msg: impl AsRef<str>) -> ! {
    let msg = msg.as_ref();
    tracing::error!("{}", msg);
    panic!("internal error: {msg}");
}
