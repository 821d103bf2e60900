//! Replication-strategy seam.
//!
//! The engine never decides replica placement itself. Strategies are
//! external collaborators queried during pending-range computation; the
//! engine composes their answers across the leave/bootstrap/replace
//! transitions.

use std::collections::HashSet;

use async_trait::async_trait;

use osprey_common::{DcRack, Endpoint, RingResult, Token};

use crate::metadata::TokenMetadata;
use crate::range::TokenRange;

/// Resolves an endpoint's datacenter/rack placement on behalf of the
/// pending-range engine, which needs it to install bootstrapping nodes
/// into what-if rings.
pub type DcRackFn = dyn Fn(Endpoint) -> DcRack + Send + Sync;

/// A replication strategy: a pure function from token + topology to a
/// replica set.
///
/// Failures are reported as [`RingError::Strategy`](osprey_common::RingError::Strategy)
/// and abort the pending-range computation without touching published
/// state.
#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    /// Every non-wrapping range `endpoint` is a natural replica for under
    /// `ring`.
    async fn ranges_owned(
        &self,
        endpoint: Endpoint,
        ring: &TokenMetadata,
    ) -> RingResult<Vec<TokenRange>>;

    /// The natural replica set of `token` under `ring`.
    async fn natural_endpoints(
        &self,
        token: Token,
        ring: &TokenMetadata,
    ) -> RingResult<HashSet<Endpoint>>;
}
