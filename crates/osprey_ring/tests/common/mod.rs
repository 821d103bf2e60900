//! Shared fixtures: a three-node ring and a minimal RF=1 strategy.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;

use osprey_ring::{
    DcRack, Endpoint, NodeState, ReplicationStrategy, RingError, RingResult, Token,
    TokenMetadata, TokenRange, TopologyConfig,
};

pub fn ep(last: u8) -> Endpoint {
    Endpoint(IpAddr::from([10, 0, 0, last]))
}

pub fn tokens(ts: &[i64]) -> HashSet<Token> {
    ts.iter().map(|t| Token(*t)).collect()
}

pub fn resolver() -> impl Fn(Endpoint) -> DcRack + Send + Sync {
    |_| DcRack::default()
}

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Nodes 1/2/3 at tokens 10/20/30.
pub async fn three_node_ring() -> TokenMetadata {
    init_tracing();
    let mut tm = TokenMetadata::new(TopologyConfig::default());
    for (i, t) in [(1u8, 10i64), (2, 20), (3, 30)] {
        tm.update_topology(ep(i), DcRack::default(), Some(NodeState::Normal));
        tm.update_normal_tokens(tokens(&[t]), ep(i)).await.unwrap();
    }
    tm
}

/// Replication factor 1: the natural endpoint of a token is the owner of
/// the first token at or after it, wrapping. An endpoint therefore owns
/// exactly its primary ranges.
pub struct FirstOwnerStrategy;

#[async_trait]
impl ReplicationStrategy for FirstOwnerStrategy {
    async fn ranges_owned(
        &self,
        endpoint: Endpoint,
        ring: &TokenMetadata,
    ) -> RingResult<Vec<TokenRange>> {
        ring.get_primary_ranges_for(ring.get_tokens(endpoint))
    }

    async fn natural_endpoints(
        &self,
        token: Token,
        ring: &TokenMetadata,
    ) -> RingResult<HashSet<Endpoint>> {
        let owner_token = ring
            .first_token(token)
            .map_err(|e| RingError::Strategy(e.to_string()))?;
        Ok(ring.get_endpoint(owner_token).into_iter().collect())
    }
}

/// Always fails; exercises error propagation out of the pending-range
/// engine.
pub struct BrokenStrategy;

#[async_trait]
impl ReplicationStrategy for BrokenStrategy {
    async fn ranges_owned(
        &self,
        _endpoint: Endpoint,
        _ring: &TokenMetadata,
    ) -> RingResult<Vec<TokenRange>> {
        Err(RingError::Strategy("placement service unavailable".into()))
    }

    async fn natural_endpoints(
        &self,
        _token: Token,
        _ring: &TokenMetadata,
    ) -> RingResult<HashSet<Endpoint>> {
        Err(RingError::Strategy("placement service unavailable".into()))
    }
}
