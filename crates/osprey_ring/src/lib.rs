//! Token-ring metadata engine — the authoritative in-memory model of
//! cluster membership as seen from one node.
//!
//! The engine tracks which endpoints own which positions on the token
//! ring, which nodes are joining, leaving, or being replaced, and which
//! ranges transiently need extra write replicas while membership is in
//! flux. It performs no I/O and coordinates no consensus; replication
//! strategies, gossip, and storage are external collaborators behind the
//! seams in [`strategy`].
//!
//! # Architecture
//!
//! ```text
//!   membership events ──▶ SharedTokenMetadata::mutate (one holder per core)
//!                              │  clone_async + version bump
//!                              ▼
//!                         TokenMetadata (private clone)
//!                              │  ring mutations, update_pending_ranges
//!                              ▼
//!                         atomic publish ──▶ lock-free readers
//! ```
//!
//! Readers never lock and never yield; every mutation path over a
//! user-sized container yields cooperatively.

pub mod metadata;
pub mod parse;
pub mod pending;
pub mod range;
pub mod shared;
pub mod strategy;
pub mod topology;

pub use metadata::TokenMetadata;
pub use parse::{HostIdOrEndpoint, ParseMode};
pub use pending::PendingRangeMap;
pub use range::{
    interval_to_range, range_to_interval, IntervalBounds, RangeBound, RingRange, TokenInterval,
    TokenRange,
};
pub use shared::{Mutator, SharedTokenMetadata};
pub use strategy::{DcRackFn, ReplicationStrategy};
pub use topology::{NodeState, SnitchKind, Topology, TopologyConfig, TopologyEntry};

pub use osprey_common::{DcRack, Endpoint, HostId, RingError, RingResult, RingVersion, Token};
