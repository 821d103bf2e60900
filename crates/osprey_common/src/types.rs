//! Core value types of the ring model.
//!
//! All of these are plain newtypes: cheap to copy, value-comparable, and
//! hashable, so they can key the maps the engine is built out of.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A position on the consistent-hashing ring.
///
/// The domain is circular: range operations wrap from [`Token::MAXIMUM`]
/// back to [`Token::MINIMUM`]. The two sentinels compare below and above
/// every data token respectively and never own data themselves.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Token(pub i64);

impl Token {
    /// Sentinel below every data token.
    pub const MINIMUM: Token = Token(i64::MIN);
    /// Sentinel above every data token.
    pub const MAXIMUM: Token = Token(i64::MAX);
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Token::MINIMUM => write!(f, "-inf"),
            Token::MAXIMUM => write!(f, "+inf"),
            Token(v) => write!(f, "{}", v),
        }
    }
}

/// Network address of a cluster node.
///
/// An endpoint may be reassigned over a node's lifetime; [`HostId`] is the
/// stable identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Endpoint(pub IpAddr);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpAddr::from_str(s).map(Endpoint)
    }
}

impl From<IpAddr> for Endpoint {
    fn from(addr: IpAddr) -> Self {
        Endpoint(addr)
    }
}

/// Stable 128-bit identifier of a cluster node, independent of its endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HostId(pub Uuid);

impl HostId {
    /// Generate a fresh random host id.
    pub fn random() -> Self {
        HostId(Uuid::new_v4())
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for HostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s).map(HostId)
    }
}

/// Datacenter / rack placement of an endpoint, as reported by the snitch.
///
/// Opaque to the engine; replication strategies interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DcRack {
    pub dc: String,
    pub rack: String,
}

impl DcRack {
    pub fn new(dc: impl Into<String>, rack: impl Into<String>) -> Self {
        Self {
            dc: dc.into(),
            rack: rack.into(),
        }
    }
}

impl Default for DcRack {
    fn default() -> Self {
        Self {
            dc: "datacenter1".to_string(),
            rack: "rack1".to_string(),
        }
    }
}

impl fmt::Display for DcRack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dc, self.rack)
    }
}

/// Monotonically increasing counter labelling published ring snapshots.
///
/// External caches key themselves on `(keyspace, ring_version)` and thereby
/// auto-invalidate on every membership change.
pub type RingVersion = u64;
