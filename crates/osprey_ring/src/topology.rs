//! Topology registry: per-endpoint placement, node state, and the
//! endpoint ↔ host-id bijection.
//!
//! The registry is deliberately dumb storage with two secondary indexes
//! (by host id, by datacenter). Replication strategies interpret the
//! placement data through the resolver seam; the registry never does.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use osprey_common::{DcRack, Endpoint, HostId, RingError, RingResult, Yielder};

/// Which snitch implementation feeds placement data into the registry.
///
/// Opaque to the engine; recorded so collaborators can tell how the
/// `DcRack` values were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnitchKind {
    /// Everything in one synthetic datacenter/rack.
    #[default]
    Simple,
    /// Placement read from node-local configuration.
    PropertyFile,
}

/// Configuration passed through to the topology registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Placement of the local node.
    pub local_dc_rack: DcRack,
    /// Disables latency-based replica ordering in consumers; the registry
    /// only stores the flag.
    pub disable_proximity_sorting: bool,
    /// Where placement data comes from.
    pub snitch_kind: SnitchKind,
}

/// Membership state of a node, at most one per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Joining,
    Normal,
    Leaving,
    Replacing,
    Left,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Joining => "joining",
            NodeState::Normal => "normal",
            NodeState::Leaving => "leaving",
            NodeState::Replacing => "replacing",
            NodeState::Left => "left",
        };
        f.write_str(s)
    }
}

/// Everything the registry knows about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    /// `None` until the host id has been learned; "known but unset".
    pub host_id: Option<HostId>,
    pub dc_rack: DcRack,
    pub state: Option<NodeState>,
}

/// Registry of cluster nodes as seen from this node.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    cfg: TopologyConfig,
    entries: HashMap<Endpoint, TopologyEntry>,
    by_host_id: HashMap<HostId, Endpoint>,
    by_dc: HashMap<String, HashSet<Endpoint>>,
}

impl Topology {
    pub fn new(cfg: TopologyConfig) -> Self {
        Self {
            cfg,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.cfg
    }

    /// Insert or refresh an endpoint's placement and (when given) state.
    ///
    /// Idempotent: repeating the same call is a no-op.
    pub fn add_or_update_endpoint(
        &mut self,
        endpoint: Endpoint,
        dc_rack: DcRack,
        state: Option<NodeState>,
    ) {
        if let Some(entry) = self.entries.get(&endpoint) {
            if entry.dc_rack.dc != dc_rack.dc {
                let old_dc = entry.dc_rack.dc.clone();
                self.unindex_dc(endpoint, &old_dc);
                self.by_dc
                    .entry(dc_rack.dc.clone())
                    .or_default()
                    .insert(endpoint);
            }
            let entry = self.entries.get_mut(&endpoint).unwrap();
            entry.dc_rack = dc_rack;
            if let Some(state) = state {
                entry.state = Some(state);
            }
        } else {
            self.by_dc
                .entry(dc_rack.dc.clone())
                .or_default()
                .insert(endpoint);
            self.entries.insert(
                endpoint,
                TopologyEntry {
                    host_id: None,
                    dc_rack,
                    state,
                },
            );
        }
    }

    /// Establish or reassert the endpoint ↔ host-id bijection.
    ///
    /// A host id can never move to another endpoint and an endpoint can
    /// never change its host id; either attempt is a [`RingError::HostIdConflict`].
    /// An endpoint the registry has not seen yet is created with default
    /// placement and no state.
    pub fn set_host_id(&mut self, endpoint: Endpoint, host_id: HostId) -> RingResult<()> {
        if let Some(bound) = self.by_host_id.get(&host_id) {
            if *bound != endpoint {
                return Err(RingError::HostIdConflict { endpoint, host_id });
            }
        }
        if let Some(entry) = self.entries.get(&endpoint) {
            if let Some(existing) = entry.host_id {
                if existing != host_id {
                    return Err(RingError::HostIdConflict { endpoint, host_id });
                }
            }
        } else {
            self.add_or_update_endpoint(endpoint, DcRack::default(), None);
        }
        self.entries.get_mut(&endpoint).unwrap().host_id = Some(host_id);
        self.by_host_id.insert(host_id, endpoint);
        Ok(())
    }

    /// Drop an endpoint and its secondary index slots.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        if let Some(entry) = self.entries.remove(&endpoint) {
            if let Some(host_id) = entry.host_id {
                self.by_host_id.remove(&host_id);
            }
            self.unindex_dc(endpoint, &entry.dc_rack.dc);
        }
    }

    pub fn has_endpoint(&self, endpoint: Endpoint) -> bool {
        self.entries.contains_key(&endpoint)
    }

    pub fn entry(&self, endpoint: Endpoint) -> Option<&TopologyEntry> {
        self.entries.get(&endpoint)
    }

    pub fn entry_by_host_id(&self, host_id: HostId) -> Option<&TopologyEntry> {
        self.by_host_id
            .get(&host_id)
            .and_then(|ep| self.entries.get(ep))
    }

    pub fn endpoint_of(&self, host_id: HostId) -> Option<Endpoint> {
        self.by_host_id.get(&host_id).copied()
    }

    pub fn host_id_of(&self, endpoint: Endpoint) -> Option<HostId> {
        self.entries.get(&endpoint).and_then(|e| e.host_id)
    }

    pub fn endpoints_in_dc(&self, dc: &str) -> impl Iterator<Item = Endpoint> + '_ {
        self.by_dc.get(dc).into_iter().flatten().copied()
    }

    pub fn entries(&self) -> &HashMap<Endpoint, TopologyEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Element-wise snapshot copy with yield points.
    pub async fn clone_gently(&self) -> Topology {
        let mut yielder = Yielder::new();
        let mut ret = Topology::new(self.cfg.clone());
        ret.entries.reserve(self.entries.len());
        for (ep, entry) in &self.entries {
            ret.entries.insert(*ep, entry.clone());
            yielder.maybe_yield().await;
        }
        ret.by_host_id.reserve(self.by_host_id.len());
        for (id, ep) in &self.by_host_id {
            ret.by_host_id.insert(*id, *ep);
            yielder.maybe_yield().await;
        }
        for (dc, eps) in &self.by_dc {
            ret.by_dc.insert(dc.clone(), eps.clone());
            yielder.maybe_yield().await;
        }
        ret
    }

    /// Drop all entries in yield-bounded batches.
    pub async fn clear_gently(&mut self) {
        osprey_common::clear_gently(std::mem::take(&mut self.entries)).await;
        osprey_common::clear_gently(std::mem::take(&mut self.by_host_id)).await;
        osprey_common::clear_gently(std::mem::take(&mut self.by_dc)).await;
    }

    fn unindex_dc(&mut self, endpoint: Endpoint, dc: &str) {
        if let Some(set) = self.by_dc.get_mut(dc) {
            set.remove(&endpoint);
            if set.is_empty() {
                self.by_dc.remove(dc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ep(last: u8) -> Endpoint {
        Endpoint(IpAddr::from([10, 0, 0, last]))
    }

    #[test]
    fn test_add_or_update_is_idempotent() {
        let mut topo = Topology::new(TopologyConfig::default());
        let dr = DcRack::new("dc1", "r1");
        topo.add_or_update_endpoint(ep(1), dr.clone(), Some(NodeState::Normal));
        topo.add_or_update_endpoint(ep(1), dr.clone(), Some(NodeState::Normal));
        assert_eq!(topo.len(), 1);
        assert_eq!(topo.entry(ep(1)).unwrap().state, Some(NodeState::Normal));
        assert_eq!(topo.entry(ep(1)).unwrap().dc_rack, dr);
    }

    #[test]
    fn test_update_keeps_state_when_none_given() {
        let mut topo = Topology::new(TopologyConfig::default());
        topo.add_or_update_endpoint(ep(1), DcRack::new("dc1", "r1"), Some(NodeState::Joining));
        topo.add_or_update_endpoint(ep(1), DcRack::new("dc1", "r2"), None);
        let entry = topo.entry(ep(1)).unwrap();
        assert_eq!(entry.state, Some(NodeState::Joining));
        assert_eq!(entry.dc_rack.rack, "r2");
    }

    #[test]
    fn test_dc_index_follows_moves() {
        let mut topo = Topology::new(TopologyConfig::default());
        topo.add_or_update_endpoint(ep(1), DcRack::new("east", "r1"), None);
        topo.add_or_update_endpoint(ep(2), DcRack::new("east", "r2"), None);
        assert_eq!(topo.endpoints_in_dc("east").count(), 2);

        topo.add_or_update_endpoint(ep(2), DcRack::new("west", "r1"), None);
        assert_eq!(topo.endpoints_in_dc("east").count(), 1);
        assert_eq!(topo.endpoints_in_dc("west").count(), 1);

        topo.remove_endpoint(ep(1));
        assert_eq!(topo.endpoints_in_dc("east").count(), 0);
    }

    #[test]
    fn test_host_id_bijection() {
        let mut topo = Topology::new(TopologyConfig::default());
        let id_a = HostId::random();
        let id_b = HostId::random();
        topo.add_or_update_endpoint(ep(1), DcRack::default(), None);

        topo.set_host_id(ep(1), id_a).unwrap();
        // Reasserting the same binding is fine.
        topo.set_host_id(ep(1), id_a).unwrap();
        assert_eq!(topo.endpoint_of(id_a), Some(ep(1)));
        assert_eq!(topo.host_id_of(ep(1)), Some(id_a));

        // Same host id on another endpoint: conflict.
        assert!(matches!(
            topo.set_host_id(ep(2), id_a),
            Err(RingError::HostIdConflict { .. })
        ));
        // Another host id on the same endpoint: conflict.
        assert!(matches!(
            topo.set_host_id(ep(1), id_b),
            Err(RingError::HostIdConflict { .. })
        ));
    }

    #[test]
    fn test_unknown_host_id_is_none_not_error() {
        let mut topo = Topology::new(TopologyConfig::default());
        topo.add_or_update_endpoint(ep(1), DcRack::default(), None);
        // Known endpoint, host id not yet learned.
        assert_eq!(topo.host_id_of(ep(1)), None);
        assert_eq!(topo.endpoint_of(HostId::random()), None);
    }

    #[test]
    fn test_set_host_id_creates_missing_endpoint() {
        let mut topo = Topology::new(TopologyConfig::default());
        let id = HostId::random();
        topo.set_host_id(ep(9), id).unwrap();
        assert!(topo.has_endpoint(ep(9)));
        assert_eq!(topo.entry(ep(9)).unwrap().state, None);
    }

    #[test]
    fn test_remove_clears_all_indexes() {
        let mut topo = Topology::new(TopologyConfig::default());
        let id = HostId::random();
        topo.add_or_update_endpoint(ep(1), DcRack::new("east", "r1"), Some(NodeState::Normal));
        topo.set_host_id(ep(1), id).unwrap();

        topo.remove_endpoint(ep(1));
        assert!(!topo.has_endpoint(ep(1)));
        assert_eq!(topo.endpoint_of(id), None);
        assert_eq!(topo.endpoints_in_dc("east").count(), 0);
    }

    #[tokio::test]
    async fn test_clone_gently_is_deep_and_equal() {
        let mut topo = Topology::new(TopologyConfig::default());
        for i in 1..=50 {
            topo.add_or_update_endpoint(
                ep(i),
                DcRack::new(format!("dc{}", i % 3), "r1"),
                Some(NodeState::Normal),
            );
        }
        let mut copy = topo.clone_gently().await;
        assert_eq!(copy.entries(), topo.entries());

        copy.remove_endpoint(ep(1));
        assert!(topo.has_endpoint(ep(1)));
    }
}
