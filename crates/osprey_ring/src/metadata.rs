//! The authoritative in-memory model of ring membership as seen from one
//! node: who owns which tokens, who is joining, leaving, or being replaced.
//!
//! A [`TokenMetadata`] value is used in two modes. Behind a
//! [`SharedTokenMetadata`](crate::shared::SharedTokenMetadata) it is an
//! immutable published snapshot that readers query lock-free. Inside a
//! mutator it is a private deep clone that is edited and then republished
//! wholesale. Nothing in this module locks; the holder serialises writers.
//!
//! Every loop over a user-sized container yields cooperatively so that a
//! large cluster's token map cannot stall the core (see
//! [`osprey_common::stall`]).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use osprey_common::{
    stall, DcRack, Endpoint, HostId, RingError, RingResult, RingVersion, Token, Yielder,
};

use crate::pending::PendingRangeMap;
use crate::range::{RingRange, TokenRange};
use crate::topology::{NodeState, Topology, TopologyConfig};

/// Process-wide ring version source. Every mutation that may invalidate a
/// derived cache draws its snapshot version from here, so versions are
/// strictly increasing across all holders in the process.
static RING_VERSION: AtomicU64 = AtomicU64::new(0);

fn remove_by_value<K, V>(map: &mut HashMap<K, V>, value: &V)
where
    K: Eq + Hash,
    V: PartialEq,
{
    map.retain(|_, v| v != value);
}

/// Token-ring membership state plus per-keyspace pending ranges.
#[derive(Debug, Default)]
pub struct TokenMetadata {
    /// Token → owning endpoint for every normal token. Each token has
    /// exactly one owner; an endpoint may own many tokens.
    pub(crate) token_to_endpoint: HashMap<Token, Endpoint>,
    /// The unique set of endpoints appearing as values of
    /// `token_to_endpoint`.
    pub(crate) normal_owners: HashSet<Endpoint>,
    pub(crate) bootstrap_tokens: HashMap<Token, Endpoint>,
    pub(crate) leaving_endpoints: HashSet<Endpoint>,
    /// Existing node being replaced → its replacement.
    pub(crate) replacing_endpoints: HashMap<Endpoint, Endpoint>,
    pub(crate) pending_ranges: HashMap<String, PendingRangeMap>,
    /// Ascending keys of `token_to_endpoint`.
    pub(crate) sorted_tokens: Vec<Token>,
    pub(crate) topology: Topology,
    pub(crate) ring_version: RingVersion,
}

impl TokenMetadata {
    pub fn new(cfg: TopologyConfig) -> Self {
        Self {
            topology: Topology::new(cfg),
            ..Default::default()
        }
    }

    // ── Token algebra ───────────────────────────────────────────────────

    pub fn sorted_tokens(&self) -> &[Token] {
        &self.sorted_tokens
    }

    /// Smallest index `i` with `sorted_tokens[i] >= start`, wrapping to 0
    /// past the end.
    pub fn first_token_index(&self, start: Token) -> RingResult<usize> {
        if self.sorted_tokens.is_empty() {
            tracing::error!("first_token_index called on an empty ring");
            return Err(RingError::EmptyRing);
        }
        let i = self.sorted_tokens.partition_point(|t| *t < start);
        Ok(if i == self.sorted_tokens.len() { 0 } else { i })
    }

    /// The first token at or after `start`, wrapping.
    pub fn first_token(&self, start: Token) -> RingResult<Token> {
        Ok(self.sorted_tokens[self.first_token_index(start)?])
    }

    /// The token immediately before `t` on the ring; the first token's
    /// predecessor is the last.
    pub fn predecessor(&self, t: Token) -> RingResult<Token> {
        if self.sorted_tokens.is_empty() {
            return Err(RingError::EmptyRing);
        }
        let i = self.sorted_tokens.partition_point(|x| *x < t);
        if i == self.sorted_tokens.len() || self.sorted_tokens[i] != t {
            return Err(RingError::UnknownToken(t));
        }
        Ok(if i == 0 {
            *self.sorted_tokens.last().unwrap()
        } else {
            self.sorted_tokens[i - 1]
        })
    }

    /// Walk every sorted token exactly once, starting at the first token
    /// ≥ `start` and wrapping.
    pub fn ring_range(&self, start: Token) -> RingResult<RingRange<'_>> {
        let first = self.first_token_index(start)?;
        Ok(RingRange::new(&self.sorted_tokens, first))
    }

    // ── Topology ────────────────────────────────────────────────────────

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Insert or refresh an endpoint's placement and state in the topology.
    pub fn update_topology(
        &mut self,
        endpoint: Endpoint,
        dc_rack: DcRack,
        state: Option<NodeState>,
    ) {
        self.topology.add_or_update_endpoint(endpoint, dc_rack, state);
    }

    /// Bind a host id to an endpoint (or reassert an existing binding).
    pub fn update_host_id(&mut self, host_id: HostId, endpoint: Endpoint) -> RingResult<()> {
        self.topology.set_host_id(endpoint, host_id)
    }

    /// Endpoint → host id for every endpoint whose id has been learned.
    pub fn endpoint_to_host_id_map(&self) -> HashMap<Endpoint, HostId> {
        self.topology
            .entries()
            .iter()
            .filter_map(|(ep, entry)| entry.host_id.map(|id| (*ep, id)))
            .collect()
    }

    // ── Ring mutations ──────────────────────────────────────────────────

    /// Declare `endpoint`'s normal token set to be exactly `tokens`.
    ///
    /// Phase 1 walks the existing map: tokens the endpoint no longer owns
    /// are dropped, tokens it already owns are stripped from the input so
    /// only genuinely new keys are inserted (and only those trigger a
    /// re-sort). Phase 2 clears the endpoint's bootstrap/leaving markers,
    /// bumps the ring version and installs the remaining tokens, stealing
    /// ownership from any stale owner.
    pub async fn update_normal_tokens(
        &mut self,
        mut tokens: HashSet<Token>,
        endpoint: Endpoint,
    ) -> RingResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        if !self.topology.has_endpoint(endpoint) {
            return Err(RingError::UnknownEndpoint(endpoint));
        }

        // Phase 1: erase all tokens previously owned by the endpoint.
        let mut stale: Vec<Token> = Vec::new();
        let mut yielder = Yielder::new();
        for (t, ep) in &self.token_to_endpoint {
            yielder.maybe_yield().await;
            if *ep == endpoint && !tokens.remove(t) {
                // Token no longer owned by the endpoint.
                stale.push(*t);
            }
        }
        let mut should_sort_tokens = !stale.is_empty();
        for t in &stale {
            self.token_to_endpoint.remove(t);
        }

        // Phase 2: the endpoint is normal now, whatever it was before.
        remove_by_value(&mut self.bootstrap_tokens, &endpoint);
        self.leaving_endpoints.remove(&endpoint);
        self.invalidate_cached_rings();
        let mut yielder = Yielder::new();
        for t in tokens {
            yielder.maybe_yield().await;
            match self.token_to_endpoint.insert(t, endpoint) {
                None => should_sort_tokens = true,
                Some(prev) if prev != endpoint => {
                    tracing::debug!(token = %t, from = %prev, to = %endpoint,
                        "token changing ownership");
                }
                Some(_) => {}
            }
        }

        self.update_normal_token_owners().await;
        if should_sort_tokens {
            self.sort_tokens();
        }
        Ok(())
    }

    /// Claim a single bootstrap token for a joining endpoint.
    pub fn add_bootstrap_token(&mut self, token: Token, endpoint: Endpoint) -> RingResult<()> {
        self.add_bootstrap_tokens(HashSet::from([token]), endpoint)
    }

    /// Claim bootstrap tokens for a joining endpoint, replacing any tokens
    /// it claimed before.
    ///
    /// Fails with [`RingError::TokenCollision`] — before touching any state
    /// — if a token is already claimed or owned by a different endpoint.
    pub fn add_bootstrap_tokens(
        &mut self,
        tokens: HashSet<Token>,
        endpoint: Endpoint,
    ) -> RingResult<()> {
        for &t in &tokens {
            if let Some(&owner) = self.bootstrap_tokens.get(&t) {
                if owner != endpoint {
                    return Err(RingError::TokenCollision {
                        token: t,
                        owner,
                        candidate: endpoint,
                    });
                }
            }
            if let Some(&owner) = self.token_to_endpoint.get(&t) {
                if owner != endpoint {
                    return Err(RingError::TokenCollision {
                        token: t,
                        owner,
                        candidate: endpoint,
                    });
                }
            }
        }

        remove_by_value(&mut self.bootstrap_tokens, &endpoint);
        for t in tokens {
            self.bootstrap_tokens.insert(t, endpoint);
        }
        Ok(())
    }

    /// Drop the given bootstrap token claims.
    pub fn remove_bootstrap_tokens(&mut self, tokens: HashSet<Token>) {
        if tokens.is_empty() {
            tracing::warn!("remove_bootstrap_tokens called with no tokens");
            return;
        }
        for t in tokens {
            self.bootstrap_tokens.remove(&t);
        }
    }

    pub fn add_leaving_endpoint(&mut self, endpoint: Endpoint) {
        self.leaving_endpoints.insert(endpoint);
    }

    pub fn del_leaving_endpoint(&mut self, endpoint: Endpoint) {
        self.leaving_endpoints.remove(&endpoint);
    }

    /// Record that `replacing` is taking over `existing`'s tokens.
    pub fn add_replacing_endpoint(&mut self, existing: Endpoint, replacing: Endpoint) {
        tracing::info!(existing = %existing, replacing = %replacing,
            "added pending replacing endpoint");
        self.replacing_endpoints.insert(existing, replacing);
    }

    pub fn del_replacing_endpoint(&mut self, existing: Endpoint) {
        if let Some(replacing) = self.replacing_endpoints.remove(&existing) {
            tracing::info!(existing = %existing, replacing = %replacing,
                "removed pending replacing endpoint");
        }
    }

    /// Scrub an endpoint from every structure and re-sort the token vector.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        self.remove_endpoint_unsorted(endpoint);
        self.sort_tokens();
    }

    /// Scrub without re-sorting; callers batching several removals sort
    /// once at the end.
    pub(crate) fn remove_endpoint_unsorted(&mut self, endpoint: Endpoint) {
        remove_by_value(&mut self.bootstrap_tokens, &endpoint);
        remove_by_value(&mut self.token_to_endpoint, &endpoint);
        self.normal_owners.remove(&endpoint);
        self.topology.remove_endpoint(endpoint);
        self.leaving_endpoints.remove(&endpoint);
        self.del_replacing_endpoint(endpoint);
        self.invalidate_cached_rings();
    }

    pub(crate) fn sort_tokens(&mut self) {
        let mut sorted: Vec<Token> = self.token_to_endpoint.keys().copied().collect();
        sorted.sort_unstable();
        self.sorted_tokens = sorted;
    }

    async fn update_normal_token_owners(&mut self) {
        let mut owners = HashSet::with_capacity(self.normal_owners.len());
        let mut yielder = Yielder::new();
        for ep in self.token_to_endpoint.values() {
            owners.insert(*ep);
            yielder.maybe_yield().await;
        }
        self.normal_owners = owners;
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn get_endpoint(&self, token: Token) -> Option<Endpoint> {
        self.token_to_endpoint.get(&token).copied()
    }

    /// All normal tokens of an endpoint, ascending.
    pub fn get_tokens(&self, endpoint: Endpoint) -> Vec<Token> {
        let mut res: Vec<Token> = self
            .token_to_endpoint
            .iter()
            .filter(|(_, ep)| **ep == endpoint)
            .map(|(t, _)| *t)
            .collect();
        res.sort_unstable();
        res
    }

    pub fn is_normal_token_owner(&self, endpoint: Endpoint) -> bool {
        self.normal_owners.contains(&endpoint)
    }

    pub fn is_leaving(&self, endpoint: Endpoint) -> bool {
        self.leaving_endpoints.contains(&endpoint)
    }

    /// Is this node being replaced by another node.
    pub fn is_being_replaced(&self, endpoint: Endpoint) -> bool {
        self.replacing_endpoints.contains_key(&endpoint)
    }

    pub fn is_any_node_being_replaced(&self) -> bool {
        !self.replacing_endpoints.is_empty()
    }

    /// Endpoints officially part of the ring; joining nodes are not
    /// included until they turn normal.
    pub fn normal_token_owners(&self) -> &HashSet<Endpoint> {
        &self.normal_owners
    }

    pub fn count_normal_token_owners(&self) -> usize {
        self.normal_owners.len()
    }

    pub fn token_to_endpoint(&self) -> &HashMap<Token, Endpoint> {
        &self.token_to_endpoint
    }

    pub fn bootstrap_tokens(&self) -> &HashMap<Token, Endpoint> {
        &self.bootstrap_tokens
    }

    pub fn leaving_endpoints(&self) -> &HashSet<Endpoint> {
        &self.leaving_endpoints
    }

    pub fn replacing_endpoints(&self) -> &HashMap<Endpoint, Endpoint> {
        &self.replacing_endpoints
    }

    /// For each input token `r`, the primary range `(predecessor(r), r]`,
    /// unwrapped across the minimum sentinel into at most two non-wrapping
    /// sub-ranges.
    pub fn get_primary_ranges_for(
        &self,
        tokens: impl IntoIterator<Item = Token>,
    ) -> RingResult<Vec<TokenRange>> {
        let mut ranges = Vec::new();
        for right in tokens {
            let left = self.predecessor(right)?;
            ranges.extend(TokenRange::left_open(left, right).unwrap_at_minimum());
        }
        Ok(ranges)
    }

    /// Endpoint → its sorted tokens, endpoints ascending. A stable copy
    /// for read-only walkers.
    pub fn endpoint_to_token_map(&self) -> BTreeMap<Endpoint, Vec<Token>> {
        let mut map: BTreeMap<Endpoint, Vec<Token>> = BTreeMap::new();
        for (t, ep) in &self.token_to_endpoint {
            map.entry(*ep).or_default().push(*t);
        }
        for tokens in map.values_mut() {
            tokens.sort_unstable();
        }
        map
    }

    /// Token → endpoint over both the normal and the bootstrapping nodes,
    /// ascending by token.
    pub fn normal_and_bootstrapping_token_to_endpoint_map(&self) -> BTreeMap<Token, Endpoint> {
        let mut map: BTreeMap<Token, Endpoint> = self
            .token_to_endpoint
            .iter()
            .map(|(t, ep)| (*t, *ep))
            .collect();
        map.extend(self.bootstrap_tokens.iter().map(|(t, ep)| (*t, *ep)));
        map
    }

    pub fn ring_version(&self) -> RingVersion {
        self.ring_version
    }

    /// Stamp this instance with a fresh, process-unique ring version.
    ///
    /// External caches key on `(keyspace, ring_version)` and thereby
    /// auto-invalidate when the stamped snapshot is published.
    pub fn invalidate_cached_rings(&mut self) {
        self.ring_version = RING_VERSION.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(ring_version = self.ring_version, "ring version bumped");
    }

    // ── Snapshot lifecycle ──────────────────────────────────────────────

    /// Full deep copy, yielding between elements.
    pub async fn clone_async(&self) -> TokenMetadata {
        let mut ret = self.clone_only_token_map(true).await;
        let mut yielder = Yielder::new();
        ret.bootstrap_tokens.reserve(self.bootstrap_tokens.len());
        for (t, ep) in &self.bootstrap_tokens {
            ret.bootstrap_tokens.insert(*t, *ep);
            yielder.maybe_yield().await;
        }
        ret.leaving_endpoints = self.leaving_endpoints.clone();
        ret.replacing_endpoints = self.replacing_endpoints.clone();
        for (ks, map) in &self.pending_ranges {
            ret.pending_ranges.insert(ks.clone(), map.clone());
            yielder.maybe_yield().await;
        }
        ret.ring_version = self.ring_version;
        ret
    }

    /// Copy carrying only the topology and the normal token map (and
    /// optionally the sorted token vector). Bootstrap tokens, leaving and
    /// replacing endpoints, pending ranges and the ring version are not
    /// included.
    pub async fn clone_only_token_map(&self, include_sorted_tokens: bool) -> TokenMetadata {
        let mut ret = TokenMetadata::new(TopologyConfig::default());
        let mut yielder = Yielder::new();
        ret.token_to_endpoint.reserve(self.token_to_endpoint.len());
        for (t, ep) in &self.token_to_endpoint {
            ret.token_to_endpoint.insert(*t, *ep);
            yielder.maybe_yield().await;
        }
        ret.normal_owners = self.normal_owners.clone();
        ret.topology = self.topology.clone_gently().await;
        if include_sorted_tokens {
            ret.sorted_tokens = self.sorted_tokens.clone();
        }
        ret
    }

    /// The what-if ring after every current leave operation has finished.
    pub async fn clone_after_all_left(&self) -> TokenMetadata {
        let mut ret = self.clone_only_token_map(false).await;
        for ep in &self.leaving_endpoints {
            ret.remove_endpoint_unsorted(*ep);
        }
        ret.sort_tokens();
        ret
    }

    /// Drop every container in yield-bounded batches.
    pub async fn clear_gently(&mut self) {
        stall::clear_gently(mem::take(&mut self.token_to_endpoint)).await;
        stall::clear_gently(mem::take(&mut self.normal_owners)).await;
        stall::clear_gently(mem::take(&mut self.bootstrap_tokens)).await;
        stall::clear_gently(mem::take(&mut self.leaving_endpoints)).await;
        stall::clear_gently(mem::take(&mut self.replacing_endpoints)).await;
        stall::clear_gently(mem::take(&mut self.pending_ranges)).await;
        stall::clear_gently(mem::take(&mut self.sorted_tokens)).await;
        self.topology.clear_gently().await;
    }
}
