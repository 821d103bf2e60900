//! Pending-range computation.
//!
//! While membership is in flux, some ranges must be written to more nodes
//! than the replication strategy alone would say: the replacement of a dead
//! node, the future owners of a leaver's ranges, a bootstrapper's claimed
//! ranges. The reasoning errs on the side of writing too much — over-wide
//! ranges are cleaned up after the transition, missed writes are lost.
//!
//! Three independent contributions are unioned into one multimap:
//!
//! 1. **Replace** — every range owned by the replaced node, credited to its
//!    replacement, under the current ring.
//! 2. **Leave** — ranges can only grow when nodes leave, so all leavers are
//!    removed at once from a what-if ring and every affected range is
//!    credited to whoever owns it afterwards but not now.
//! 3. **Bootstrap** — ranges can only shrink when nodes join, so each
//!    bootstrapper is installed alone into the all-left ring and credited
//!    with the ranges it would own there.
//!
//! The result is flattened into a per-keyspace interval map for O(log N)
//! point lookups. This is a heavy computation, run once per cluster state
//! change, and it yields cooperatively throughout.

use std::collections::{BTreeMap, HashMap, HashSet};

use osprey_common::{on_internal_error, Endpoint, RingResult, Token, Yielder};

use crate::metadata::TokenMetadata;
use crate::range::{range_to_interval, IntervalBounds, TokenInterval, TokenRange};
use crate::strategy::{DcRackFn, ReplicationStrategy};
use crate::topology::NodeState;

/// One segment of the interval map: the half-open slice `(start, end]` of
/// the token domain and the replicas pending for it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    /// Exclusive lower bound.
    start: Token,
    /// Inclusive upper bound.
    end: Token,
    endpoints: HashSet<Endpoint>,
}

/// Interval map of pending replicas for one keyspace.
///
/// Stored as disjoint, sorted, half-open segments; overlapping input
/// ranges contribute the union of their replica sets to the overlap.
#[derive(Debug, Clone, Default)]
pub struct PendingRangeMap {
    segments: Vec<Segment>,
}

/// Collapse an interval onto the discrete token domain as a half-open
/// `(start, end]` pair, or `None` if it contains no token.
///
/// The subtraction saturates at the minimum sentinel, which never owns
/// data and is therefore never a meaningful lookup point.
fn normalize(interval: &TokenInterval) -> Option<(Token, Token)> {
    let start = match interval.bounds {
        IntervalBounds::RightOpen | IntervalBounds::Closed => {
            Token(interval.lower.0.saturating_sub(1))
        }
        IntervalBounds::Open | IntervalBounds::LeftOpen => interval.lower,
    };
    let end = match interval.bounds {
        IntervalBounds::LeftOpen | IntervalBounds::Closed => interval.upper,
        IntervalBounds::Open | IntervalBounds::RightOpen => {
            Token(interval.upper.0.saturating_sub(1))
        }
    };
    (start < end).then_some((start, end))
}

impl PendingRangeMap {
    /// Build the map from grouped `range → replicas` input by sweeping all
    /// range boundaries and unioning the sets covering each elementary
    /// slice. Adjacent slices with equal sets are coalesced.
    pub(crate) async fn build(grouped: &HashMap<TokenRange, HashSet<Endpoint>>) -> Self {
        let mut yielder = Yielder::new();

        let mut pieces: Vec<(Token, Token, &HashSet<Endpoint>)> = Vec::new();
        for (range, endpoints) in grouped {
            yielder.maybe_yield().await;
            for part in range.unwrap_at_minimum() {
                if let Some((start, end)) = normalize(&range_to_interval(&part)) {
                    pieces.push((start, end, endpoints));
                }
            }
        }
        if pieces.is_empty() {
            return Self::default();
        }

        let mut bounds: Vec<Token> = pieces.iter().flat_map(|p| [p.0, p.1]).collect();
        bounds.sort_unstable();
        bounds.dedup();

        let mut segments: Vec<Segment> = Vec::new();
        for w in bounds.windows(2) {
            yielder.maybe_yield().await;
            let (start, end) = (w[0], w[1]);
            let mut endpoints = HashSet::new();
            for (s, e, eps) in &pieces {
                if *s <= start && end <= *e {
                    endpoints.extend(eps.iter().copied());
                }
            }
            if endpoints.is_empty() {
                continue;
            }
            match segments.last_mut() {
                Some(last) if last.end == start && last.endpoints == endpoints => {
                    last.end = end;
                }
                _ => segments.push(Segment {
                    start,
                    end,
                    endpoints,
                }),
            }
        }
        Self { segments }
    }

    /// The pending replicas covering `token`, ascending. O(log N).
    pub fn endpoints_for(&self, token: Token) -> Vec<Endpoint> {
        let i = self.segments.partition_point(|seg| seg.end < token);
        match self.segments.get(i) {
            Some(seg) if seg.start < token && token <= seg.end => {
                let mut eps: Vec<Endpoint> = seg.endpoints.iter().copied().collect();
                eps.sort_unstable();
                eps
            }
            _ => Vec::new(),
        }
    }

    /// Whether any segment's replica set contains `endpoint`.
    pub fn contains_endpoint(&self, endpoint: Endpoint) -> bool {
        self.segments.iter().any(|s| s.endpoints.contains(&endpoint))
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

impl TokenMetadata {
    /// The pending replicas of `token` in `keyspace`; empty when the
    /// keyspace has no pending ranges or none covers the token.
    pub fn pending_endpoints_for(&self, token: Token, keyspace: &str) -> Vec<Endpoint> {
        match self.pending_ranges.get(keyspace) {
            Some(map) => map.endpoints_for(token),
            None => Vec::new(),
        }
    }

    /// Whether `endpoint` is a pending replica for any range of `keyspace`.
    pub fn has_pending_ranges(&self, keyspace: &str, endpoint: Endpoint) -> bool {
        self.pending_ranges
            .get(keyspace)
            .is_some_and(|map| map.contains_endpoint(endpoint))
    }

    /// Recompute and publish the pending ranges of `keyspace` from the
    /// current bootstrap/leaving/replacing state.
    pub async fn update_pending_ranges(
        &mut self,
        strategy: &dyn ReplicationStrategy,
        keyspace: &str,
        dc_rack_of: &DcRackFn,
    ) -> RingResult<()> {
        tracing::debug!(
            keyspace,
            bootstrap_tokens = self.bootstrap_tokens.len(),
            leaving = self.leaving_endpoints.len(),
            replacing = self.replacing_endpoints.len(),
            "calculating pending ranges"
        );
        if self.bootstrap_tokens.is_empty()
            && self.leaving_endpoints.is_empty()
            && self.replacing_endpoints.is_empty()
        {
            tracing::debug!(keyspace, "no nodes in transition, pending ranges are empty");
            self.set_pending_ranges(keyspace, Vec::new()).await;
            return Ok(());
        }

        let mut new_pending: Vec<(TokenRange, Endpoint)> = Vec::new();
        self.calculate_pending_ranges_for_replacing(strategy, &mut new_pending)
            .await?;
        // The ring as it will look once every current leaver is gone; both
        // remaining passes reason against it.
        let mut all_left = self.clone_after_all_left().await;
        self.calculate_pending_ranges_for_leaving(strategy, &mut new_pending, &all_left)
            .await?;
        self.calculate_pending_ranges_for_bootstrap(
            strategy,
            &mut new_pending,
            &mut all_left,
            dc_rack_of,
        )
        .await?;
        all_left.clear_gently().await;

        self.set_pending_ranges(keyspace, new_pending).await;
        Ok(())
    }

    /// Pass 1: the replacement inherits every range of the node it
    /// replaces, under the current ring.
    async fn calculate_pending_ranges_for_replacing(
        &self,
        strategy: &dyn ReplicationStrategy,
        new_pending: &mut Vec<(TokenRange, Endpoint)>,
    ) -> RingResult<()> {
        if self.replacing_endpoints.is_empty() {
            return Ok(());
        }
        let mut yielder = Yielder::new();
        let pairs: BTreeMap<Endpoint, Endpoint> = self
            .replacing_endpoints
            .iter()
            .map(|(existing, replacing)| (*existing, *replacing))
            .collect();
        for (existing, replacing) in pairs {
            for range in strategy.ranges_owned(existing, self).await? {
                yielder.maybe_yield().await;
                tracing::debug!(replacing = %replacing, existing = %existing, range = %range,
                    "replacement takes over range");
                new_pending.push((range, replacing));
            }
        }
        Ok(())
    }

    /// Pass 2: for every range a leaver owns today, whoever owns it in the
    /// all-left ring but not in the current one is pending.
    ///
    /// Each affected range is probed at its end bound (or the maximum
    /// sentinel when unbounded), matching the half-open ownership
    /// convention.
    async fn calculate_pending_ranges_for_leaving(
        &self,
        strategy: &dyn ReplicationStrategy,
        new_pending: &mut Vec<(TokenRange, Endpoint)>,
        all_left: &TokenMetadata,
    ) -> RingResult<()> {
        if self.leaving_endpoints.is_empty() {
            return Ok(());
        }
        let mut affected: HashSet<TokenRange> = HashSet::new();
        for endpoint in &self.leaving_endpoints {
            affected.extend(strategy.ranges_owned(*endpoint, self).await?);
        }
        tracing::debug!(affected_ranges = affected.len(),
            "computing future owners of ranges affected by leaving nodes");
        let mut yielder = Yielder::new();
        for range in &affected {
            let probe = range.end_token();
            let current_endpoints = strategy.natural_endpoints(probe, self).await?;
            let new_endpoints = strategy.natural_endpoints(probe, all_left).await?;
            for endpoint in new_endpoints {
                if !current_endpoints.contains(&endpoint) {
                    new_pending.push((range.clone(), endpoint));
                }
            }
            yielder.maybe_yield().await;
        }
        Ok(())
    }

    /// Pass 3: install each bootstrapper alone into the all-left ring,
    /// record what it would own, take it out again. One re-sort at the end.
    async fn calculate_pending_ranges_for_bootstrap(
        &self,
        strategy: &dyn ReplicationStrategy,
        new_pending: &mut Vec<(TokenRange, Endpoint)>,
        all_left: &mut TokenMetadata,
        dc_rack_of: &DcRackFn,
    ) -> RingResult<()> {
        let mut by_endpoint: BTreeMap<Endpoint, HashSet<Token>> = BTreeMap::new();
        for (token, endpoint) in &self.bootstrap_tokens {
            by_endpoint.entry(*endpoint).or_default().insert(*token);
        }
        for (endpoint, tokens) in by_endpoint {
            all_left.update_topology(endpoint, dc_rack_of(endpoint), Some(NodeState::Joining));
            all_left.update_normal_tokens(tokens, endpoint).await?;
            for range in strategy.ranges_owned(endpoint, all_left).await? {
                new_pending.push((range, endpoint));
            }
            all_left.remove_endpoint_unsorted(endpoint);
        }
        all_left.sort_tokens();
        Ok(())
    }

    /// Publish a keyspace's pending multimap as an interval map; an empty
    /// multimap erases the keyspace entry entirely.
    pub(crate) async fn set_pending_ranges(
        &mut self,
        keyspace: &str,
        new_pending: Vec<(TokenRange, Endpoint)>,
    ) {
        if new_pending.is_empty() {
            self.pending_ranges.remove(keyspace);
            return;
        }
        let mut grouped: HashMap<TokenRange, HashSet<Endpoint>> = HashMap::new();
        let mut seen: HashSet<Endpoint> = HashSet::new();
        let mut yielder = Yielder::new();
        for (range, endpoint) in new_pending {
            yielder.maybe_yield().await;
            if seen.insert(endpoint) && !self.topology.has_endpoint(endpoint) {
                on_internal_error(format!(
                    "{endpoint} must be a topology member to receive pending ranges"
                ));
            }
            grouped.entry(range).or_default().insert(endpoint);
        }
        let map = PendingRangeMap::build(&grouped).await;
        tracing::debug!(keyspace, ranges = grouped.len(), segments = map.len(),
            "publishing pending ranges");
        self.pending_ranges.insert(keyspace.to_string(), map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ep(last: u8) -> Endpoint {
        Endpoint(IpAddr::from([10, 0, 0, last]))
    }

    fn set(eps: &[Endpoint]) -> HashSet<Endpoint> {
        eps.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_build_single_range_lookup_edges() {
        let mut grouped = HashMap::new();
        grouped.insert(TokenRange::left_open(Token(20), Token(25)), set(&[ep(4)]));
        let map = PendingRangeMap::build(&grouped).await;

        assert_eq!(map.endpoints_for(Token(20)), Vec::<Endpoint>::new());
        assert_eq!(map.endpoints_for(Token(21)), vec![ep(4)]);
        assert_eq!(map.endpoints_for(Token(25)), vec![ep(4)]);
        assert_eq!(map.endpoints_for(Token(26)), Vec::<Endpoint>::new());
        assert!(map.contains_endpoint(ep(4)));
        assert!(!map.contains_endpoint(ep(1)));
    }

    #[tokio::test]
    async fn test_build_unions_overlapping_ranges() {
        let mut grouped = HashMap::new();
        grouped.insert(TokenRange::left_open(Token(10), Token(30)), set(&[ep(1)]));
        grouped.insert(TokenRange::left_open(Token(20), Token(40)), set(&[ep(2)]));
        let map = PendingRangeMap::build(&grouped).await;

        assert_eq!(map.endpoints_for(Token(15)), vec![ep(1)]);
        assert_eq!(map.endpoints_for(Token(25)), vec![ep(1), ep(2)]);
        assert_eq!(map.endpoints_for(Token(35)), vec![ep(2)]);
        assert_eq!(map.endpoints_for(Token(45)), Vec::<Endpoint>::new());
    }

    #[tokio::test]
    async fn test_build_identical_ranges_share_a_segment() {
        let r = TokenRange::left_open(Token(10), Token(20));
        let mut grouped = HashMap::new();
        grouped.insert(r, set(&[ep(1), ep(2)]));
        let map = PendingRangeMap::build(&grouped).await;

        assert_eq!(map.len(), 1);
        assert_eq!(map.endpoints_for(Token(15)), vec![ep(1), ep(2)]);
    }

    #[tokio::test]
    async fn test_build_splits_wrapping_range() {
        let mut grouped = HashMap::new();
        grouped.insert(TokenRange::left_open(Token(30), Token(10)), set(&[ep(1)]));
        let map = PendingRangeMap::build(&grouped).await;

        assert_eq!(map.endpoints_for(Token(31)), vec![ep(1)]);
        // Coverage runs to the top of the data domain; the maximum sentinel
        // itself never owns data.
        assert_eq!(map.endpoints_for(Token(i64::MAX - 1)), vec![ep(1)]);
        assert_eq!(map.endpoints_for(Token(5)), vec![ep(1)]);
        assert_eq!(map.endpoints_for(Token(10)), vec![ep(1)]);
        assert_eq!(map.endpoints_for(Token(20)), Vec::<Endpoint>::new());
    }

    #[tokio::test]
    async fn test_build_coalesces_adjacent_equal_segments() {
        let mut grouped = HashMap::new();
        grouped.insert(TokenRange::left_open(Token(10), Token(20)), set(&[ep(1)]));
        grouped.insert(TokenRange::left_open(Token(20), Token(30)), set(&[ep(1)]));
        let map = PendingRangeMap::build(&grouped).await;

        assert_eq!(map.len(), 1);
        assert_eq!(map.endpoints_for(Token(20)), vec![ep(1)]);
        assert_eq!(map.endpoints_for(Token(30)), vec![ep(1)]);
    }

    #[tokio::test]
    async fn test_build_empty_input_is_empty_map() {
        let map = PendingRangeMap::build(&HashMap::new()).await;
        assert!(map.is_empty());
        assert_eq!(map.endpoints_for(Token(0)), Vec::<Endpoint>::new());
    }

    #[tokio::test]
    async fn test_normalize_bounds_variants() {
        // [10, 20) covers 10..=19 as (9, 19].
        let i = TokenInterval {
            lower: Token(10),
            upper: Token(20),
            bounds: IntervalBounds::RightOpen,
        };
        assert_eq!(normalize(&i), Some((Token(9), Token(19))));

        // (10, 10] is empty.
        let i = TokenInterval {
            lower: Token(10),
            upper: Token(10),
            bounds: IntervalBounds::LeftOpen,
        };
        assert_eq!(normalize(&i), None);

        // [10, 10] is the single point 10.
        let i = TokenInterval {
            lower: Token(10),
            upper: Token(10),
            bounds: IntervalBounds::Closed,
        };
        assert_eq!(normalize(&i), Some((Token(9), Token(10))));
    }
}
