//! Versioned publication of ring snapshots.
//!
//! One holder per core, shared-nothing: readers load the current snapshot
//! pointer lock-free and never coordinate with writers; writers serialise
//! on the holder's async mutex, edit a private deep clone, and publish it
//! atomically. Cross-core agreement is the coordinator's job
//! ([`SharedTokenMetadata::mutate_on_all_shards`]): clone everywhere first,
//! publish everywhere second, so no failure can leave the cores split.

use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use osprey_common::{on_internal_error, RingResult};

use crate::metadata::TokenMetadata;
use crate::topology::TopologyConfig;

/// A mutator: borrows the writer's private clone, returns a future that
/// edits it. A failing mutator aborts publication.
pub type Mutator<'a> = BoxFuture<'a, RingResult<()>>;

/// Per-core holder of the current ring snapshot.
pub struct SharedTokenMetadata {
    shared: ArcSwap<TokenMetadata>,
    /// Serialises writers; intentionally held across the mutator's await.
    write_lock: Mutex<()>,
}

impl SharedTokenMetadata {
    pub fn new(cfg: TopologyConfig) -> Self {
        Self {
            shared: ArcSwap::from_pointee(TokenMetadata::new(cfg)),
            write_lock: Mutex::new(()),
        }
    }

    /// The currently published snapshot. Lock-free, O(1); the returned
    /// `Arc` keeps the snapshot alive for as long as the reader holds it.
    pub fn get(&self) -> Arc<TokenMetadata> {
        self.shared.load_full()
    }

    /// Publish a snapshot.
    ///
    /// Publishing a version that does not advance the ring is a contract
    /// violation and aborts the process: external caches key on the
    /// version, and a regression would serve them stale rings forever.
    pub fn set(&self, tm: Arc<TokenMetadata>) {
        let current = self.shared.load();
        if current.ring_version() >= tm.ring_version() {
            on_internal_error(format!(
                "must not publish non-increasing ring version: {} -> {}",
                current.ring_version(),
                tm.ring_version()
            ));
        }
        self.shared.store(tm);
    }

    /// Clone the current snapshot, hand it to `func`, and publish the
    /// result under a fresh ring version.
    ///
    /// Writers are serialised; readers keep seeing the old snapshot until
    /// the publish. If `func` fails the clone is discarded gently and the
    /// published snapshot is unchanged.
    pub async fn mutate<F>(&self, func: F) -> RingResult<()>
    where
        F: for<'a> FnOnce(&'a mut TokenMetadata) -> Mutator<'a>,
    {
        let _lock = self.write_lock.lock().await;
        let mut tm = self.get().clone_async().await;
        // Bump the version up front so caches keyed on it invalidate when
        // the modified snapshot is committed.
        tm.invalidate_cached_rings();
        if let Err(err) = func(&mut tm).await {
            tm.clear_gently().await;
            return Err(err);
        }
        self.set(Arc::new(tm));
        Ok(())
    }

    /// Coordinator-side mutation across every core's holder.
    ///
    /// Mutates a clone of shard 0's snapshot, then clones the result once
    /// per remaining shard, and only then publishes on every shard. The
    /// replace is all-or-nothing: a failing mutator discards the clone and
    /// no shard is updated.
    pub async fn mutate_on_all_shards<F>(shards: &[Arc<SharedTokenMetadata>], func: F) -> RingResult<()>
    where
        F: for<'a> FnOnce(&'a mut TokenMetadata) -> Mutator<'a>,
    {
        let base = &shards[0];
        let _lock = base.write_lock.lock().await;
        let mut tm = base.get().clone_async().await;
        tm.invalidate_cached_rings();
        if let Err(err) = func(&mut tm).await {
            tm.clear_gently().await;
            return Err(err);
        }

        // Clone for every other shard before any shard publishes.
        let tm = Arc::new(tm);
        let mut pending: Vec<Arc<TokenMetadata>> = Vec::with_capacity(shards.len());
        pending.push(tm.clone());
        for _ in 1..shards.len() {
            pending.push(Arc::new(tm.clone_async().await));
        }

        for (shard, snapshot) in shards.iter().zip(pending) {
            shard.set(snapshot);
        }
        Ok(())
    }
}

impl Default for SharedTokenMetadata {
    fn default() -> Self {
        Self::new(TopologyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::IpAddr;

    use osprey_common::{DcRack, Endpoint, RingError, Token};

    use crate::topology::NodeState;

    fn ep(last: u8) -> Endpoint {
        Endpoint(IpAddr::from([10, 0, 0, last]))
    }

    #[tokio::test]
    async fn test_mutate_publishes_with_increasing_version() {
        let holder = SharedTokenMetadata::default();
        let v0 = holder.get().ring_version();

        holder
            .mutate(|tm| {
                Box::pin(async move {
                    tm.update_topology(ep(1), DcRack::default(), Some(NodeState::Normal));
                    tm.update_normal_tokens(HashSet::from([Token(10)]), ep(1)).await
                })
            })
            .await
            .unwrap();

        let snapshot = holder.get();
        assert!(snapshot.ring_version() > v0);
        assert_eq!(snapshot.get_endpoint(Token(10)), Some(ep(1)));
    }

    #[tokio::test]
    async fn test_failed_mutator_leaves_snapshot_unchanged() {
        let holder = SharedTokenMetadata::default();
        let before = holder.get();
        let version = before.ring_version();

        let err = holder
            .mutate(|tm| {
                Box::pin(async move {
                    // No topology entry: must fail and roll back.
                    tm.update_normal_tokens(HashSet::from([Token(10)]), ep(1)).await
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err, RingError::UnknownEndpoint(ep(1)));

        let after = holder.get();
        assert_eq!(after.ring_version(), version);
        assert_eq!(after.get_endpoint(Token(10)), None);
    }

    #[tokio::test]
    async fn test_readers_keep_old_snapshot_across_publish() {
        let holder = SharedTokenMetadata::default();
        holder
            .mutate(|tm| {
                Box::pin(async move {
                    tm.update_topology(ep(1), DcRack::default(), Some(NodeState::Normal));
                    tm.update_normal_tokens(HashSet::from([Token(10)]), ep(1)).await
                })
            })
            .await
            .unwrap();

        let held = holder.get();
        holder
            .mutate(|tm| {
                Box::pin(async move {
                    tm.remove_endpoint(ep(1));
                    Ok(())
                })
            })
            .await
            .unwrap();

        // The reader's snapshot is isolated from the new publication.
        assert_eq!(held.get_endpoint(Token(10)), Some(ep(1)));
        assert_eq!(holder.get().get_endpoint(Token(10)), None);
    }

    #[tokio::test]
    #[should_panic(expected = "non-increasing ring version")]
    async fn test_version_regression_is_fatal() {
        let holder = SharedTokenMetadata::default();
        holder
            .mutate(|_tm| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        // Same (zero) version as the initial snapshot: must abort.
        holder.set(Arc::new(TokenMetadata::new(TopologyConfig::default())));
    }

    #[tokio::test]
    async fn test_mutate_on_all_shards_publishes_everywhere() {
        let shards: Vec<Arc<SharedTokenMetadata>> =
            (0..3).map(|_| Arc::new(SharedTokenMetadata::default())).collect();

        SharedTokenMetadata::mutate_on_all_shards(&shards, |tm| {
            Box::pin(async move {
                tm.update_topology(ep(1), DcRack::default(), Some(NodeState::Normal));
                tm.update_normal_tokens(HashSet::from([Token(10)]), ep(1)).await
            })
        })
        .await
        .unwrap();

        let versions: Vec<u64> = shards.iter().map(|s| s.get().ring_version()).collect();
        assert!(versions.iter().all(|v| *v == versions[0] && *v > 0));
        for shard in &shards {
            assert_eq!(shard.get().get_endpoint(Token(10)), Some(ep(1)));
        }
    }

    #[tokio::test]
    async fn test_mutate_on_all_shards_aborts_without_partial_publish() {
        let shards: Vec<Arc<SharedTokenMetadata>> =
            (0..3).map(|_| Arc::new(SharedTokenMetadata::default())).collect();
        let versions_before: Vec<u64> =
            shards.iter().map(|s| s.get().ring_version()).collect();

        let err = SharedTokenMetadata::mutate_on_all_shards(&shards, |tm| {
            Box::pin(async move {
                tm.update_normal_tokens(HashSet::from([Token(10)]), ep(1)).await
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err, RingError::UnknownEndpoint(ep(1)));

        for (shard, version) in shards.iter().zip(versions_before) {
            assert_eq!(shard.get().ring_version(), version);
            assert_eq!(shard.get().get_endpoint(Token(10)), None);
        }
    }

    #[tokio::test]
    async fn test_writers_serialise() {
        let holder = Arc::new(SharedTokenMetadata::default());
        let mut handles = Vec::new();
        for i in 0..4u8 {
            let holder = holder.clone();
            handles.push(tokio::spawn(async move {
                holder
                    .mutate(move |tm| {
                        Box::pin(async move {
                            tm.update_topology(ep(i), DcRack::default(), Some(NodeState::Normal));
                            tm.update_normal_tokens(
                                HashSet::from([Token(10 * (i as i64 + 1))]),
                                ep(i),
                            )
                            .await
                        })
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Every writer's change survived: no publish overwrote another.
        assert_eq!(holder.get().count_normal_token_owners(), 4);
    }
}
