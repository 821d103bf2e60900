//! Cooperative-yield utilities.
//!
//! The engine runs on single-threaded cooperative executors, one per core.
//! Any loop over a user-sized container must periodically hand the core
//! back, otherwise a large cluster's token map can stall latency-sensitive
//! request paths for the whole duration of a clone or teardown.

/// How many elements are processed between yield points.
///
/// Large enough that yielding is amortised away on small clusters, small
/// enough to bound the stall a 10⁶-token map can cause.
pub const YIELD_BATCH: usize = 256;

/// Counts loop iterations and yields to the executor once per
/// [`YIELD_BATCH`].
///
/// ```ignore
/// let mut yielder = Yielder::new();
/// for item in huge_map.iter() {
///     yielder.maybe_yield().await;
///     // ... work on item ...
/// }
/// ```
#[derive(Debug, Default)]
pub struct Yielder {
    ticks: usize,
}

impl Yielder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield to the executor if a full batch has been processed since the
    /// last suspension point.
    pub async fn maybe_yield(&mut self) {
        self.ticks += 1;
        if self.ticks % YIELD_BATCH == 0 {
            tokio::task::yield_now().await;
        }
    }
}

/// Drop every element of a container in yield-bounded batches.
///
/// Takes the container by value (use `std::mem::take` on a field); the
/// container's own bulk `Drop` would free all elements in one stall.
pub async fn clear_gently<C>(container: C)
where
    C: IntoIterator,
{
    let mut yielder = Yielder::new();
    for item in container {
        drop(item);
        yielder.maybe_yield().await;
    }
}
