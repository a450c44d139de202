use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// A relaxed atomic counter.
///
/// # Example
///
/// ```
/// use signaling_server::statistics::Count;
///
/// let count = Count::default();
///
/// count.add(1);
/// assert_eq!(count.get(), 1);
///
/// count.add(2);
/// assert_eq!(count.get(), 3);
/// ```
#[derive(Default)]
pub struct Count(AtomicUsize);

impl Count {
    pub fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-lifetime counters surfaced on the admin view.
#[derive(Default)]
pub struct Counts {
    pub connections: Count,
    pub connections_refused: Count,
    pub rpcs: Count,
    pub rate_limited: Count,
    pub rooms_created: Count,
    pub joins: Count,
    pub signals: Count,
}

/// Shared statistics table.
///
/// Cloned into every connection driver; all counters are monotonic and
/// updated with relaxed ordering, exactness under contention is not a goal.
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts>);

impl std::ops::Deref for Statistics {
    type Target = Counts;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
