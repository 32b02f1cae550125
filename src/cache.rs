use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;

use crate::observability::CACHE_REQUESTS_TOTAL;

type SharedResult<V, E> = Shared<BoxFuture<'static, Result<Arc<V>, E>>>;

enum Slot<V, E> {
    Ready {
        value: Arc<V>,
        expires_at: Instant,
    },
    InFlight {
        epoch: u64,
        future: SharedResult<V, E>,
    },
}

struct Slots<K, V, E> {
    map: HashMap<K, Slot<V, E>>,
    next_epoch: u64,
}

/// TTL cache with single-flight misses.
///
/// The first caller for a missing or expired key starts the computation;
/// every concurrent caller for that key awaits the same future. Successful
/// results are cached for `ttl`. Errors reach every waiter and are never
/// cached. Invalidating a key that is in flight lets the current waiters
/// finish but keeps their result out of the cache.
pub struct SingleFlightCache<K, V, E> {
    ttl: Duration,
    slots: Mutex<Slots<K, V, E>>,
}

impl<K, V, E> SingleFlightCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                next_epoch: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<K, V, E>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached value for `key`, or the result of the in-flight or newly
    /// started `compute`. `compute` is only called on a miss and must not
    /// block: it only builds the future.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (epoch, future) = {
            let mut slots = self.lock();
            match slots.map.get(&key) {
                Some(Slot::Ready { value, expires_at }) if *expires_at > Instant::now() => {
                    metrics::counter!(CACHE_REQUESTS_TOTAL, "outcome" => "hit").increment(1);
                    return Ok(value.clone());
                }
                Some(Slot::InFlight { epoch, future }) => {
                    metrics::counter!(CACHE_REQUESTS_TOTAL, "outcome" => "coalesced").increment(1);
                    (*epoch, future.clone())
                }
                _ => {
                    metrics::counter!(CACHE_REQUESTS_TOTAL, "outcome" => "miss").increment(1);
                    let epoch = slots.next_epoch;
                    slots.next_epoch += 1;
                    let future = compute().map(|r| r.map(Arc::new)).boxed().shared();
                    slots.map.insert(
                        key.clone(),
                        Slot::InFlight {
                            epoch,
                            future: future.clone(),
                        },
                    );
                    (epoch, future)
                }
            }
        };

        let result = future.await;

        // Any waiter may settle the slot, so a dropped leader cannot strand it.
        let mut slots = self.lock();
        if let Some(Slot::InFlight { epoch: current, .. }) = slots.map.get(&key)
            && *current == epoch
        {
            match &result {
                Ok(value) => {
                    slots.map.insert(
                        key,
                        Slot::Ready {
                            value: value.clone(),
                            expires_at: Instant::now() + self.ttl,
                        },
                    );
                }
                Err(_) => {
                    slots.map.remove(&key);
                }
            }
        }
        result
    }

    /// Drop every entry (ready or in flight) whose key matches.
    pub fn invalidate(&self, mut matches: impl FnMut(&K) -> bool) -> usize {
        let mut slots = self.lock();
        let before = slots.map.len();
        slots.map.retain(|k, _| !matches(k));
        before - slots.map.len()
    }

    /// Whether a fresh value is cached for `key`.
    pub fn is_fresh(&self, key: &K) -> bool {
        matches!(
            self.lock().map.get(key),
            Some(Slot::Ready { expires_at, .. }) if *expires_at > Instant::now()
        )
    }
}
