//! Single-flight execution with reference-counted cancellation
//!
//! Concurrent requests for the same key share one execution. The work runs
//! in its own task and is cancelled only when every waiter has gone away.

use crate::error::KilnError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type FlightResult<V> = Result<V, Arc<KilnError>>;

struct Flight<V> {
    result: watch::Sender<Option<FlightResult<V>>>,
    cancel: CancellationToken,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    count: usize,
    /// Set once the last waiter left before completion; never rejoined
    abandoned: bool,
}

impl<V> Flight<V> {
    fn new() -> Self {
        let (result, _) = watch::channel(None);
        Self {
            result,
            cancel: CancellationToken::new(),
            waiters: Mutex::new(Waiters {
                count: 1,
                abandoned: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn join(&self) -> bool {
        let mut waiters = self.lock();
        if waiters.abandoned {
            return false;
        }
        waiters.count += 1;
        true
    }

    fn done(&self) -> bool {
        self.result.borrow().is_some()
    }
}

/// Drops a waiter's interest, cancelling the work when none remain
struct WaiterGuard<V> {
    flight: Arc<Flight<V>>,
}

impl<V> Drop for WaiterGuard<V> {
    fn drop(&mut self) {
        let mut waiters = self.flight.lock();
        waiters.count = waiters.count.saturating_sub(1);
        if waiters.count == 0 && !self.flight.done() {
            waiters.abandoned = true;
            self.flight.cancel.cancel();
        }
    }
}

/// Keyed single-flight executor
pub struct FlightGroup<K, V> {
    flights: Arc<DashMap<K, Arc<Flight<V>>>>,
}

impl<K, V> Default for FlightGroup<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }
}

impl<K, V> FlightGroup<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the execution already in flight
    ///
    /// `work` is only called by the first requester. It receives the token
    /// that fires when every requester has been dropped.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> FlightResult<V>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V, KilnError>> + Send + 'static,
    {
        let (flight, leader) = match self.flights.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().join() {
                    debug!("Joining in-flight work for {:?}", key);
                    (entry.get().clone(), false)
                } else {
                    let flight = Arc::new(Flight::new());
                    entry.insert(flight.clone());
                    (flight, true)
                }
            }
            Entry::Vacant(entry) => {
                let flight = Arc::new(Flight::new());
                entry.insert(flight.clone());
                (flight, true)
            }
        };
        let _guard = WaiterGuard {
            flight: flight.clone(),
        };

        if leader {
            let token = flight.cancel.clone();
            let fut = work(token.clone());
            let flights = self.flights.clone();
            let owned = flight.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    result = fut => result.map_err(Arc::new),
                    _ = token.cancelled() => Err(Arc::new(KilnError::Cancelled)),
                };
                owned.result.send_replace(Some(result));
                flights.remove_if(&key, |_, current| Arc::ptr_eq(current, &owned));
            });
        }

        let mut rx = flight.result.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| Err(Arc::new(KilnError::Cancelled)))
    }

    /// Number of keys currently executing
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let group: Arc<FlightGroup<&'static str, u32>> = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                group
                    .run("key", move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared() {
        let group: FlightGroup<u8, u8> = FlightGroup::new();
        let err = group
            .run(1, |_| async { Err(KilnError::Internal("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(*err, KilnError::Internal(_)));
    }

    #[tokio::test]
    async fn last_waiter_leaving_cancels_work() {
        let group: Arc<FlightGroup<u8, u8>> = Arc::new(FlightGroup::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let cancelled = Arc::new(AtomicUsize::new(0));

        let seen = cancelled.clone();
        let g = group.clone();
        let task = tokio::spawn(async move {
            g.run(1, move |token| async move {
                let _ = started_tx.send(());
                token.cancelled().await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            })
            .await
        });

        started_rx.await.unwrap();
        task.abort();
        let _ = task.await;

        // The next request starts fresh work
        let value = group.run(1, |_| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn remaining_waiter_keeps_work_alive() {
        let group: Arc<FlightGroup<u8, u8>> = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let spawn = |group: Arc<FlightGroup<u8, u8>>, calls: Arc<AtomicUsize>| {
            tokio::spawn(async move {
                group
                    .run(1, move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(9)
                    })
                    .await
            })
        };

        let first = spawn(group.clone(), calls.clone());
        let second = spawn(group.clone(), calls.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        assert_eq!(second.await.unwrap().unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
