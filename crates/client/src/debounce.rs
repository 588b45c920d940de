//! Keyed trailing-edge debouncer.
//!
//! Each key holds at most one pending value. Arming again replaces the value
//! and restarts the quiet period, so only the last value of a burst reaches
//! the action. Pending values can be fired early or dropped explicitly.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

type Action<K, V> = Arc<dyn Fn(K, V) -> BoxFuture<'static, ()> + Send + Sync>;

struct Pending<V> {
    value: V,
    generation: u64,
    timer: JoinHandle<()>,
}

type PendingMap<K, V> = Arc<Mutex<HashMap<K, Pending<V>>>>;

pub struct Debouncer<K, V> {
    delay: Duration,
    action: Action<K, V>,
    pending: PendingMap<K, V>,
    generation: AtomicU64,
}

fn lock<K, V>(pending: &Mutex<HashMap<K, Pending<V>>>) -> MutexGuard<'_, HashMap<K, Pending<V>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new<F>(delay: Duration, action: F) -> Self
    where
        F: Fn(K, V) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            delay,
            action: Arc::new(action),
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Store `value` under `key` and (re)start its timer.
    pub fn arm(&self, key: K, value: V) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = {
            let pending = self.pending.clone();
            let action = self.action.clone();
            let key = key.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let due = {
                    let mut map = lock(&pending);
                    match map.get(&key) {
                        Some(entry) if entry.generation == generation => map.remove(&key),
                        _ => None,
                    }
                };
                if let Some(entry) = due {
                    action(key, entry.value).await;
                }
            })
        };

        let replaced = lock(&self.pending).insert(
            key,
            Pending {
                value,
                generation,
                timer,
            },
        );
        if let Some(old) = replaced {
            old.timer.abort();
        }
    }

    /// Drop the pending value for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.pending).remove(key) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every pending value.
    pub fn cancel_all(&self) {
        for (_, entry) in lock(&self.pending).drain() {
            entry.timer.abort();
        }
    }

    /// Run the action for `key` now instead of waiting out the timer.
    pub async fn fire_now(&self, key: &K) -> bool {
        let entry = lock(&self.pending).remove(key);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                (self.action)(key.clone(), entry.value).await;
                true
            }
            None => false,
        }
    }

    /// Fire every pending value now. Returns how many fired.
    pub async fn flush_all(&self) -> usize {
        let entries: Vec<(K, Pending<V>)> = lock(&self.pending).drain().collect();
        let count = entries.len();
        for (key, entry) in entries {
            entry.timer.abort();
            (self.action)(key, entry.value).await;
        }
        count
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.pending).contains_key(key)
    }
}

impl<K, V> Drop for Debouncer<K, V> {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.pending).drain() {
            entry.timer.abort();
        }
    }
}
