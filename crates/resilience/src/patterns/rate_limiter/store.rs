//! Sharded per-key state shared by every limiter algorithm

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry<S> {
    state: S,
    last_seen: Instant,
}

/// Map from key to lazily created limiter state.
///
/// The map lookup only takes a shard lock long enough to clone the entry's
/// `Arc`; the read-modify-write then runs under the entry's own mutex, so
/// two keys never contend beyond the shard lookup.
#[derive(Debug)]
pub(crate) struct KeyedStore<S> {
    entries: DashMap<String, Arc<Mutex<Entry<S>>>>,
}

impl<S> Default for KeyedStore<S> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<S> KeyedStore<S> {
    /// Run `f` against the key's state, creating it with `init` first if needed
    pub(crate) fn update<R>(
        &self,
        key: &str,
        now: Instant,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        // Bind first: a shard guard held into the insert branch would deadlock.
        let existing = self.entries.get(key).map(|entry| Arc::clone(entry.value()));
        let entry = match existing {
            Some(entry) => entry,
            None => Arc::clone(
                self.entries
                    .entry(key.to_owned())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(Entry {
                            state: init(),
                            last_seen: now,
                        }))
                    })
                    .value(),
            ),
        };

        let mut guard = entry.lock();
        guard.last_seen = now;
        f(&mut guard.state)
    }

    /// Read the key's state without creating or touching it
    pub(crate) fn peek<R>(&self, key: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        let entry = self.entries.get(key).map(|entry| Arc::clone(entry.value()))?;
        let guard = entry.lock();
        Some(f(&guard.state))
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop keys not seen for at least `idle` whose state has returned to
    /// what a new key would get. `is_fresh` decides the latter at `now`.
    ///
    /// Entries locked by an in-flight check, or whose `Arc` is held by a
    /// caller between lookup and lock, are kept.
    pub(crate) fn evict_idle(
        &self,
        idle: Duration,
        now: Instant,
        is_fresh: impl Fn(&S, Instant) -> bool,
    ) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            match entry.try_lock() {
                Some(guard) => {
                    now.saturating_duration_since(guard.last_seen) < idle
                        || !is_fresh(&guard.state, now)
                }
                None => true,
            }
        });
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
