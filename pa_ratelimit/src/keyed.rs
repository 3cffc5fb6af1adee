use std::time::Duration;

use dashmap::DashMap;

use crate::time::Instant;

/// Default bound on tracked identifiers per limiter
pub const DEFAULT_MAX_IDENTIFIERS: usize = 10_000;

struct Slot<S> {
    state: S,
    last_seen: Instant,
}

/// Per-identifier state map with a size bound
///
/// Each identifier's state is created lazily on first use. Access to one
/// identifier is exclusive (DashMap shard lock), so check-and-update on the
/// state is atomic. When the map is full, the least recently seen identifier
/// that is not pinned is evicted to make room; `evict_idle` drops everything
/// idle past a cutoff.
pub(crate) struct KeyedState<S> {
    entries: DashMap<String, Slot<S>>,
    max_identifiers: usize,
    pinned: Option<fn(&S, Instant) -> bool>,
}

impl<S> KeyedState<S> {
    pub fn new(max_identifiers: usize) -> Self {
        Self { entries: DashMap::new(), max_identifiers: max_identifiers.max(1), pinned: None }
    }

    /// Like `new`, but state for which `pinned` holds is never evicted to make room
    ///
    /// When every entry is pinned the map grows past `max_identifiers`.
    pub fn with_pinned(max_identifiers: usize, pinned: fn(&S, Instant) -> bool) -> Self {
        Self { pinned: Some(pinned), ..Self::new(max_identifiers) }
    }

    /// Run `f` on the state for `identifier`, creating it with `init` if missing
    pub fn with<R>(&self, identifier: &str, now: Instant, init: impl FnOnce() -> S, f: impl FnOnce(&mut S) -> R) -> R {
        if let Some(mut slot) = self.entries.get_mut(identifier) {
            slot.last_seen = now;
            return f(&mut slot.state);
        }

        if self.entries.len() >= self.max_identifiers {
            self.evict_least_recent(now);
        }

        let mut slot = self.entries.entry(identifier.to_owned()).or_insert_with(|| Slot { state: init(), last_seen: now });
        slot.last_seen = now;
        f(&mut slot.state)
    }

    /// Run `f` on existing state only, without creating or touching it
    pub fn update_existing<R>(&self, identifier: &str, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.entries.get_mut(identifier).map(|mut slot| f(&mut slot.state))
    }

    /// Read existing state without creating it
    pub fn peek<R>(&self, identifier: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.entries.get(identifier).map(|slot| f(&slot.state))
    }

    pub fn remove(&self, identifier: &str) {
        self.entries.remove(identifier);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove identifiers not seen for at least `max_idle`
    pub fn evict_idle(&self, now: Instant, max_idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| now.saturating_duration_since(slot.last_seen) < max_idle);
        before.saturating_sub(self.entries.len())
    }

    fn evict_least_recent(&self, now: Instant) {
        let oldest = self
            .entries
            .iter()
            .filter(|entry| !self.pinned.is_some_and(|pinned| pinned(&entry.state, now)))
            .min_by_key(|entry| entry.last_seen)
            .map(|entry| entry.key().clone());
        if let Some(identifier) = oldest {
            self.entries.remove(&identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time;

    #[test]
    fn test_lazy_creation() {
        let keyed: KeyedState<u32> = KeyedState::new(10);
        let now = time::now();

        assert_eq!(keyed.peek("a", |v| *v), None);
        let value = keyed.with("a", now, || 7, |v| {
            *v += 1;
            *v
        });
        assert_eq!(value, 8);
        assert_eq!(keyed.peek("a", |v| *v), Some(8));
        assert_eq!(keyed.len(), 1);
    }

    #[test]
    fn test_update_existing_does_not_create() {
        let keyed: KeyedState<u32> = KeyedState::new(10);
        assert_eq!(keyed.update_existing("ghost", |v| *v), None);
        assert_eq!(keyed.len(), 0);
    }

    #[test]
    fn test_bound_evicts_least_recent() {
        let keyed: KeyedState<u32> = KeyedState::new(2);
        let base = time::now();

        keyed.with("old", base, || 1, |_| ());
        keyed.with("mid", base + Duration::from_secs(1), || 2, |_| ());
        // Touch "old" so "mid" becomes the least recently seen
        keyed.with("old", base + Duration::from_secs(2), || 0, |_| ());
        keyed.with("new", base + Duration::from_secs(3), || 3, |_| ());

        assert_eq!(keyed.len(), 2);
        assert!(keyed.peek("mid", |_| ()).is_none());
        assert_eq!(keyed.peek("old", |v| *v), Some(1));
        assert_eq!(keyed.peek("new", |v| *v), Some(3));
    }

    #[test]
    fn test_evict_idle() {
        let keyed: KeyedState<u32> = KeyedState::new(10);
        let base = time::now();

        keyed.with("stale", base, || 1, |_| ());
        keyed.with("fresh", base + Duration::from_secs(50), || 2, |_| ());

        let evicted = keyed.evict_idle(base + Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(evicted, 1);
        assert!(keyed.peek("stale", |_| ()).is_none());
        assert!(keyed.peek("fresh", |_| ()).is_some());
    }

    #[test]
    fn test_pinned_state_survives_bound() {
        let keyed: KeyedState<u32> = KeyedState::with_pinned(2, |value, _| *value == 0);
        let base = time::now();

        keyed.with("pinned", base, || 0, |_| ());
        keyed.with("a", base + Duration::from_secs(1), || 1, |_| ());
        keyed.with("b", base + Duration::from_secs(2), || 2, |_| ());

        assert_eq!(keyed.peek("pinned", |v| *v), Some(0));
        assert!(keyed.peek("a", |_| ()).is_none());
        assert_eq!(keyed.len(), 2);
    }
}
