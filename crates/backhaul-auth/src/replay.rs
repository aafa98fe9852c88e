//! Replay protection for handshake tags

use dashmap::DashMap;

/// Prune expired entries once the cache grows past this many tags
const PRUNE_THRESHOLD: usize = 1024;

/// Whether `timestamp` lies in `[now - window, now + window]`
pub fn timestamp_in_window(timestamp: i64, now: i64, window: i64) -> bool {
    timestamp >= now.saturating_sub(window) && timestamp <= now.saturating_add(window)
}

/// Remembers handshake tags for the replay window
pub struct ReplayCache {
    window: i64,
    seen: DashMap<Vec<u8>, i64>,
}

impl ReplayCache {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window: window_secs,
            seen: DashMap::new(),
        }
    }

    /// Record `tag` at `now`. Returns false when the tag was already seen and
    /// has not yet expired.
    pub fn check_and_insert(&self, tag: &[u8], now: i64) -> bool {
        if self.seen.len() > PRUNE_THRESHOLD {
            self.prune(now);
        }

        let expiry = now.saturating_add(self.window);
        match self.seen.entry(tag.to_vec()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if *e.get() >= now {
                    return false;
                }
                e.insert(expiry);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(expiry);
                true
            }
        }
    }

    /// Drop tags whose window has passed
    pub fn prune(&self, now: i64) {
        self.seen.retain(|_, expiry| *expiry >= now);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
