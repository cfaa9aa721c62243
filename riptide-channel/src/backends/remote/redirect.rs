//! Persistent "last known good redirect" cache.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone)]
struct RedirectEntry {
    last_good: Url,
    failures: u32,
}

/// Remembers where each original URL last redirected to successfully.
///
/// Repeated requests go straight to the cached target. After enough
/// consecutive failures against the cached target the entry is dropped so
/// the next request starts from the original URL again.
#[derive(Debug, Default)]
pub struct RedirectCache {
    entries: Mutex<HashMap<String, RedirectEntry>>,
}

impl RedirectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// URL to start a request at: the cached target, or `original`.
    pub fn resolve(&self, original: &Url) -> Url {
        self.entries
            .lock()
            .get(original.as_str())
            .map(|entry| entry.last_good.clone())
            .unwrap_or_else(|| original.clone())
    }

    /// Cached target for `original`, if any.
    pub fn cached(&self, original: &Url) -> Option<Url> {
        self.entries
            .lock()
            .get(original.as_str())
            .map(|entry| entry.last_good.clone())
    }

    /// Records that a request starting at `original` succeeded at `final_url`.
    pub fn record_success(&self, original: &Url, final_url: &Url) {
        let mut entries = self.entries.lock();
        if final_url == original {
            entries.remove(original.as_str());
            return;
        }
        if entries
            .get(original.as_str())
            .is_none_or(|entry| &entry.last_good != final_url)
        {
            debug!("Caching redirect {} -> {}", original, final_url);
        }
        entries.insert(
            original.as_str().to_string(),
            RedirectEntry {
                last_good: final_url.clone(),
                failures: 0,
            },
        );
    }

    /// Records a failed request that started at the cached target. Returns
    /// `true` when the entry was dropped after reaching `limit` failures.
    pub fn record_failure(&self, original: &Url, limit: u32) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(original.as_str()) else {
            return false;
        };
        entry.failures += 1;
        if entry.failures < limit {
            return false;
        }

        info!(
            "Dropping cached redirect for {} after {} failures",
            original, entry.failures
        );
        entries.remove(original.as_str());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_resolve_uses_last_good_redirect() {
        let cache = RedirectCache::new();
        let original = url("http://example.com/file");
        assert_eq!(cache.resolve(&original), original);

        cache.record_success(&original, &url("http://mirror.example.com/file"));
        assert_eq!(cache.resolve(&original), url("http://mirror.example.com/file"));

        cache.record_success(&original, &original);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_repeated_failures_reset_to_original() {
        let cache = RedirectCache::new();
        let original = url("http://example.com/file");
        let mirror = url("http://mirror.example.com/file");
        cache.record_success(&original, &mirror);

        assert!(!cache.record_failure(&original, 3));
        assert!(!cache.record_failure(&original, 3));
        assert_eq!(cache.cached(&original), Some(mirror.clone()));
        assert!(cache.record_failure(&original, 3));
        assert_eq!(cache.resolve(&original), original);
    }

    #[test]
    fn test_success_clears_failure_count() {
        let cache = RedirectCache::new();
        let original = url("http://example.com/file");
        let mirror = url("http://mirror.example.com/file");
        cache.record_success(&original, &mirror);

        cache.record_failure(&original, 2);
        cache.record_success(&original, &mirror);
        assert!(!cache.record_failure(&original, 2));
        assert_eq!(cache.len(), 1);
    }
}
