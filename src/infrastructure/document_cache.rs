use crate::domain::models::{system_clock, NowProvider};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct CachedDocument<T> {
    pub document: T,
    /// The document carries a local write the remote store has not confirmed yet.
    pub pending_writes: bool,
    pub cached_at: DateTime<Utc>,
}

pub struct DocumentCache<T> {
    entries: Mutex<HashMap<String, CachedDocument<T>>>,
    ttl: chrono::Duration,
    now_provider: NowProvider,
}

impl<T> DocumentCache<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn normalized_id(id: &str) -> Option<String> {
        let normalized = id.trim();
        if normalized.is_empty() {
            return None;
        }
        Some(normalized.to_string())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CachedDocument<T>>>, InfraError> {
        self.entries
            .lock()
            .map_err(|error| InfraError::lock_poisoned("document cache", error))
    }

    fn is_expired(&self, entry: &CachedDocument<T>, now: DateTime<Utc>) -> bool {
        now - entry.cached_at >= self.ttl
    }

    /// Returns the live entry for `id`, evicting it first if its TTL has elapsed.
    pub fn get(&self, id: &str) -> Result<Option<CachedDocument<T>>, InfraError> {
        let Some(id) = Self::normalized_id(id) else {
            return Ok(None);
        };
        let now = (self.now_provider)();
        let mut entries = self.lock()?;
        let expired = match entries.get(&id) {
            Some(entry) => self.is_expired(entry, now),
            None => return Ok(None),
        };
        if expired {
            entries.remove(&id);
            return Ok(None);
        }
        Ok(entries.get(&id).cloned())
    }

    pub fn set(&self, id: &str, document: T, pending_writes: bool) -> Result<(), InfraError> {
        let id = Self::normalized_id(id).ok_or_else(|| {
            InfraError::InvalidArgument("document id is required for cache set".to_string())
        })?;
        let cached_at = (self.now_provider)();
        self.lock()?.insert(
            id,
            CachedDocument {
                document,
                pending_writes,
                cached_at,
            },
        );
        Ok(())
    }

    pub fn invalidate(&self, id: &str) -> Result<(), InfraError> {
        let Some(id) = Self::normalized_id(id) else {
            return Ok(());
        };
        self.lock()?.remove(&id);
        Ok(())
    }

    pub fn invalidate_all(&self) -> Result<(), InfraError> {
        self.lock()?.clear();
        Ok(())
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep_expired(&self) -> Result<usize, InfraError> {
        let now = (self.now_provider)();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        Ok(before - entries.len())
    }

    pub fn len(&self) -> Result<usize, InfraError> {
        Ok(self.lock()?.len())
    }

    /// Runs [`Self::sweep_expired`] every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.sweep_expired() {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "swept expired cache entries"),
                    Err(error) => tracing::warn!(%error, "cache sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;

    fn cache_with_clock(clock: &ManualClock) -> DocumentCache<String> {
        DocumentCache::new(Duration::from_secs(60)).with_now_provider(clock.provider())
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = ManualClock::default();
        let cache = cache_with_clock(&clock);
        cache.set("tmr-1", "doc".to_string(), false).expect("set");

        clock.advance_seconds(59);
        assert!(cache.get("tmr-1").expect("get").is_some());

        clock.advance_seconds(1);
        assert!(cache.get("tmr-1").expect("get").is_none());
        assert_eq!(cache.len().expect("len"), 0);
    }

    #[test]
    fn set_refreshes_timestamp_and_pending_flag() {
        let clock = ManualClock::default();
        let cache = cache_with_clock(&clock);
        cache.set("tmr-1", "v1".to_string(), true).expect("set");
        clock.advance_seconds(50);
        cache.set("tmr-1", "v2".to_string(), false).expect("set");
        clock.advance_seconds(50);

        let cached = cache.get("tmr-1").expect("get").expect("entry is fresh");
        assert_eq!(cached.document, "v2");
        assert!(!cached.pending_writes);
    }

    #[test]
    fn invalidate_removes_entries() {
        let clock = ManualClock::default();
        let cache = cache_with_clock(&clock);
        cache.set("tmr-1", "a".to_string(), false).expect("set");
        cache.set("tmr-2", "b".to_string(), false).expect("set");

        cache.invalidate(" tmr-1 ").expect("invalidate");
        assert!(cache.get("tmr-1").expect("get").is_none());
        assert!(cache.get("tmr-2").expect("get").is_some());

        cache.invalidate_all().expect("invalidate all");
        assert_eq!(cache.len().expect("len"), 0);
    }

    #[test]
    fn sweep_only_removes_expired_entries() {
        let clock = ManualClock::default();
        let cache = cache_with_clock(&clock);
        cache.set("old", "a".to_string(), false).expect("set");
        clock.advance_seconds(45);
        cache.set("new", "b".to_string(), false).expect("set");
        clock.advance_seconds(30);

        assert_eq!(cache.sweep_expired().expect("sweep"), 1);
        assert!(cache.get("new").expect("get").is_some());
    }

    #[test]
    fn empty_ids_are_rejected_on_set() {
        let cache = DocumentCache::<String>::new(DEFAULT_TTL);
        assert!(matches!(
            cache.set("  ", "a".to_string(), false),
            Err(InfraError::InvalidArgument(_))
        ));
        assert!(cache.get("  ").expect("get").is_none());
    }
}
