use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::lock::Mutex;
use indexmap::IndexMap;
use normalized_cache_api::{
    cascade_keys, key_matches, CacheHeaders, CacheKey, NormalizedCache, Record, RecordDump, RecordMerger,
};

const IDENTITY: &str = "MemoryCache";

/// Records kept in memory, least recently used first.
///
/// The cache can be bounded in size, in which case the least recently used records are evicted
/// first, and in age. It can also be chained to a `next` cache, typically a persistent one: loads
/// missing in memory fall through to it and populate memory, merges are written to both unless
/// the [`normalized_cache_api::headers::MEMORY_CACHE_ONLY`] header is set.
pub struct MemoryCache {
    inner: Mutex<MemoryInner>,
    next: Option<Arc<dyn NormalizedCache>>,
}

struct MemoryInner {
    // for testing
    now: Box<dyn Fn() -> Instant + Send + Sync>,
    max_size_bytes: Option<usize>,
    expire_after: Option<Duration>,
    entries: IndexMap<CacheKey, MemoryEntry>,
    size: usize,
}

struct MemoryEntry {
    record: Record,
    size: usize,
    written_at: Instant,
}

impl Default for MemoryCache {
    fn default() -> Self {
        MemoryCache {
            inner: Mutex::new(MemoryInner {
                now: Box::new(Instant::now),
                max_size_bytes: None,
                expire_after: None,
                entries: IndexMap::new(),
                size: 0,
            }),
            next: None,
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_size_bytes(mut self, max_size_bytes: usize) -> Self {
        self.inner.get_mut().max_size_bytes = Some(max_size_bytes);
        self
    }

    /// Records not written for `expire_after` are treated as absent.
    #[must_use]
    pub fn expire_after(mut self, expire_after: Duration) -> Self {
        self.inner.get_mut().expire_after = Some(expire_after);
        self
    }

    #[must_use]
    pub fn chain(mut self, next: Arc<dyn NormalizedCache>) -> Self {
        self.next = Some(next);
        self
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_time(mut self, now: impl Fn() -> Instant + Send + Sync + 'static) -> Self {
        self.inner.get_mut().now = Box::new(now);
        self
    }
}

impl MemoryInner {
    /// Returns the record, refreshing its position in the eviction order.
    fn get(&mut self, key: &CacheKey, evict: bool) -> Option<Record> {
        let now = (self.now)();
        let index = self.entries.get_index_of(key)?;

        // a deadline past what `Instant` can represent never comes
        let expired = self.expire_after.is_some_and(|expire_after| {
            self.entries[index]
                .written_at
                .checked_add(expire_after)
                .is_some_and(|deadline| deadline <= now)
        });
        if expired || evict {
            let (_, entry) = self.entries.shift_remove_index(index)?;
            self.size -= entry.size;
            return (!expired).then_some(entry.record);
        }

        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        Some(self.entries[last].record.clone())
    }

    fn insert(&mut self, record: Record) {
        let size = record.size_estimate();
        let written_at = (self.now)();
        if let Some(previous) = self.entries.shift_remove(&record.key) {
            self.size -= previous.size;
        }
        self.size += size;
        self.entries.insert(
            record.key.clone(),
            MemoryEntry {
                record,
                size,
                written_at,
            },
        );
        self.evict();
    }

    fn evict(&mut self) {
        let Some(max_size_bytes) = self.max_size_bytes else {
            return;
        };
        while self.size > max_size_bytes {
            let Some((key, entry)) = self.entries.shift_remove_index(0) else {
                break;
            };
            tracing::trace!("evicting {key} from the memory cache");
            self.size -= entry.size;
        }
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.shift_remove(key) {
            Some(entry) => {
                self.size -= entry.size;
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl NormalizedCache for MemoryCache {
    async fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> Option<Record> {
        let evict = headers.evict_after_read();
        if let Some(record) = self.inner.lock().await.get(key, evict) {
            return Some(record);
        }

        let record = self.next.as_ref()?.load_record(key, headers).await?;
        if !evict {
            self.inner.lock().await.insert(record.clone());
        }
        Some(record)
    }

    async fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> Vec<Record> {
        let evict = headers.evict_after_read();
        let mut records = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            for key in keys {
                match inner.get(key, evict) {
                    Some(record) => records.push(record),
                    None => missing.push(key.clone()),
                }
            }
        }

        if let (Some(next), false) = (&self.next, missing.is_empty()) {
            let loaded = next.load_records(&missing, headers).await;
            if !evict {
                let mut inner = self.inner.lock().await;
                for record in &loaded {
                    inner.insert(record.clone());
                }
            }
            records.extend(loaded);
        }

        records
    }

    async fn merge(&self, record: Record, headers: &CacheHeaders, merger: &dyn RecordMerger) -> HashSet<String> {
        if headers.do_not_store() {
            return HashSet::new();
        }

        let stored = self.inner.lock().await.get(&record.key, false);
        let stored = match (stored, &self.next) {
            (Some(stored), _) => Some(stored),
            (None, Some(next)) => next.load_record(&record.key, &CacheHeaders::none()).await,
            (None, None) => None,
        };

        let mut merged = stored.unwrap_or_else(|| Record::new(record.key.clone()));
        let (delta, mut changed) = merger.merge(&merged, &record, headers.received_date());
        merged.apply(delta);
        self.inner.lock().await.insert(merged);

        if let (Some(next), false) = (&self.next, headers.memory_cache_only()) {
            changed.extend(next.merge(record, headers, merger).await);
        }

        changed
    }

    async fn remove(&self, key: &CacheKey, cascade: bool) -> bool {
        let keys = if cascade {
            cascade_keys(self, key, &CacheHeaders::none()).await
        } else {
            vec![key.clone()]
        };

        let mut removed = {
            let mut inner = self.inner.lock().await;
            keys.iter().fold(false, |removed, key| inner.remove(key) || removed)
        };

        if let Some(next) = &self.next {
            for key in &keys {
                removed |= next.remove(key, false).await;
            }
        }

        removed
    }

    /// Counts the records removed from memory and from the next cache, a record present in both
    /// counting twice.
    async fn remove_pattern(&self, pattern: &str) -> usize {
        let mut removed = {
            let mut inner = self.inner.lock().await;
            let keys = inner
                .entries
                .keys()
                .filter(|key| key_matches(pattern, key.as_str()))
                .cloned()
                .collect::<Vec<_>>();

            for key in &keys {
                inner.remove(key);
            }
            keys.len()
        };

        if let Some(next) = &self.next {
            removed += next.remove_pattern(pattern).await;
        }

        removed
    }

    async fn clear_all(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.entries.clear();
            inner.size = 0;
        }

        if let Some(next) = &self.next {
            next.clear_all().await;
        }
    }

    async fn dump(&self) -> IndexMap<String, RecordDump> {
        let records = self
            .inner
            .lock()
            .await
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.record.clone()))
            .collect();

        let mut dump = IndexMap::new();
        dump.insert(IDENTITY.to_string(), records);
        if let Some(next) = &self.next {
            dump.extend(next.dump().await);
        }
        dump
    }
}
