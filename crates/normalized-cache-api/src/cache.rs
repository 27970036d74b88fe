use std::collections::HashSet;

use indexmap::IndexMap;

use crate::{CacheHeaders, CacheKey, Record, RecordMerger};

/// Records of one cache, by key.
pub type RecordDump = IndexMap<CacheKey, Record>;

/// Key to record storage.
///
/// Implementations do not fail: a backend that cannot read or write reports the problem through
/// [`crate::diagnostics::report_storage_error`] and behaves as if the data was absent. Callers
/// serialize mutations, implementations only need to keep individual calls consistent.
#[async_trait::async_trait]
pub trait NormalizedCache: Send + Sync {
    async fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> Option<Record>;

    /// Loads every record found among `keys`, in no particular order. Missing keys are skipped.
    async fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> Vec<Record> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.load_record(key, headers).await {
                records.push(record);
            }
        }
        records
    }

    /// Merges `record` into the stored one and returns the `key.fieldKey` of every field whose
    /// value changed.
    async fn merge(&self, record: Record, headers: &CacheHeaders, merger: &dyn RecordMerger) -> HashSet<String>;

    async fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> HashSet<String> {
        let mut changed = HashSet::new();
        for record in records {
            changed.extend(self.merge(record, headers, merger).await);
        }
        changed
    }

    /// Removes a record. With `cascade`, the records it references are removed too, recursively,
    /// unless another record still references them. Returns whether the record was present.
    async fn remove(&self, key: &CacheKey, cascade: bool) -> bool;

    /// Removes every record whose key matches `pattern`, see [`key_matches`]. Returns how many
    /// records were removed.
    async fn remove_pattern(&self, pattern: &str) -> usize;

    async fn clear_all(&self);

    /// Every record, grouped by cache. Chained caches report one entry each.
    async fn dump(&self) -> IndexMap<String, RecordDump>;
}

/// Glob matching used by [`NormalizedCache::remove_pattern`]: `*` matches any sequence of
/// characters, `?` exactly one. Matching is case sensitive.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let pattern = pattern.chars().collect::<Vec<_>>();
    let key = key.chars().collect::<Vec<_>>();

    let (mut p, mut k) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p).copied() {
            Some('*') => {
                backtrack = Some((p, k));
                p += 1;
            }
            Some('?') => {
                p += 1;
                k += 1;
            }
            Some(c) if c == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    k = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Keys removed by a cascading removal of `root`: `root` itself, then every record reachable
/// from it that no record outside the removed set references. Each record is visited once, so
/// reference cycles terminate.
pub async fn cascade_keys(
    cache: &(impl NormalizedCache + ?Sized),
    root: &CacheKey,
    headers: &CacheHeaders,
) -> Vec<CacheKey> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root.clone()];

    while let Some(key) = stack.pop() {
        if !visited.insert(key.clone()) {
            continue;
        }
        if let Some(record) = cache.load_record(&key, headers).await {
            stack.extend(record.references().into_iter().cloned());
        }
        order.push(key);
    }

    if order.len() == 1 {
        return order;
    }

    let records = cache
        .dump()
        .await
        .into_values()
        .flat_map(IndexMap::into_values)
        .collect::<Vec<_>>();

    // A kept record keeps everything it references, until nothing changes.
    let mut removed = visited;
    loop {
        let kept = records
            .iter()
            .filter(|record| !removed.contains(&record.key))
            .flat_map(Record::references)
            .filter(|key| *key != root && removed.contains(*key))
            .cloned()
            .collect::<HashSet<_>>();
        if kept.is_empty() {
            break;
        }
        for key in &kept {
            removed.remove(key);
        }
    }

    order.retain(|key| removed.contains(key));
    order
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::key_matches;

    #[rstest]
    #[case("*", "QUERY_ROOT", true)]
    #[case("QUERY_ROOT.*", "QUERY_ROOT.hero", true)]
    #[case("QUERY_ROOT.*", "QUERY_ROOT", false)]
    #[case("Droid:*", "Droid:2001", true)]
    #[case("Droid:*", "Human:1000", false)]
    #[case("Droid:200?", "Droid:2001", true)]
    #[case("Droid:200?", "Droid:20011", false)]
    #[case("*.friends.*", "1000.friends.0", true)]
    #[case("a*b*c", "aXbYbZc", true)]
    #[case("a*b*c", "aXbYbZ", false)]
    #[case("droid:*", "Droid:2001", false)]
    fn glob(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(key_matches(pattern, key), expected);
    }
}
