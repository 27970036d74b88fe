use std::{collections::HashSet, sync::Arc};

use futures_util::lock::Mutex;
use indexmap::IndexMap;
use normalized_cache_api::{
    cascade_keys, changed_field_keys, key_matches, CacheHeaders, CacheKey, NormalizedCache, Record, RecordDump,
    RecordMerger,
};
use uuid::Uuid;

const IDENTITY: &str = "OptimisticCache";

/// Speculative records layered over a base cache, one batch per mutation.
///
/// Batches are kept in the order they were added. The effective record of a key is the base
/// record with the fields of every batch defining that key applied on top, oldest batch first, so
/// that the latest batch wins. Removing a batch never touches the base cache: once every batch is
/// gone, reads see exactly the base state again.
pub struct OptimisticCache {
    base: Arc<dyn NormalizedCache>,
    batches: Mutex<Vec<OptimisticBatch>>,
}

struct OptimisticBatch {
    mutation_id: Uuid,
    records: IndexMap<CacheKey, Record>,
}

impl OptimisticCache {
    pub fn new(base: Arc<dyn NormalizedCache>) -> Self {
        OptimisticCache {
            base,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn base(&self) -> &Arc<dyn NormalizedCache> {
        &self.base
    }

    /// Applies `records` in the batch of `mutation_id`, creating the batch on first use. Returns
    /// the `key.fieldKey` of every field whose effective value changed.
    pub async fn add_optimistic_updates(&self, mutation_id: Uuid, records: Vec<Record>) -> HashSet<String> {
        let keys = records.iter().map(|record| record.key.clone()).collect::<Vec<_>>();
        let before = self.effective_records(&keys, &CacheHeaders::none()).await;

        {
            let mut batches = self.batches.lock().await;
            let position = match batches.iter().position(|batch| batch.mutation_id == mutation_id) {
                Some(position) => position,
                None => {
                    batches.push(OptimisticBatch {
                        mutation_id,
                        records: IndexMap::new(),
                    });
                    batches.len() - 1
                }
            };

            let batch = &mut batches[position];
            for record in records {
                let record = record.with_mutation_id(mutation_id);
                match batch.records.get_mut(&record.key) {
                    Some(existing) => existing.apply(record),
                    None => {
                        batch.records.insert(record.key.clone(), record);
                    }
                }
            }
        }

        let after = self.effective_records(&keys, &CacheHeaders::none()).await;
        let changed = diff(&keys, &before, &after);
        tracing::debug!(
            "added optimistic updates for mutation {mutation_id}, {} fields changed",
            changed.len()
        );
        changed
    }

    /// Drops the batch of `mutation_id`. Returns the `key.fieldKey` of every field whose effective
    /// value changed, falling back to an older batch or to the base cache.
    pub async fn remove_optimistic_updates(&self, mutation_id: Uuid) -> HashSet<String> {
        let keys = {
            let batches = self.batches.lock().await;
            match batches.iter().find(|batch| batch.mutation_id == mutation_id) {
                Some(batch) => batch.records.keys().cloned().collect::<Vec<_>>(),
                None => {
                    tracing::warn!("no optimistic updates to roll back for mutation {mutation_id}");
                    return HashSet::new();
                }
            }
        };

        let before = self.effective_records(&keys, &CacheHeaders::none()).await;
        self.batches
            .lock()
            .await
            .retain(|batch| batch.mutation_id != mutation_id);
        let after = self.effective_records(&keys, &CacheHeaders::none()).await;

        let changed = diff(&keys, &before, &after);
        tracing::debug!(
            "rolled back optimistic updates for mutation {mutation_id}, {} fields changed",
            changed.len()
        );
        changed
    }

    /// Mutation ids with pending optimistic updates, oldest first.
    pub async fn pending_mutations(&self) -> Vec<Uuid> {
        self.batches
            .lock()
            .await
            .iter()
            .map(|batch| batch.mutation_id)
            .collect()
    }

    async fn effective_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> IndexMap<CacheKey, Record> {
        let mut records = self
            .base
            .load_records(keys, headers)
            .await
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect::<IndexMap<_, _>>();

        let batches = self.batches.lock().await;
        for key in keys {
            for batch in batches.iter() {
                let Some(overlay) = batch.records.get(key) else {
                    continue;
                };
                match records.get_mut(key) {
                    Some(record) => record.apply(overlay.clone()),
                    None => {
                        records.insert(key.clone(), overlay.clone());
                    }
                }
            }
        }

        records
    }
}

fn diff(keys: &[CacheKey], before: &IndexMap<CacheKey, Record>, after: &IndexMap<CacheKey, Record>) -> HashSet<String> {
    keys.iter()
        .flat_map(|key| changed_field_keys(before.get(key), after.get(key)))
        .collect()
}

#[async_trait::async_trait]
impl NormalizedCache for OptimisticCache {
    async fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> Option<Record> {
        self.effective_records(std::slice::from_ref(key), headers)
            .await
            .shift_remove(key)
    }

    async fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> Vec<Record> {
        self.effective_records(keys, headers).await.into_values().collect()
    }

    async fn merge(&self, record: Record, headers: &CacheHeaders, merger: &dyn RecordMerger) -> HashSet<String> {
        self.base.merge(record, headers, merger).await
    }

    async fn merge_records(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> HashSet<String> {
        self.base.merge_records(records, headers, merger).await
    }

    async fn remove(&self, key: &CacheKey, cascade: bool) -> bool {
        let keys = if cascade {
            cascade_keys(self, key, &CacheHeaders::none()).await
        } else {
            vec![key.clone()]
        };

        let mut removed = false;
        {
            let mut batches = self.batches.lock().await;
            for batch in batches.iter_mut() {
                for key in &keys {
                    removed |= batch.records.shift_remove(key).is_some();
                }
            }
        }
        for key in &keys {
            removed |= self.base.remove(key, false).await;
        }

        removed
    }

    async fn remove_pattern(&self, pattern: &str) -> usize {
        {
            let mut batches = self.batches.lock().await;
            for batch in batches.iter_mut() {
                batch.records.retain(|key, _| !key_matches(pattern, key.as_str()));
            }
        }
        self.base.remove_pattern(pattern).await
    }

    async fn clear_all(&self) {
        self.batches.lock().await.clear();
        self.base.clear_all().await;
    }

    async fn dump(&self) -> IndexMap<String, RecordDump> {
        let mut overlay = RecordDump::new();
        for batch in self.batches.lock().await.iter() {
            for (key, record) in &batch.records {
                match overlay.get_mut(key) {
                    Some(existing) => existing.apply(record.clone()),
                    None => {
                        overlay.insert(key.clone(), record.clone());
                    }
                }
            }
        }

        let mut dump = self.base.dump().await;
        dump.insert(IDENTITY.to_string(), overlay);
        dump
    }
}
