use std::{
    collections::HashSet,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use indexmap::IndexMap;
use normalized_cache_api::{
    normalize, read, CacheError, CacheHeaders, CacheKey, CacheKeyGenerator, CacheMissError, CacheResolver,
    DefaultCacheResolver, DefaultRecordMerger, Fragment, NormalizedCache, Operation, PathCacheKeyGenerator,
    ReadRequest, Record, RecordDump, RecordMerger, Selection, Variables,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock, RwLockWriteGuard};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{MemoryCache, OptimisticCache};

const DEFAULT_CHANGED_KEYS_CAPACITY: usize = 64;

/// A batch of `key.fieldKey` whose value changed, shared between subscribers.
pub type ChangedKeys = Arc<HashSet<String>>;

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The single entry point to a normalized cache.
///
/// Writes are serialized against each other and against reads, reads run concurrently. Every
/// write returns the `key.fieldKey` it changed and, unless asked not to, publishes them on the
/// [`ApolloStore::changed_keys`] channel before releasing the cache. Subscribers too slow to keep
/// up lose the oldest batches and must re-read.
pub struct ApolloStore {
    cache: RwLock<OptimisticCache>,
    changed_keys: broadcast::Sender<ChangedKeys>,
    key_generator: Arc<dyn CacheKeyGenerator>,
    resolver: Arc<dyn CacheResolver>,
    merger: Arc<dyn RecordMerger>,
    clock: Clock,
    track_dates: bool,
}

pub struct ApolloStoreBuilder {
    cache: Option<Arc<dyn NormalizedCache>>,
    key_generator: Arc<dyn CacheKeyGenerator>,
    resolver: Arc<dyn CacheResolver>,
    merger: Arc<dyn RecordMerger>,
    clock: Clock,
    track_dates: bool,
    changed_keys_capacity: usize,
}

impl Default for ApolloStoreBuilder {
    fn default() -> Self {
        ApolloStoreBuilder {
            cache: None,
            key_generator: Arc::new(PathCacheKeyGenerator),
            resolver: Arc::new(DefaultCacheResolver),
            merger: Arc::new(DefaultRecordMerger),
            clock: Arc::new(unix_now),
            track_dates: false,
            changed_keys_capacity: DEFAULT_CHANGED_KEYS_CAPACITY,
        }
    }
}

impl ApolloStoreBuilder {
    /// Storage under the optimistic overlay. Defaults to an unbounded [`MemoryCache`].
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn NormalizedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Object identity. Defaults to path based keys.
    #[must_use]
    pub fn key_generator(mut self, key_generator: impl CacheKeyGenerator + 'static) -> Self {
        self.key_generator = Arc::new(key_generator);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: impl CacheResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    #[must_use]
    pub fn merger(mut self, merger: impl RecordMerger + 'static) -> Self {
        self.merger = Arc::new(merger);
        self
    }

    /// Current time in unix seconds, used for receive dates and staleness.
    #[must_use]
    pub fn clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Stamps written fields with their receive date when the write headers carry none.
    #[must_use]
    pub fn track_dates(mut self, track_dates: bool) -> Self {
        self.track_dates = track_dates;
        self
    }

    #[must_use]
    pub fn changed_keys_capacity(mut self, capacity: usize) -> Self {
        self.changed_keys_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ApolloStore {
        let cache = self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let (changed_keys, _) = broadcast::channel(self.changed_keys_capacity);

        ApolloStore {
            cache: RwLock::new(OptimisticCache::new(cache)),
            changed_keys,
            key_generator: self.key_generator,
            resolver: self.resolver,
            merger: self.merger,
            clock: self.clock,
            track_dates: self.track_dates,
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    /// Replace missing fields with `null` instead of failing, see [`ReadResult::misses`].
    pub allow_partial: bool,
    pub headers: CacheHeaders,
}

impl ReadOptions {
    pub fn partial() -> Self {
        ReadOptions {
            allow_partial: true,
            headers: CacheHeaders::none(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadResult {
    pub data: Map<String, Value>,
    /// `key.fieldKey` this read depends on, compared against [`ApolloStore::changed_keys`].
    pub dependent_keys: HashSet<String>,
    pub misses: Vec<CacheMissError>,
}

impl ReadResult {
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|error| CacheError::InvalidData {
            path: "data".to_string(),
            message: error.to_string(),
        })
    }
}

impl ApolloStore {
    pub fn builder() -> ApolloStoreBuilder {
        ApolloStoreBuilder::default()
    }

    /// Splits operation data into records without writing them.
    pub fn normalize(
        &self,
        operation: &Operation,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> IndexMap<CacheKey, Record> {
        normalize(
            data,
            &operation.selections,
            operation.root_key(),
            operation.kind.root_type(),
            variables,
            self.key_generator.as_ref(),
        )
    }

    fn normalize_fragment(
        &self,
        fragment: &Fragment,
        key: &CacheKey,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> IndexMap<CacheKey, Record> {
        normalize(
            data,
            &fragment.selections,
            key.clone(),
            &fragment.type_condition,
            variables,
            self.key_generator.as_ref(),
        )
    }

    pub async fn write_operation(
        &self,
        operation: &Operation,
        data: &Map<String, Value>,
        variables: &Variables,
        headers: &CacheHeaders,
        publish: bool,
    ) -> HashSet<String> {
        let records = self.normalize(operation, data, variables);
        self.merge(records, headers, publish).await
    }

    /// Writes `data` as the object `key`, shaped by `fragment`.
    pub async fn write_fragment(
        &self,
        fragment: &Fragment,
        key: &CacheKey,
        data: &Map<String, Value>,
        variables: &Variables,
        headers: &CacheHeaders,
        publish: bool,
    ) -> HashSet<String> {
        let records = self.normalize_fragment(fragment, key, data, variables);
        self.merge(records, headers, publish).await
    }

    async fn merge(&self, records: IndexMap<CacheKey, Record>, headers: &CacheHeaders, publish: bool) -> HashSet<String> {
        let stamped;
        let headers = if self.track_dates && headers.received_date().is_none() {
            stamped = headers.clone().with_received_date((self.clock)());
            &stamped
        } else {
            headers
        };

        let cache = self.cache.write().await;
        let count = records.len();
        let changed = cache
            .merge_records(records.into_values().collect(), headers, self.merger.as_ref())
            .await;
        tracing::debug!("merged {count} records, {} fields changed", changed.len());

        if publish {
            self.send(&changed);
        }
        changed
    }

    pub async fn write_optimistic_updates(
        &self,
        operation: &Operation,
        data: &Map<String, Value>,
        variables: &Variables,
        mutation_id: Uuid,
        publish: bool,
    ) -> HashSet<String> {
        let records = self.normalize(operation, data, variables);
        self.add_optimistic_updates(mutation_id, records, publish).await
    }

    pub async fn write_optimistic_fragment(
        &self,
        fragment: &Fragment,
        key: &CacheKey,
        data: &Map<String, Value>,
        variables: &Variables,
        mutation_id: Uuid,
        publish: bool,
    ) -> HashSet<String> {
        let records = self.normalize_fragment(fragment, key, data, variables);
        self.add_optimistic_updates(mutation_id, records, publish).await
    }

    async fn add_optimistic_updates(
        &self,
        mutation_id: Uuid,
        records: IndexMap<CacheKey, Record>,
        publish: bool,
    ) -> HashSet<String> {
        let cache = self.cache.write().await;
        let changed = cache
            .add_optimistic_updates(mutation_id, records.into_values().collect())
            .await;

        if publish {
            self.send(&changed);
        }
        changed
    }

    pub async fn rollback_optimistic_updates(&self, mutation_id: Uuid, publish: bool) -> HashSet<String> {
        let cache = self.cache.write().await;
        let changed = cache.remove_optimistic_updates(mutation_id).await;

        if publish {
            self.send(&changed);
        }
        changed
    }

    pub async fn read_operation(
        &self,
        operation: &Operation,
        variables: &Variables,
        options: &ReadOptions,
    ) -> Result<ReadResult, CacheError> {
        self.read(
            &operation.selections,
            operation.root_key(),
            operation.kind.root_type(),
            variables,
            options,
        )
        .await
    }

    /// Reads the object `key` through `fragment`.
    pub async fn read_fragment(
        &self,
        fragment: &Fragment,
        key: &CacheKey,
        variables: &Variables,
        options: &ReadOptions,
    ) -> Result<ReadResult, CacheError> {
        self.read(&fragment.selections, key.clone(), &fragment.type_condition, variables, options)
            .await
    }

    async fn read(
        &self,
        selections: &[Selection],
        root_key: CacheKey,
        root_type: &str,
        variables: &Variables,
        options: &ReadOptions,
    ) -> Result<ReadResult, CacheError> {
        let request = ReadRequest {
            selections,
            root_key,
            root_type,
            variables,
            resolver: self.resolver.as_ref(),
            headers: &options.headers,
            allow_partial: options.allow_partial,
            now: (self.clock)(),
        };

        let cache = self.cache.read().await;
        let output = read(&*cache, &request).await?;

        Ok(ReadResult {
            data: output.data,
            dependent_keys: output.dependent_keys,
            misses: output.misses,
        })
    }

    /// Publishes keys changed by writes made with `publish: false`. Empty batches are dropped.
    pub fn publish(&self, changed: HashSet<String>) {
        if !changed.is_empty() {
            // A send only fails without subscribers.
            let _ = self.changed_keys.send(Arc::new(changed));
        }
    }

    fn send(&self, changed: &HashSet<String>) {
        self.publish(changed.clone());
    }

    /// Batches of changed keys published from now on. A subscriber that falls more than the
    /// channel capacity behind receives a lag error in place of the dropped batches.
    pub fn changed_keys(&self) -> BroadcastStream<ChangedKeys> {
        BroadcastStream::new(self.changed_keys.subscribe())
    }

    /// Removes a record, and with `cascade` every record reachable from it. Nothing is published.
    pub async fn remove(&self, key: &CacheKey, cascade: bool) -> bool {
        let removed = self.cache.write().await.remove(key, cascade).await;
        tracing::debug!("removed {key} (cascade: {cascade}): {removed}");
        removed
    }

    pub async fn remove_pattern(&self, pattern: &str) -> usize {
        let removed = self.cache.write().await.remove_pattern(pattern).await;
        tracing::debug!("removed {removed} records matching {pattern}");
        removed
    }

    pub async fn clear_all(&self) {
        self.cache.write().await.clear_all().await;
        tracing::debug!("cleared the cache");
    }

    pub async fn dump(&self) -> IndexMap<String, RecordDump> {
        self.cache.read().await.dump().await
    }

    /// Exclusive access to the storage, for operations the store has no method for. No other read
    /// or write runs until the guard is dropped, and nothing is published.
    pub async fn access_cache(&self) -> RwLockWriteGuard<'_, OptimisticCache> {
        self.cache.write().await
    }
}
