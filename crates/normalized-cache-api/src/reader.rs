//! Rebuilds response trees out of records.
//!
//! Reading happens in two passes. The first one walks the selections breadth first and loads the
//! records of each depth with a single [`NormalizedCache::load_records`] call. The second one
//! assembles the response from the loaded records, resolving every field through the
//! [`CacheResolver`] and recording the dependent keys of the read.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::{
    resolver::ResolverContext,
    selection::{collect_fields, CollectedField, Selection},
    CacheHeaders, CacheKey, CacheMissError, CacheResolver, NormalizedCache, Record, RecordValue, Variables,
};

pub struct ReadRequest<'a> {
    pub selections: &'a [Selection],
    pub root_key: CacheKey,
    pub root_type: &'a str,
    pub variables: &'a Variables,
    pub resolver: &'a dyn CacheResolver,
    pub headers: &'a CacheHeaders,
    /// Replace missing data with `null` and collect the misses instead of failing.
    pub allow_partial: bool,
    /// Current time in unix seconds, handed to the resolver.
    pub now: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadOutput {
    pub data: Map<String, Value>,
    /// `key.fieldKey` of every field the read depended on, including missing ones.
    pub dependent_keys: HashSet<String>,
    /// Only filled by partial reads.
    pub misses: Vec<CacheMissError>,
}

pub async fn read(cache: &dyn NormalizedCache, request: &ReadRequest<'_>) -> Result<ReadOutput, CacheMissError> {
    let records = load(cache, request).await;

    let mut assembler = Assembler {
        records: &records,
        request,
        dependent_keys: HashSet::new(),
        misses: Vec::new(),
    };
    let selections = request.selections.iter().collect::<Vec<_>>();
    let data = assembler.object(&request.root_key, &selections, Some(request.root_type))?;

    Ok(ReadOutput {
        data,
        dependent_keys: assembler.dependent_keys,
        misses: assembler.misses,
    })
}

type Pending<'a> = (CacheKey, Vec<&'a Selection>, Option<&'a str>);

async fn load(cache: &dyn NormalizedCache, request: &ReadRequest<'_>) -> HashMap<CacheKey, Record> {
    let mut records = HashMap::new();
    let mut absent = HashSet::new();
    let mut seen = HashSet::new();

    let mut pending: Vec<Pending<'_>> = vec![(
        request.root_key.clone(),
        request.selections.iter().collect(),
        Some(request.root_type),
    )];

    while !pending.is_empty() {
        let mut keys = Vec::new();
        for (key, _, _) in &pending {
            if !records.contains_key(key) && !absent.contains(key) && !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        if !keys.is_empty() {
            for record in cache.load_records(&keys, request.headers).await {
                records.insert(record.key.clone(), record);
            }
            absent.extend(keys.into_iter().filter(|key| !records.contains_key(key)));
        }

        let mut next = Vec::new();
        for (key, selections, type_name) in pending.drain(..) {
            let Some(record) = records.get(&key) else {
                continue;
            };
            let typename = record.typename().or(type_name);

            for collected in collect_fields(&selections, typename, request.variables) {
                if !collected.field.is_composite() {
                    continue;
                }

                let field_key = collected.field.field_key(request.variables);
                let context = ResolverContext {
                    field: collected.field,
                    field_key: &field_key,
                    parent: record,
                    variables: request.variables,
                    now: request.now,
                };
                let Ok(value) = request.resolver.resolve_field(&context) else {
                    continue;
                };

                let mut references = Vec::new();
                value.collect_references(&mut references);

                let shape = collected
                    .selections
                    .iter()
                    .map(|selection| std::ptr::from_ref::<Selection>(selection) as usize)
                    .collect::<Vec<_>>();

                for reference in references {
                    if seen.insert((reference.clone(), shape.clone())) {
                        next.push((
                            reference.clone(),
                            collected.selections.clone(),
                            collected.field.type_name.as_deref(),
                        ));
                    }
                }
            }
        }

        pending = next;
    }

    records
}

struct Assembler<'a> {
    records: &'a HashMap<CacheKey, Record>,
    request: &'a ReadRequest<'a>,
    dependent_keys: HashSet<String>,
    misses: Vec<CacheMissError>,
}

impl Assembler<'_> {
    fn object(
        &mut self,
        key: &CacheKey,
        selections: &[&Selection],
        type_name: Option<&str>,
    ) -> Result<Map<String, Value>, CacheMissError> {
        let records = self.records;
        let variables = self.request.variables;

        // A missing root is an empty object: the miss is reported on its first field.
        let empty_root;
        let record = match records.get(key) {
            Some(record) => record,
            None if key.is_root() => {
                empty_root = Record::new(key.clone());
                &empty_root
            }
            None => {
                for collected in collect_fields(selections, type_name, variables) {
                    self.dependent_keys
                        .insert(key.field(&collected.field.field_key(variables)));
                }
                return Err(CacheMissError::missing_object(key.clone()));
            }
        };

        let typename = record.typename().or(type_name);
        let mut data = Map::new();

        for collected in collect_fields(selections, typename, variables) {
            let field_key = collected.field.field_key(variables);
            self.dependent_keys.insert(key.field(&field_key));

            let context = ResolverContext {
                field: collected.field,
                field_key: &field_key,
                parent: record,
                variables,
                now: self.request.now,
            };
            let value = self
                .request
                .resolver
                .resolve_field(&context)
                .and_then(|value| self.value(&value, &collected));

            let value = match value {
                Ok(value) => value,
                Err(miss) if self.request.allow_partial => {
                    self.misses.push(miss);
                    Value::Null
                }
                Err(miss) => return Err(miss),
            };
            data.insert(collected.field.response_name().to_string(), value);
        }

        Ok(data)
    }

    fn value(&mut self, value: &RecordValue, collected: &CollectedField<'_>) -> Result<Value, CacheMissError> {
        match value {
            RecordValue::Reference(key) if collected.field.is_composite() => self
                .object(key, &collected.selections, collected.field.type_name.as_deref())
                .map(Value::Object),
            RecordValue::List(values) => values
                .iter()
                .map(|value| self.value(value, collected))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;
    use crate::{
        cache::RecordDump,
        normalize,
        selection::{ArgumentValue, Field, FragmentSelection},
        DefaultCacheResolver, IdCacheKeyGenerator, RecordMerger,
    };

    /// Bare map cache counting batch loads.
    #[derive(Default)]
    struct MapCache {
        records: Mutex<HashMap<CacheKey, Record>>,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl NormalizedCache for MapCache {
        async fn load_record(&self, key: &CacheKey, _: &CacheHeaders) -> Option<Record> {
            self.records.lock().unwrap().get(key).cloned()
        }

        async fn load_records(&self, keys: &[CacheKey], _: &CacheHeaders) -> Vec<Record> {
            self.batches.lock().unwrap().push(keys.len());
            let records = self.records.lock().unwrap();
            keys.iter().filter_map(|key| records.get(key).cloned()).collect()
        }

        async fn merge(&self, record: Record, _: &CacheHeaders, _: &dyn RecordMerger) -> HashSet<String> {
            let changed = record.field_keys();
            self.records.lock().unwrap().insert(record.key.clone(), record);
            changed
        }

        async fn remove(&self, key: &CacheKey, _: bool) -> bool {
            self.records.lock().unwrap().remove(key).is_some()
        }

        async fn remove_pattern(&self, _: &str) -> usize {
            0
        }

        async fn clear_all(&self) {
            self.records.lock().unwrap().clear();
        }

        async fn dump(&self) -> IndexMap<String, RecordDump> {
            IndexMap::new()
        }
    }

    fn selections() -> Vec<Selection> {
        vec![Field::new("hero")
            .argument("episode", ArgumentValue::literal("JEDI"))
            .selections([
                Field::new("__typename").into(),
                Field::new("id").into(),
                Field::new("name").into(),
                FragmentSelection::on("Droid")
                    .selections([Field::new("primaryFunction").into()])
                    .into(),
                Field::new("friends")
                    .selections([
                        Field::new("id").into(),
                        Field::new("name").into(),
                        Field::new("friends")
                            .selections([Field::new("id").into()])
                            .into(),
                    ])
                    .into(),
            ])
            .into()]
    }

    fn data() -> Value {
        json!({
            "hero": {
                "__typename": "Droid",
                "id": "2001",
                "name": "R2-D2",
                "primaryFunction": "Astromech",
                "friends": [
                    {"id": "1000", "name": "Luke", "friends": [{"id": "2001"}]},
                    {"id": "1003", "name": "Leia", "friends": []}
                ]
            }
        })
    }

    async fn cache_with(data: &Value) -> MapCache {
        let cache = MapCache::default();
        let records = normalize(
            data.as_object().unwrap(),
            &selections(),
            CacheKey::root_query(),
            "Query",
            &Variables::new(),
            &IdCacheKeyGenerator::default(),
        );
        for (_, record) in records {
            cache.records.lock().unwrap().insert(record.key.clone(), record);
        }
        cache
    }

    fn request<'a>(selections: &'a [Selection], variables: &'a Variables, headers: &'a CacheHeaders) -> ReadRequest<'a> {
        ReadRequest {
            selections,
            root_key: CacheKey::root_query(),
            root_type: "Query",
            variables,
            resolver: &DefaultCacheResolver,
            headers,
            allow_partial: false,
            now: 0,
        }
    }

    #[tokio::test]
    async fn round_trip_with_cycles() {
        let data = data();
        let cache = cache_with(&data).await;
        let (selections, variables, headers) = (selections(), Variables::new(), CacheHeaders::none());

        let output = read(&cache, &request(&selections, &variables, &headers)).await.unwrap();

        assert_eq!(Value::Object(output.data), data);
        assert!(output.dependent_keys.contains("2001.primaryFunction"));
        assert!(output.dependent_keys.contains("1000.friends"));
        // one batch per depth, records already loaded are not fetched again
        assert_eq!(*cache.batches.lock().unwrap(), vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn missing_fields_are_misses() {
        let data = data();
        let cache = cache_with(&data).await;
        cache
            .records
            .lock()
            .unwrap()
            .get_mut(&CacheKey::new("1003"))
            .unwrap()
            .fields
            .shift_remove("name");
        let (selections, variables, headers) = (selections(), Variables::new(), CacheHeaders::none());

        let error = read(&cache, &request(&selections, &variables, &headers)).await.unwrap_err();
        assert_eq!(error, CacheMissError::missing_field(CacheKey::new("1003"), "name"));

        let mut partial = request(&selections, &variables, &headers);
        partial.allow_partial = true;
        let output = read(&cache, &partial).await.unwrap();
        assert_eq!(output.data["hero"]["friends"][1]["name"], Value::Null);
        assert_eq!(output.misses, vec![error]);
    }

    #[tokio::test]
    async fn null_is_not_a_miss() {
        let data = json!({"hero": null});
        let cache = cache_with(&data).await;
        let (selections, variables, headers) = (selections(), Variables::new(), CacheHeaders::none());

        let output = read(&cache, &request(&selections, &variables, &headers)).await.unwrap();
        assert_eq!(Value::Object(output.data), data);
    }

    #[tokio::test]
    async fn empty_cache_reports_the_root_field() {
        let cache = MapCache::default();
        let (selections, variables, headers) = (selections(), Variables::new(), CacheHeaders::none());

        let error = read(&cache, &request(&selections, &variables, &headers)).await.unwrap_err();
        assert_eq!(
            error,
            CacheMissError::missing_field(CacheKey::root_query(), r#"hero({"episode":"JEDI"})"#)
        );
    }

    #[tokio::test]
    async fn missing_records_are_misses() {
        let data = data();
        let cache = cache_with(&data).await;
        cache.records.lock().unwrap().remove(&CacheKey::new("2001"));
        let (selections, variables, headers) = (selections(), Variables::new(), CacheHeaders::none());

        let error = read(&cache, &request(&selections, &variables, &headers)).await.unwrap_err();
        assert_eq!(error, CacheMissError::missing_object(CacheKey::new("2001")));
    }
}
