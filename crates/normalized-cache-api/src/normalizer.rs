//! Splits a response tree into flat records.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::{
    cache_key::CacheKeyGeneratorContext,
    selection::{collect_fields, CollectedField, Selection},
    CacheKey, CacheKeyGenerator, Record, RecordValue, Variables,
};

/// Normalizes `data`, the response object rooted at `root_key`, against its selections.
///
/// `root_type` names the type of the root object and is used to match type conditions when the
/// data has no `__typename`. Records reached through several paths are merged, later fields
/// winning. Fields absent from the data are skipped.
pub fn normalize(
    data: &Map<String, Value>,
    selections: &[Selection],
    root_key: CacheKey,
    root_type: &str,
    variables: &Variables,
    key_generator: &dyn CacheKeyGenerator,
) -> IndexMap<CacheKey, Record> {
    let mut normalizer = Normalizer {
        variables,
        key_generator,
        records: IndexMap::new(),
    };

    let selections = selections.iter().collect::<Vec<_>>();
    normalizer.object(data, &selections, root_key, Some(root_type));

    tracing::trace!("normalized {} records", normalizer.records.len());
    normalizer.records
}

struct Normalizer<'a> {
    variables: &'a Variables,
    key_generator: &'a dyn CacheKeyGenerator,
    records: IndexMap<CacheKey, Record>,
}

impl Normalizer<'_> {
    fn object(
        &mut self,
        object: &Map<String, Value>,
        selections: &[&Selection],
        key: CacheKey,
        type_name: Option<&str>,
    ) {
        let typename = object.get("__typename").and_then(Value::as_str).or(type_name);
        let fields = collect_fields(selections, typename, self.variables);

        let mut record = Record::new(key.clone());
        for collected in &fields {
            let Some(value) = object.get(collected.field.response_name()) else {
                continue;
            };

            let field_key = collected.field.field_key(self.variables);
            let path = key.field(&field_key);
            let value = self.value(value, collected, path);
            record.fields.insert(field_key, value);
        }

        match self.records.get_mut(&key) {
            Some(existing) => existing.fields.extend(record.fields),
            None => {
                self.records.insert(key, record);
            }
        }
    }

    fn value(&mut self, value: &Value, collected: &CollectedField<'_>, path: String) -> RecordValue {
        match value {
            Value::Array(values) => RecordValue::List(
                values
                    .iter()
                    .enumerate()
                    .map(|(index, value)| self.value(value, collected, format!("{path}.{index}")))
                    .collect(),
            ),
            Value::Object(object) if collected.field.is_composite() => {
                let context = CacheKeyGeneratorContext {
                    field: collected.field,
                    variables: self.variables,
                };
                let key = self
                    .key_generator
                    .cache_key_for_object(object, &context)
                    .unwrap_or_else(|| CacheKey::new(path));

                self.object(
                    object,
                    &collected.selections,
                    key.clone(),
                    collected.field.type_name.as_deref(),
                );
                RecordValue::Reference(key)
            }
            other => RecordValue::from_json(other),
        }
    }
}
