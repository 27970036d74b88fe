use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::CacheKey;

const REFERENCE_TAG: &str = "$ref";
const OBJECT_TAG: &str = "$object";

/// A value stored in one field of a [`Record`].
///
/// Objects with a selection set never live inline: they are normalized into their own record and
/// referenced by key. `Object` only holds values without shape information, custom JSON scalars
/// for instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum RecordValue {
    Null,
    Boolean(bool),
    Number(Number),
    String(String),
    List(Vec<RecordValue>),
    Object(IndexMap<String, RecordValue>),
    Reference(CacheKey),
}

impl RecordValue {
    pub fn reference(key: impl Into<CacheKey>) -> Self {
        RecordValue::Reference(key.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RecordValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RecordValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&CacheKey> {
        match self {
            RecordValue::Reference(key) => Some(key),
            _ => None,
        }
    }

    /// Converts a response scalar, list or shapeless object.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => RecordValue::Null,
            Value::Bool(value) => RecordValue::Boolean(*value),
            Value::Number(value) => RecordValue::Number(value.clone()),
            Value::String(value) => RecordValue::String(value.clone()),
            Value::Array(values) => RecordValue::List(values.iter().map(RecordValue::from_json).collect()),
            Value::Object(fields) => RecordValue::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), RecordValue::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Back to a response value. References have no response representation and render as their key.
    pub fn to_json(&self) -> Value {
        match self {
            RecordValue::Null => Value::Null,
            RecordValue::Boolean(value) => Value::Bool(*value),
            RecordValue::Number(value) => Value::Number(value.clone()),
            RecordValue::String(value) => Value::String(value.clone()),
            RecordValue::List(values) => Value::Array(values.iter().map(RecordValue::to_json).collect()),
            RecordValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect(),
            ),
            RecordValue::Reference(key) => Value::String(key.to_string()),
        }
    }

    pub(crate) fn collect_references<'a>(&'a self, out: &mut Vec<&'a CacheKey>) {
        match self {
            RecordValue::Reference(key) => out.push(key),
            RecordValue::List(values) => values.iter().for_each(|value| value.collect_references(out)),
            RecordValue::Object(fields) => fields.values().for_each(|value| value.collect_references(out)),
            _ => (),
        }
    }

    fn size_estimate(&self) -> usize {
        match self {
            RecordValue::Null | RecordValue::Boolean(_) => 1,
            RecordValue::Number(_) => 8,
            RecordValue::String(value) => value.len(),
            RecordValue::Reference(key) => key.as_str().len(),
            RecordValue::List(values) => values.iter().map(RecordValue::size_estimate).sum::<usize>() + 8,
            RecordValue::Object(fields) => {
                fields
                    .iter()
                    .map(|(name, value)| name.len() + value.size_estimate())
                    .sum::<usize>()
                    + 8
            }
        }
    }
}

// Storage encoding: scalars and lists are plain JSON, every JSON object is tagged so that
// references and inline objects can never be confused with each other.
impl From<RecordValue> for Value {
    fn from(value: RecordValue) -> Self {
        match value {
            RecordValue::Null => Value::Null,
            RecordValue::Boolean(value) => Value::Bool(value),
            RecordValue::Number(value) => Value::Number(value),
            RecordValue::String(value) => Value::String(value),
            RecordValue::List(values) => Value::Array(values.into_iter().map(Value::from).collect()),
            RecordValue::Object(fields) => {
                let fields = fields.into_iter().map(|(name, value)| (name, Value::from(value))).collect();
                let mut tagged = Map::new();
                tagged.insert(OBJECT_TAG.to_string(), Value::Object(fields));
                Value::Object(tagged)
            }
            RecordValue::Reference(key) => {
                let mut tagged = Map::new();
                tagged.insert(REFERENCE_TAG.to_string(), Value::String(key.into_string()));
                Value::Object(tagged)
            }
        }
    }
}

impl TryFrom<Value> for RecordValue {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Null => RecordValue::Null,
            Value::Bool(value) => RecordValue::Boolean(value),
            Value::Number(value) => RecordValue::Number(value),
            Value::String(value) => RecordValue::String(value),
            Value::Array(values) => RecordValue::List(
                values
                    .into_iter()
                    .map(RecordValue::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(mut tagged) => {
                if tagged.len() != 1 {
                    return Err(format!("expected a tagged object, found {} entries", tagged.len()));
                }
                match (tagged.remove(REFERENCE_TAG), tagged.remove(OBJECT_TAG)) {
                    (Some(Value::String(key)), None) => RecordValue::Reference(CacheKey::new(key)),
                    (None, Some(Value::Object(fields))) => RecordValue::Object(
                        fields
                            .into_iter()
                            .map(|(name, value)| Ok((name, RecordValue::try_from(value)?)))
                            .collect::<Result<_, String>>()?,
                    ),
                    _ => return Err("unknown record value tag".to_string()),
                }
            }
        })
    }
}

/// The flattened storage unit for one logical GraphQL object.
///
/// Field keys map to values, objects are only ever referenced. `dates` holds the receive date
/// (unix seconds) of each field when date tracking is enabled. `mutation_id` is only set on the
/// speculative records of the optimistic overlay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: CacheKey,
    pub fields: IndexMap<String, RecordValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub dates: IndexMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<Uuid>,
}

impl Record {
    pub fn new(key: impl Into<CacheKey>) -> Self {
        Record {
            key: key.into(),
            fields: IndexMap::new(),
            dates: IndexMap::new(),
            mutation_id: None,
        }
    }

    #[must_use]
    pub fn with_field(mut self, field_key: impl Into<String>, value: RecordValue) -> Self {
        self.fields.insert(field_key.into(), value);
        self
    }

    #[must_use]
    pub fn with_mutation_id(mut self, mutation_id: Uuid) -> Self {
        self.mutation_id = Some(mutation_id);
        self
    }

    pub fn get(&self, field_key: &str) -> Option<&RecordValue> {
        self.fields.get(field_key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.dates.is_empty()
    }

    /// `key.fieldKey` for every field, the form used by change notifications.
    pub fn field_keys(&self) -> HashSet<String> {
        self.fields.keys().map(|field| self.key.field(field)).collect()
    }

    pub fn typename(&self) -> Option<&str> {
        self.fields.get("__typename").and_then(RecordValue::as_str)
    }

    /// Every key this record points to, including references nested in lists.
    pub fn references(&self) -> Vec<&CacheKey> {
        let mut out = Vec::new();
        for value in self.fields.values() {
            value.collect_references(&mut out);
        }
        out
    }

    /// Applies the delta returned by a [`crate::RecordMerger`].
    pub fn apply(&mut self, delta: Record) {
        self.fields.extend(delta.fields);
        self.dates.extend(delta.dates);
        if delta.mutation_id.is_some() {
            self.mutation_id = delta.mutation_id;
        }
    }

    /// Rough memory footprint, used to bound the in-memory cache.
    pub fn size_estimate(&self) -> usize {
        self.key.as_str().len()
            + self
                .fields
                .iter()
                .map(|(name, value)| name.len() + value.size_estimate())
                .sum::<usize>()
            + self.dates.len() * 16
    }
}

/// Fields whose value differs between two states of the same record, as `key.fieldKey`.
pub fn changed_field_keys(before: Option<&Record>, after: Option<&Record>) -> HashSet<String> {
    let mut changed = HashSet::new();
    let Some(key) = before.or(after).map(|record| &record.key) else {
        return changed;
    };
    let empty = IndexMap::new();
    let before = before.map_or(&empty, |record| &record.fields);
    let after = after.map_or(&empty, |record| &record.fields);

    for (field, value) in after {
        if before.get(field) != Some(value) {
            changed.insert(key.field(field));
        }
    }
    for field in before.keys() {
        if !after.contains_key(field) {
            changed.insert(key.field(field));
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn storage_encoding_keeps_references_apart_from_objects() {
        let record = Record::new("1000")
            .with_field("name", RecordValue::String("Luke".into()))
            .with_field("friends", RecordValue::List(vec![RecordValue::reference("1002"), RecordValue::Null]))
            .with_field("metadata", RecordValue::from_json(&json!({"$ref": "not a reference"})));

        let encoded = serde_json::to_value(&record.fields).unwrap();
        assert_eq!(
            encoded,
            json!({
                "name": "Luke",
                "friends": [{"$ref": "1002"}, null],
                "metadata": {"$object": {"$ref": "not a reference"}},
            })
        );

        let decoded: IndexMap<String, RecordValue> = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, record.fields);
    }

    #[test]
    fn corrupted_tags_are_rejected() {
        let result = serde_json::from_value::<RecordValue>(json!({"what": 1}));
        assert!(result.is_err());
    }

    #[test]
    fn references_are_collected_from_lists() {
        let record = Record::new("QUERY_ROOT")
            .with_field("hero", RecordValue::reference("1000"))
            .with_field(
                "droids",
                RecordValue::List(vec![RecordValue::List(vec![RecordValue::reference("2001")])]),
            );

        let references = record.references();
        assert_eq!(references, vec![&CacheKey::new("1000"), &CacheKey::new("2001")]);
    }

    #[test]
    fn changed_keys_cover_added_updated_and_removed_fields() {
        let before = Record::new("1000")
            .with_field("name", RecordValue::String("Luke".into()))
            .with_field("height", RecordValue::Number(172.into()));
        let after = Record::new("1000")
            .with_field("name", RecordValue::String("Leia".into()))
            .with_field("mass", RecordValue::Number(49.into()));

        let mut changed = changed_field_keys(Some(&before), Some(&after)).into_iter().collect::<Vec<_>>();
        changed.sort();
        assert_eq!(changed, vec!["1000.height", "1000.mass", "1000.name"]);

        assert!(changed_field_keys(Some(&before), Some(&before)).is_empty());
        assert_eq!(changed_field_keys(None, Some(&after)).len(), 2);
        assert!(changed_field_keys(None, None).is_empty());
    }
}
