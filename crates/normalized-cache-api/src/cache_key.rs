use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{selection::Field, Variables};

const QUERY_ROOT: &str = "QUERY_ROOT";
const MUTATION_ROOT: &str = "MUTATION_ROOT";
const SUBSCRIPTION_ROOT: &str = "SUBSCRIPTION_ROOT";

/// Identity of one record inside a normalized cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        CacheKey(key.into())
    }

    pub fn root_query() -> Self {
        CacheKey(QUERY_ROOT.to_string())
    }

    pub fn root_mutation() -> Self {
        CacheKey(MUTATION_ROOT.to_string())
    }

    pub fn root_subscription() -> Self {
        CacheKey(SUBSCRIPTION_ROOT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        matches!(self.0.as_str(), QUERY_ROOT | MUTATION_ROOT | SUBSCRIPTION_ROOT)
    }

    /// The identifier used in change notifications for one field of this record: `key.fieldKey`.
    pub fn field(&self, field_key: &str) -> String {
        format!("{}.{field_key}", self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        CacheKey::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        CacheKey(value)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub struct CacheKeyGeneratorContext<'a> {
    /// The field whose value is being normalized.
    pub field: &'a Field,
    pub variables: &'a Variables,
}

/// Decides the identity of objects met during normalization.
///
/// Returning `None` makes the normalizer fall back to a path based key, `parentKey.fieldKey`.
pub trait CacheKeyGenerator: Send + Sync {
    fn cache_key_for_object(&self, object: &Map<String, Value>, context: &CacheKeyGeneratorContext<'_>)
        -> Option<CacheKey>;
}

/// Never resolves an identity, every object is stored under its path.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathCacheKeyGenerator;

impl CacheKeyGenerator for PathCacheKeyGenerator {
    fn cache_key_for_object(&self, _: &Map<String, Value>, _: &CacheKeyGeneratorContext<'_>) -> Option<CacheKey> {
        None
    }
}

/// Builds keys out of the values of a fixed set of fields, `id` being the usual one.
///
/// All key fields must be present with a scalar value, otherwise the object falls back to its
/// path. Composite keys are joined with `+`.
#[derive(Clone, Debug)]
pub struct IdCacheKeyGenerator {
    key_fields: Vec<String>,
    type_prefixed: bool,
}

impl IdCacheKeyGenerator {
    pub fn new<I, S>(key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IdCacheKeyGenerator {
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            type_prefixed: false,
        }
    }

    /// Prefixes keys with the `__typename` of the object: `Droid:2001`.
    #[must_use]
    pub fn type_prefixed(mut self) -> Self {
        self.type_prefixed = true;
        self
    }
}

impl Default for IdCacheKeyGenerator {
    fn default() -> Self {
        IdCacheKeyGenerator::new(["id"])
    }
}

impl CacheKeyGenerator for IdCacheKeyGenerator {
    fn cache_key_for_object(&self, object: &Map<String, Value>, _: &CacheKeyGeneratorContext<'_>) -> Option<CacheKey> {
        if self.key_fields.is_empty() {
            return None;
        }

        let mut parts = Vec::with_capacity(self.key_fields.len());
        for field in &self.key_fields {
            match object.get(field)? {
                Value::String(value) => parts.push(value.clone()),
                Value::Number(value) => parts.push(value.to_string()),
                Value::Bool(value) => parts.push(value.to_string()),
                _ => return None,
            }
        }

        let id = parts.join("+");
        if self.type_prefixed {
            let typename = object.get("__typename")?.as_str()?;
            Some(CacheKey(format!("{typename}:{id}")))
        } else {
            Some(CacheKey(id))
        }
    }
}
