use std::collections::HashMap;

use serde_json::Value;

use crate::{
    field_key::resolve_argument, selection::Field, CacheKey, CacheMissError, Record, RecordValue, Variables,
};

pub struct ResolverContext<'a> {
    pub field: &'a Field,
    /// Storage key of `field` in `parent`, arguments resolved.
    pub field_key: &'a str,
    pub parent: &'a Record,
    pub variables: &'a Variables,
    /// Current time in unix seconds.
    pub now: i64,
}

/// Resolves the value of one field while reading from the cache.
pub trait CacheResolver: Send + Sync {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<RecordValue, CacheMissError>;
}

/// Reads the field from its record.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCacheResolver;

impl CacheResolver for DefaultCacheResolver {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<RecordValue, CacheMissError> {
        context
            .parent
            .get(context.field_key)
            .cloned()
            .ok_or_else(|| CacheMissError::missing_field(context.parent.key.clone(), context.field_key))
    }
}

/// Like [`DefaultCacheResolver`], but fields received more than `max_age_seconds` ago are
/// reported as stale misses. Fields written without a receive date are considered fresh.
#[derive(Clone, Copy, Debug)]
pub struct ReceiveDateCacheResolver {
    max_age_seconds: i64,
}

impl ReceiveDateCacheResolver {
    pub fn new(max_age_seconds: u64) -> Self {
        ReceiveDateCacheResolver {
            max_age_seconds: i64::try_from(max_age_seconds).unwrap_or(i64::MAX),
        }
    }
}

impl CacheResolver for ReceiveDateCacheResolver {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<RecordValue, CacheMissError> {
        let value = DefaultCacheResolver.resolve_field(context)?;

        if let Some(received) = context.parent.dates.get(context.field_key) {
            if context.now.saturating_sub(*received) > self.max_age_seconds {
                return Err(CacheMissError::stale_field(
                    context.parent.key.clone(),
                    context.field_key,
                ));
            }
        }

        Ok(value)
    }
}

/// Resolves object fields straight to a cache key computed from their arguments, so that
/// `hero(id: "1000")` finds the record `1000` even if it was written by another query.
///
/// Configured per field name with the arguments making the key, in order. A list argument
/// resolves to a list of references. Falls back to `fallback` when the arguments are absent.
pub struct FieldPolicyCacheResolver<R = DefaultCacheResolver> {
    key_arguments: HashMap<String, Vec<String>>,
    fallback: R,
}

impl FieldPolicyCacheResolver<DefaultCacheResolver> {
    pub fn new() -> Self {
        FieldPolicyCacheResolver {
            key_arguments: HashMap::new(),
            fallback: DefaultCacheResolver,
        }
    }
}

impl Default for FieldPolicyCacheResolver<DefaultCacheResolver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> FieldPolicyCacheResolver<R> {
    pub fn with_fallback<T: CacheResolver>(self, fallback: T) -> FieldPolicyCacheResolver<T> {
        FieldPolicyCacheResolver {
            key_arguments: self.key_arguments,
            fallback,
        }
    }

    #[must_use]
    pub fn key_arguments<I, S>(mut self, field_name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_arguments
            .insert(field_name.into(), arguments.into_iter().map(Into::into).collect());
        self
    }

    fn key_from_arguments(&self, context: &ResolverContext<'_>) -> Option<RecordValue> {
        if !context.field.is_composite() {
            return None;
        }
        let names = self.key_arguments.get(&context.field.name)?;

        let values = names
            .iter()
            .map(|name| {
                let argument = context.field.arguments.iter().find(|argument| &argument.name == name)?;
                Some(resolve_argument(&argument.value, context.variables))
            })
            .collect::<Option<Vec<_>>>()?;

        match values.as_slice() {
            [Value::Array(ids)] => ids
                .iter()
                .map(|id| key_part(id).map(|id| RecordValue::Reference(CacheKey::new(id))))
                .collect::<Option<Vec<_>>>()
                .map(RecordValue::List),
            values => {
                let parts = values.iter().map(key_part).collect::<Option<Vec<_>>>()?;
                Some(RecordValue::Reference(CacheKey::new(parts.join("+"))))
            }
        }
    }
}

fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

impl<R: CacheResolver> CacheResolver for FieldPolicyCacheResolver<R> {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<RecordValue, CacheMissError> {
        match self.key_from_arguments(context) {
            Some(value) => Ok(value),
            None => self.fallback.resolve_field(context),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::selection::ArgumentValue;

    fn resolve(resolver: &dyn CacheResolver, field: &Field, parent: &Record, now: i64) -> Result<RecordValue, CacheMissError> {
        let variables = json!({"ids": ["1000", "1002"]}).as_object().cloned().unwrap_or_default();
        let field_key = field.field_key(&variables);
        resolver.resolve_field(&ResolverContext {
            field,
            field_key: &field_key,
            parent,
            variables: &variables,
            now,
        })
    }

    #[test]
    fn stale_fields() {
        let mut parent = Record::new("1000").with_field("name", RecordValue::String("Luke".into()));
        parent.dates.insert("name".into(), 1_000);
        let resolver = ReceiveDateCacheResolver::new(60);
        let field = Field::new("name");

        assert!(resolve(&resolver, &field, &parent, 1_060).is_ok());
        assert_eq!(
            resolve(&resolver, &field, &parent, 1_061),
            Err(CacheMissError::stale_field(CacheKey::new("1000"), "name"))
        );
        assert_eq!(
            resolve(&resolver, &Field::new("mass"), &parent, 1_000),
            Err(CacheMissError::missing_field(CacheKey::new("1000"), "mass"))
        );
    }

    #[test]
    fn field_policy() {
        let resolver = FieldPolicyCacheResolver::new()
            .key_arguments("hero", ["id"])
            .key_arguments("characters", ["ids"]);
        let root = Record::new(CacheKey::root_query());

        let hero = Field::new("hero")
            .argument("id", ArgumentValue::literal("1000"))
            .selections([Field::new("name").into()]);
        assert_eq!(resolve(&resolver, &hero, &root, 0), Ok(RecordValue::reference("1000")));

        let characters = Field::new("characters")
            .argument("ids", ArgumentValue::variable("ids"))
            .selections([Field::new("name").into()]);
        assert_eq!(
            resolve(&resolver, &characters, &root, 0),
            Ok(RecordValue::List(vec![
                RecordValue::reference("1000"),
                RecordValue::reference("1002")
            ]))
        );

        let villain = Field::new("villain").selections([Field::new("name").into()]);
        assert_eq!(
            resolve(&resolver, &villain, &root, 0),
            Err(CacheMissError::missing_field(CacheKey::root_query(), "villain"))
        );
    }
}
