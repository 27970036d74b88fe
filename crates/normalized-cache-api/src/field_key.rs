use serde_json::{Map, Value};

use crate::{
    selection::{Argument, ArgumentValue},
    Variables,
};

/// Builds the storage key of a field inside its record.
///
/// The key is the field name, followed by the resolved arguments as canonical JSON when there are
/// any: `hero({"episode":"JEDI"})`. Object keys are sorted at every level, lists keep their
/// order and `null` is encoded rather than omitted. Aliases never take part in the key, so the
/// same field selected under two aliases shares one cache entry.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    pub fn build(field_name: &str, arguments: &[Argument], variables: &Variables) -> String {
        if arguments.is_empty() {
            return field_name.to_string();
        }

        let mut sorted = arguments.iter().collect::<Vec<_>>();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut resolved = Map::new();
        for argument in sorted {
            resolved.insert(argument.name.clone(), resolve_argument(&argument.value, variables));
        }

        // Serializing a map of JSON values cannot fail.
        let arguments = serde_json::to_string(&Value::Object(resolved)).unwrap_or_default();
        format!("{field_name}({arguments})")
    }
}

/// Substitutes variables, recursively, and canonicalizes the result.
///
/// A variable missing from `variables` resolves to `null`.
pub fn resolve_argument(value: &ArgumentValue, variables: &Variables) -> Value {
    match value {
        ArgumentValue::Literal(value) => canonicalize(value),
        ArgumentValue::Variable(name) => variables.get(name).map(canonicalize).unwrap_or(Value::Null),
        ArgumentValue::List(values) => Value::Array(values.iter().map(|value| resolve_argument(value, variables)).collect()),
        ArgumentValue::Object(fields) => {
            let mut sorted = fields.iter().collect::<Vec<_>>();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(name, value)| (name.clone(), resolve_argument(value, variables)))
                    .collect(),
            )
        }
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut sorted = fields.iter().collect::<Vec<_>>();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(name, value)| (name.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
