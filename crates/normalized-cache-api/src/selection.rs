//! The selection shape emitted by the GraphQL compiler for each operation and fragment.
//!
//! This is the only knowledge the cache has about documents: which fields were selected, under
//! which response name, with which arguments and type conditions. Named fragment spreads are
//! expected to be inlined as [`FragmentSelection`]s by the compiler.

use serde_json::Value;

use crate::{field_key::CacheKeyBuilder, CacheKey, Variables};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn root_key(self) -> CacheKey {
        match self {
            OperationKind::Query => CacheKey::root_query(),
            OperationKind::Mutation => CacheKey::root_mutation(),
            OperationKind::Subscription => CacheKey::root_subscription(),
        }
    }

    pub fn root_type(self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub name: String,
    pub kind: OperationKind,
    pub selections: Vec<Selection>,
}

impl Operation {
    pub fn query(name: impl Into<String>, selections: impl IntoIterator<Item = Selection>) -> Self {
        Operation {
            name: name.into(),
            kind: OperationKind::Query,
            selections: selections.into_iter().collect(),
        }
    }

    pub fn mutation(name: impl Into<String>, selections: impl IntoIterator<Item = Selection>) -> Self {
        Operation {
            name: name.into(),
            kind: OperationKind::Mutation,
            selections: selections.into_iter().collect(),
        }
    }

    pub fn subscription(name: impl Into<String>, selections: impl IntoIterator<Item = Selection>) -> Self {
        Operation {
            name: name.into(),
            kind: OperationKind::Subscription,
            selections: selections.into_iter().collect(),
        }
    }

    pub fn root_key(&self) -> CacheKey {
        self.kind.root_key()
    }
}

/// A fragment definition, written to or read from an arbitrary record.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub name: String,
    pub type_condition: String,
    pub selections: Vec<Selection>,
}

impl Fragment {
    pub fn new(
        name: impl Into<String>,
        type_condition: impl Into<String>,
        selections: impl IntoIterator<Item = Selection>,
    ) -> Self {
        Fragment {
            name: name.into(),
            type_condition: type_condition.into(),
            selections: selections.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(Field),
    Fragment(FragmentSelection),
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Selection::Field(field)
    }
}

impl From<FragmentSelection> for Selection {
    fn from(fragment: FragmentSelection) -> Self {
        Selection::Fragment(fragment)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    /// Named type of the field, used to match type conditions when the data carries no `__typename`.
    pub type_name: Option<String>,
    pub arguments: Vec<Argument>,
    pub conditions: Vec<Condition>,
    pub selections: Vec<Selection>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Field {
            name: name.into(),
            alias: None,
            type_name: None,
            arguments: Vec::new(),
            conditions: Vec::new(),
            selections: Vec::new(),
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn of_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    #[must_use]
    pub fn argument(mut self, name: impl Into<String>, value: ArgumentValue) -> Self {
        self.arguments.push(Argument {
            name: name.into(),
            value,
        });
        self
    }

    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn selections(mut self, selections: impl IntoIterator<Item = Selection>) -> Self {
        self.selections.extend(selections);
        self
    }

    /// The key of this field in the response: the alias if any, else the name.
    pub fn response_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// The key of this field inside a record.
    pub fn field_key(&self, variables: &Variables) -> String {
        CacheKeyBuilder::build(&self.name, &self.arguments, variables)
    }

    pub fn is_composite(&self) -> bool {
        !self.selections.is_empty()
    }
}

/// An inline fragment, or a named fragment spread inlined by the compiler.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct FragmentSelection {
    /// `None` for fragments without a type condition, which always apply.
    pub type_condition: Option<String>,
    /// Concrete types satisfying the condition when it names an interface or a union.
    pub possible_types: Vec<String>,
    pub conditions: Vec<Condition>,
    pub selections: Vec<Selection>,
}

impl FragmentSelection {
    pub fn on(type_condition: impl Into<String>) -> Self {
        FragmentSelection {
            type_condition: Some(type_condition.into()),
            ..Default::default()
        }
    }

    pub fn unconditional() -> Self {
        FragmentSelection::default()
    }

    #[must_use]
    pub fn possible_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.possible_types.extend(types.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn selections(mut self, selections: impl IntoIterator<Item = Selection>) -> Self {
        self.selections.extend(selections);
        self
    }

    pub fn applies_to(&self, typename: Option<&str>) -> bool {
        match (&self.type_condition, typename) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(condition), Some(typename)) => {
                condition == typename || self.possible_types.iter().any(|possible| possible == typename)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ArgumentValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArgumentValue {
    Literal(Value),
    Variable(String),
    List(Vec<ArgumentValue>),
    Object(Vec<(String, ArgumentValue)>),
}

impl ArgumentValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        ArgumentValue::Literal(value.into())
    }

    pub fn variable(name: impl Into<String>) -> Self {
        ArgumentValue::Variable(name.into())
    }
}

/// `@include(if: $variable)`, or `@skip(if: $variable)` when inverted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub variable: String,
    pub inverted: bool,
}

impl Condition {
    pub fn include_if(variable: impl Into<String>) -> Self {
        Condition {
            variable: variable.into(),
            inverted: false,
        }
    }

    pub fn skip_if(variable: impl Into<String>) -> Self {
        Condition {
            variable: variable.into(),
            inverted: true,
        }
    }

    /// A variable that is missing or not a boolean counts as `false`.
    pub fn evaluate(&self, variables: &Variables) -> bool {
        let value = variables.get(&self.variable).and_then(Value::as_bool).unwrap_or(false);
        value != self.inverted
    }
}

fn conditions_hold(conditions: &[Condition], variables: &Variables) -> bool {
    conditions.iter().all(|condition| condition.evaluate(variables))
}

/// Fields sharing a response name, merged across fragments.
pub struct CollectedField<'a> {
    pub field: &'a Field,
    pub selections: Vec<&'a Selection>,
}

/// Flattens fields and the fragments applying to `typename` into the list of fields to process,
/// in selection order. Excluded conditional selections are dropped.
pub fn collect_fields<'a>(
    selections: &[&'a Selection],
    typename: Option<&str>,
    variables: &Variables,
) -> Vec<CollectedField<'a>> {
    let mut collected: Vec<CollectedField<'a>> = Vec::new();
    for selection in selections {
        collect_into(&mut collected, selection, typename, variables);
    }
    collected
}

fn collect_into<'a>(
    collected: &mut Vec<CollectedField<'a>>,
    selection: &'a Selection,
    typename: Option<&str>,
    variables: &Variables,
) {
    match selection {
        Selection::Field(field) => {
            if !conditions_hold(&field.conditions, variables) {
                return;
            }
            match collected
                .iter_mut()
                .find(|existing| existing.field.response_name() == field.response_name())
            {
                Some(existing) => existing.selections.extend(field.selections.iter()),
                None => collected.push(CollectedField {
                    field,
                    selections: field.selections.iter().collect(),
                }),
            }
        }
        Selection::Fragment(fragment) => {
            if !conditions_hold(&fragment.conditions, variables) || !fragment.applies_to(typename) {
                return;
            }
            for selection in &fragment.selections {
                collect_into(collected, selection, typename, variables);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn variables(value: Value) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn type_conditions_select_fragments() {
        let selections: Vec<Selection> = vec![
            Field::new("__typename").into(),
            Field::new("name").into(),
            FragmentSelection::on("Droid")
                .selections([Field::new("primaryFunction").into()])
                .into(),
            FragmentSelection::on("Character")
                .possible_types(["Human", "Droid"])
                .selections([Field::new("id").into(), Field::new("name").into()])
                .into(),
        ];
        let selections = selections.iter().collect::<Vec<_>>();

        let names = |typename| {
            collect_fields(&selections, typename, &Variables::new())
                .iter()
                .map(|collected| collected.field.name.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(names(Some("Droid")), ["__typename", "name", "primaryFunction", "id"]);
        assert_eq!(names(Some("Human")), ["__typename", "name", "id"]);
        assert_eq!(names(None), ["__typename", "name"]);
    }

    #[test]
    fn same_response_name_merges_sub_selections() {
        let selections: Vec<Selection> = vec![
            Field::new("hero").selections([Field::new("name").into()]).into(),
            FragmentSelection::unconditional()
                .selections([Field::new("hero").selections([Field::new("id").into()]).into()])
                .into(),
        ];
        let selections = selections.iter().collect::<Vec<_>>();

        let collected = collect_fields(&selections, Some("Query"), &Variables::new());
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].selections.len(), 2);
    }

    #[test]
    fn include_and_skip() {
        let selections: Vec<Selection> = vec![
            Field::new("name").condition(Condition::include_if("withName")).into(),
            Field::new("id").condition(Condition::skip_if("withoutId")).into(),
        ];
        let selections = selections.iter().collect::<Vec<_>>();
        let count = |vars: Value| collect_fields(&selections, None, &variables(vars)).len();

        assert_eq!(count(json!({"withName": true, "withoutId": false})), 2);
        assert_eq!(count(json!({"withName": false, "withoutId": true})), 0);
        // missing variables count as false
        assert_eq!(count(json!({})), 1);
    }
}
