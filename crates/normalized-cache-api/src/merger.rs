use std::collections::HashSet;

use crate::{Record, RecordValue};

/// Conflict resolution between a stored record and an incoming one.
///
/// Returns the delta to persist, holding only the fields (and dates) that need to be written, and
/// the `key.fieldKey` of every field whose value changed. The delta is not a full copy of the
/// merged record.
pub trait RecordMerger: Send + Sync {
    fn merge(&self, existing: &Record, incoming: &Record, new_date: Option<i64>) -> (Record, HashSet<String>);
}

/// Incoming values replace existing ones. A field changes only when its value differs.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRecordMerger;

impl RecordMerger for DefaultRecordMerger {
    fn merge(&self, existing: &Record, incoming: &Record, new_date: Option<i64>) -> (Record, HashSet<String>) {
        merge_with(existing, incoming, new_date, |_, _, incoming| incoming.clone())
    }
}

/// Merges fields present on both sides with a custom function, e.g. to append pages of a list.
/// Fields only present in the incoming record are taken as is.
pub struct FieldRecordMerger<F> {
    merge_field: F,
}

impl<F> FieldRecordMerger<F>
where
    F: Fn(&str, &RecordValue, &RecordValue) -> RecordValue + Send + Sync,
{
    /// `merge_field` receives the field key, the existing value and the incoming one.
    pub fn new(merge_field: F) -> Self {
        FieldRecordMerger { merge_field }
    }
}

impl<F> RecordMerger for FieldRecordMerger<F>
where
    F: Fn(&str, &RecordValue, &RecordValue) -> RecordValue + Send + Sync,
{
    fn merge(&self, existing: &Record, incoming: &Record, new_date: Option<i64>) -> (Record, HashSet<String>) {
        merge_with(existing, incoming, new_date, &self.merge_field)
    }
}

fn merge_with(
    existing: &Record,
    incoming: &Record,
    new_date: Option<i64>,
    merge_field: impl Fn(&str, &RecordValue, &RecordValue) -> RecordValue,
) -> (Record, HashSet<String>) {
    let mut delta = Record::new(existing.key.clone());
    delta.mutation_id = incoming.mutation_id;
    let mut changed = HashSet::new();

    for (field, incoming_value) in &incoming.fields {
        let merged = match existing.fields.get(field) {
            Some(existing_value) => {
                let merged = merge_field(field, existing_value, incoming_value);
                if &merged == existing_value {
                    None
                } else {
                    Some(merged)
                }
            }
            None => Some(incoming_value.clone()),
        };

        if let Some(merged) = merged {
            changed.insert(existing.key.field(field));
            delta.fields.insert(field.clone(), merged);
        }

        let date = new_date.or_else(|| incoming.dates.get(field).copied());
        if let Some(date) = date {
            if existing.dates.get(field) != Some(&date) {
                delta.dates.insert(field.clone(), date);
            }
        }
    }

    (delta, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn luke() -> Record {
        Record::new("1000")
            .with_field("name", RecordValue::String("Luke".into()))
            .with_field("height", RecordValue::Number(172.into()))
    }

    #[test]
    fn only_changed_fields_end_up_in_the_delta() {
        let incoming = Record::new("1000")
            .with_field("name", RecordValue::String("Luke".into()))
            .with_field("height", RecordValue::Number(173.into()))
            .with_field("mass", RecordValue::Number(77.into()));

        let (delta, changed) = DefaultRecordMerger.merge(&luke(), &incoming, None);

        assert_eq!(delta.fields.keys().collect::<Vec<_>>(), ["height", "mass"]);
        assert_eq!(changed, HashSet::from(["1000.height".to_string(), "1000.mass".to_string()]));
    }

    #[test]
    fn merging_twice_changes_nothing() {
        let mut stored = Record::new("1000");
        let (delta, changed) = DefaultRecordMerger.merge(&stored, &luke(), None);
        assert_eq!(changed.len(), 2);
        stored.apply(delta);

        let (delta, changed) = DefaultRecordMerger.merge(&stored, &luke(), None);
        assert!(changed.is_empty());
        assert!(delta.is_empty());
    }

    #[test]
    fn dates_are_refreshed_without_reporting_a_change() {
        let mut stored = luke();
        stored.dates.insert("name".into(), 100);

        let (delta, changed) = DefaultRecordMerger.merge(&stored, &luke(), Some(200));

        assert!(changed.is_empty());
        assert!(delta.fields.is_empty());
        assert_eq!(delta.dates.get("name"), Some(&200));
        assert_eq!(delta.dates.get("height"), Some(&200));
    }

    #[test]
    fn field_merger_appends_pages() {
        let merger = FieldRecordMerger::new(|field: &str, existing: &RecordValue, incoming: &RecordValue| {
            match (field, existing, incoming) {
                ("friends", RecordValue::List(existing), RecordValue::List(incoming)) => {
                    RecordValue::List(existing.iter().chain(incoming).cloned().collect())
                }
                _ => incoming.clone(),
            }
        });

        let existing = Record::new("1000").with_field("friends", RecordValue::List(vec![RecordValue::reference("1002")]));
        let incoming = Record::new("1000").with_field("friends", RecordValue::List(vec![RecordValue::reference("1003")]));

        let (delta, changed) = merger.merge(&existing, &incoming, None);

        assert_eq!(
            delta.get("friends"),
            Some(&RecordValue::List(vec![
                RecordValue::reference("1002"),
                RecordValue::reference("1003")
            ]))
        );
        assert_eq!(changed, HashSet::from(["1000.friends".to_string()]));
    }
}
