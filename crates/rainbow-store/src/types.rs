use serde_json::{Map, Value};

/// A schemaless record: a flat-or-nested JSON object.
///
/// Records returned by the store always carry their primary key under `"id"`.
pub type Record = Map<String, Value>;

/// Returns true when every key in `filter` is present in `record` with an equal value.
pub fn matches(record: &Record, filter: &Record) -> bool {
    filter
        .iter()
        .all(|(key, expected)| record.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(matches(&obj(json!({"a": 1})), &Record::new()));
    }

    #[test]
    fn filter_requires_equal_values() {
        let record = obj(json!({"session_id": "s1", "turns": 2}));
        assert!(matches(&record, &obj(json!({"session_id": "s1"}))));
        assert!(!matches(&record, &obj(json!({"session_id": "s2"}))));
        assert!(!matches(&record, &obj(json!({"missing": null}))));
    }
}
