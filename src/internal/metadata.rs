//! String-keyed metadata maps shared by incrementals, sidecars, and dataset
//! descriptions.
//!
//! One map carries two logical subsets: BIDS entity values (keys equal to
//! recognized entity long names) and CamelCase scanner sidecar fields. Keys
//! are held sorted so sidecar JSON serializes with deterministic key order.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::internal::entity;

/// Mapping from string keys to JSON-serializable scalars or arrays.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap {
    fields: BTreeMap<String, Value>,
}

impl MetadataMap {
    pub fn new() -> MetadataMap {
        MetadataMap {
            fields: BTreeMap::new(),
        }
    }

    pub fn from_fields(fields: BTreeMap<String, Value>) -> MetadataMap {
        MetadataMap { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Insert every entry of `other` whose key this map does not already
    /// hold. Existing values win, which is how parsed protocol-name tokens
    /// merge under caller-provided metadata.
    pub fn merge_under(&mut self, other: &MetadataMap) {
        for (key, value) in other.iter() {
            self.fields
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Insert every entry of `other`, overwriting on collision.
    pub fn merge_over(&mut self, other: &MetadataMap) {
        for (key, value) in other.iter() {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// String form of a scalar value; numbers are rendered in their JSON
    /// form, which is how entity values appear in file names.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Numeric view of a value that scanner exports may deliver as a JSON
    /// number or as a numeric string.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// The subset of keys recognized as BIDS entities.
    pub fn filter_entities(&self) -> MetadataMap {
        MetadataMap {
            fields: self
                .fields
                .iter()
                .filter(|(key, _)| entity::is_entity(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }

    /// Pretty JSON with 4-space indentation and sorted keys, the sidecar
    /// wire format.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        // BTreeMap ordering and UTF-8 JSON output make this infallible
        Ok(String::from_utf8(out).expect("serde_json emits UTF-8"))
    }

    /// Per-key symmetric difference against `other`: every key whose values
    /// disagree, including keys present on one side only.
    pub fn symmetric_difference(&self, other: &MetadataMap) -> MetadataDifference {
        let mut entries = BTreeMap::new();
        for (key, value) in self.iter() {
            match other.get(key) {
                Some(theirs) if theirs == value => {}
                theirs => {
                    entries.insert(key.clone(), (Some(value.clone()), theirs.cloned()));
                }
            }
        }
        for (key, value) in other.iter() {
            if !self.contains_key(key) {
                entries.insert(key.clone(), (None, Some(value.clone())));
            }
        }
        MetadataDifference { entries }
    }
}

impl FromIterator<(String, Value)> for MetadataMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        MetadataMap {
            fields: iter.into_iter().collect(),
        }
    }
}

/// The offending keys and both values from a failed metadata comparison,
/// attached to `BidsError::MetadataMismatch` for debugging.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataDifference {
    entries: BTreeMap<String, (Option<Value>, Option<Value>)>,
}

impl MetadataDifference {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

impl Display for MetadataDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "{{")?;
        for (key, (left, right)) in &self.entries {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            let render = |v: &Option<Value>| match v {
                Some(value) => value.to_string(),
                None => "<absent>".to_string(),
            };
            write!(f, "{key}: {} != {}", render(left), render(right))?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(pairs: &[(&str, Value)]) -> MetadataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_merge_under_keeps_existing() {
        let mut base = map(&[("task", json!("faces"))]);
        let parsed = map(&[("task", json!("other")), ("run", json!("01"))]);
        base.merge_under(&parsed);

        assert_eq!(base.get_str("task").unwrap(), "faces");
        assert_eq!(base.get_str("run").unwrap(), "01");
    }

    #[test]
    fn test_numeric_access_accepts_strings() {
        let m = map(&[
            ("RepetitionTime", json!("1500")),
            ("EchoTime", json!(0.03)),
        ]);
        assert_eq!(m.get_f64("RepetitionTime").unwrap(), 1500.0);
        assert_eq!(m.get_f64("EchoTime").unwrap(), 0.03);
        assert_eq!(m.get_i64("RepetitionTime").unwrap(), 1500);
    }

    #[test]
    fn test_filter_entities() {
        let m = map(&[
            ("subject", json!("01")),
            ("task", json!("rest")),
            ("RepetitionTime", json!(1.5)),
            ("Manufacturer", json!("Siemens")),
        ]);
        let entities = m.filter_entities();
        assert_eq!(entities.len(), 2);
        assert!(entities.contains_key("subject"));
        assert!(entities.contains_key("task"));
        assert!(!entities.contains_key("RepetitionTime"));
    }

    #[test]
    fn test_json_output_sorted_and_indented() {
        let m = map(&[("b", json!(2)), ("a", json!(1))]);
        let json = m.to_json_pretty().unwrap();
        let a_pos = json.find("\"a\"").unwrap();
        let b_pos = json.find("\"b\"").unwrap();
        assert!(a_pos < b_pos);
        assert!(json.contains("    \"a\": 1"));
    }

    #[test]
    fn test_symmetric_difference() {
        let left = map(&[("subject", json!("01")), ("run", json!(1))]);
        let right = map(&[("subject", json!("02")), ("task", json!("rest"))]);

        let diff = left.symmetric_difference(&right);
        assert_eq!(diff.len(), 3);
        let keys: Vec<&String> = diff.keys().collect();
        assert_eq!(keys, ["run", "subject", "task"]);

        let rendered = diff.to_string();
        assert!(rendered.contains("subject: \"01\" != \"02\""));
        assert!(rendered.contains("run: 1 != <absent>"));
    }

    #[test]
    fn test_symmetric_difference_empty_for_equal_maps() {
        let m = map(&[("subject", json!("01"))]);
        assert!(m.symmetric_difference(&m.clone()).is_empty());
    }
}
