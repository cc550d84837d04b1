//! Normalized result rows.
//!
//! The four warehouses disagree on column-name casing (Snowflake shouts,
//! Postgres whispers) and on scalar representation (BigQuery's REST API
//! returns every cell as a string). Executors normalize both at the fetch
//! boundary: keys are lower-cased once here, and the typed accessors accept
//! numeric strings as well as native numbers, so adapter mapping code never
//! has to care which warehouse produced the row.

use serde_json::Value;
use std::collections::HashMap;

/// One result row with lower-cased column names.
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: HashMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a row from `(name, value)` pairs, lower-casing names. On a
    /// duplicate name the later value wins.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_lowercase(), v))
            .collect();
        Self { values }
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_lowercase(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(&name.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Integer accessor; tolerates floats and numeric strings.
    pub fn i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
            _ => None,
        }
    }

    /// Float accessor; tolerates integers and numeric strings.
    pub fn f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Trimmed string accessor; stringifies numbers, maps NULL to `None`.
    pub fn string(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null => None,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_is_case_insensitive() {
        let row = Row::from_pairs([("TOTAL_QUERIES", json!(42)), ("User_Email", json!("a@b.co"))]);
        assert_eq!(row.i64("total_queries"), Some(42));
        assert_eq!(row.string("user_email").as_deref(), Some("a@b.co"));
    }

    #[test]
    fn numeric_strings_coerce() {
        let row = Row::from_pairs([
            ("query_count", json!("128")),
            ("total_cost_gb", json!("3.75")),
            ("epoch", json!("1.7240768E9")),
        ]);
        assert_eq!(row.i64("query_count"), Some(128));
        assert_eq!(row.f64("total_cost_gb"), Some(3.75));
        assert_eq!(row.i64("epoch"), Some(1_724_076_800));
    }

    #[test]
    fn null_and_missing_read_as_none() {
        let row = Row::from_pairs([("maybe", Value::Null)]);
        assert_eq!(row.i64("maybe"), None);
        assert_eq!(row.string("maybe"), None);
        assert_eq!(row.f64("absent"), None);
    }

    #[test]
    fn strings_are_trimmed() {
        let row = Row::from_pairs([("user_email", json!("  analyst@corp.io \n"))]);
        assert_eq!(row.string("user_email").as_deref(), Some("analyst@corp.io"));
    }
}
