//! Lenient extraction helpers over raw query results.
//!
//! The remote store's row shape varies by query form; every helper here
//! skips anything it does not recognize, so a malformed response is
//! indistinguishable from an empty one downstream.

use crate::types::AttributeType;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Collect string values for any of `keys` across all rows, deduplicated
/// in first-seen order. Rows may be plain strings, objects with a string
/// field, or objects with an array-of-strings field.
pub fn string_values(results: &[Value], keys: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |s: &str, out: &mut Vec<String>| {
        if !s.is_empty() && !out.iter().any(|seen| seen == s) {
            out.push(s.to_string());
        }
    };
    for row in results {
        match row {
            Value::String(s) => push(s, &mut out),
            Value::Object(map) => {
                for key in keys {
                    match map.get(*key) {
                        Some(Value::String(s)) => push(s, &mut out),
                        Some(Value::Array(items)) => {
                            for item in items {
                                if let Value::String(s) = item {
                                    push(s, &mut out);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// First numeric value found under any of `keys` in any row.
pub fn first_u64(results: &[Value], keys: &[&str]) -> Option<u64> {
    for row in results {
        if let Value::Object(map) = row {
            for key in keys {
                match map.get(*key) {
                    Some(Value::Number(n)) => {
                        if let Some(v) = n.as_u64() {
                            return Some(v);
                        }
                        if let Some(v) = n.as_f64() {
                            if v >= 0.0 {
                                return Some(v as u64);
                            }
                        }
                    }
                    Some(Value::String(s)) => {
                        if let Ok(v) = s.parse::<u64>() {
                            return Some(v);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    None
}

/// First timestamp found under any of `keys`: epoch milliseconds or an
/// RFC 3339 string.
pub fn first_timestamp(results: &[Value], keys: &[&str]) -> Option<DateTime<Utc>> {
    for row in results {
        if let Value::Object(map) = row {
            for key in keys {
                match map.get(*key) {
                    Some(Value::Number(n)) => {
                        if let Some(millis) = n.as_i64() {
                            if let Some(ts) = Utc.timestamp_millis_opt(millis).single() {
                                return Some(ts);
                            }
                        }
                    }
                    Some(Value::String(s)) => {
                        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                            return Some(ts.with_timezone(&Utc));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    None
}

/// Rows that are JSON objects; everything else is ignored.
pub fn object_rows(results: &[Value]) -> Vec<&serde_json::Map<String, Value>> {
    results
        .iter()
        .filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// Classify a sampled value by shape alone.
pub fn infer_type(value: &Value) -> AttributeType {
    match value {
        Value::Number(_) => AttributeType::Numeric,
        Value::Bool(_) => AttributeType::Boolean,
        Value::String(s) => {
            if DateTime::parse_from_rfc3339(s).is_ok() {
                AttributeType::Timestamp
            } else {
                AttributeType::String
            }
        }
        _ => AttributeType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_values_mixed_shapes() {
        let rows = vec![
            json!("PageView"),
            json!({"eventType": "ApiCall"}),
            json!({"uniques.metricName": ["cpu.user", "cpu.system"]}),
            json!({"eventType": "PageView"}),
            json!(42),
        ];
        let got = string_values(&rows, &["eventType", "uniques.metricName"]);
        assert_eq!(got, vec!["PageView", "ApiCall", "cpu.user", "cpu.system"]);
    }

    #[test]
    fn test_first_u64_accepts_float_and_string() {
        let rows = vec![json!({"count": 12.0})];
        assert_eq!(first_u64(&rows, &["count"]), Some(12));
        let rows = vec![json!({"count": "77"})];
        assert_eq!(first_u64(&rows, &["count"]), Some(77));
        let rows = vec![json!({"other": 1})];
        assert_eq!(first_u64(&rows, &["count"]), None);
    }

    #[test]
    fn test_first_timestamp_epoch_and_rfc3339() {
        let rows = vec![json!({"earliest.timestamp": 1700000000000i64})];
        assert!(first_timestamp(&rows, &["earliest.timestamp"]).is_some());
        let rows = vec![json!({"earliest.timestamp": "2024-01-15T10:00:00Z"})];
        assert!(first_timestamp(&rows, &["earliest.timestamp"]).is_some());
    }

    #[test]
    fn test_infer_type() {
        assert_eq!(infer_type(&json!(1.5)), AttributeType::Numeric);
        assert_eq!(infer_type(&json!(true)), AttributeType::Boolean);
        assert_eq!(
            infer_type(&json!("2024-01-15T10:00:00Z")),
            AttributeType::Timestamp
        );
        assert_eq!(infer_type(&json!("hello")), AttributeType::String);
        assert_eq!(infer_type(&json!(null)), AttributeType::Unknown);
    }
}
