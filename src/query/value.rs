//! Ordering and hashing of JSON values as the merge stages see them.
//!
//! Values order first by type (`null < bool < number < string < array <
//! object`) and then by content. Numbers compare by their `f64` value, so `1`
//! and `1.0` are the same key both for sorting and for DISTINCT hashing.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};
use xxhash_rust::xxh64::Xxh64;

use crate::query::plan::SortOrder;

const HASH_SEED: u64 = 0x5eed_d15c_0de0_0001;

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn number_f64(number: &Number) -> f64 {
    number.as_f64().unwrap_or(0.0)
}

fn normalize_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Total order over JSON values.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            normalize_zero(number_f64(a)).total_cmp(&normalize_zero(number_f64(b)))
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => compare_slices(a, b),
        (Value::Object(a), Value::Object(b)) => compare_objects(a, b),
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

fn compare_slices(left: &[Value], right: &[Value]) -> Ordering {
    for (a, b) in left.iter().zip(right) {
        let ord = compare_values(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

// serde_json maps iterate in key order unless `preserve_order` is enabled.
fn compare_objects(left: &Map<String, Value>, right: &Map<String, Value>) -> Ordering {
    let mut lhs: Vec<_> = left.iter().collect();
    let mut rhs: Vec<_> = right.iter().collect();
    lhs.sort_by(|a, b| a.0.cmp(b.0));
    rhs.sort_by(|a, b| a.0.cmp(b.0));
    for ((ka, va), (kb, vb)) in lhs.iter().zip(rhs.iter()) {
        let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    lhs.len().cmp(&rhs.len())
}

/// Compares two ORDER BY projections key by key, honoring each key's direction.
pub fn compare_order_by(left: &[Value], right: &[Value], orders: &[SortOrder]) -> Ordering {
    for (idx, (a, b)) in left.iter().zip(right).enumerate() {
        let ord = compare_values(a, b);
        let ord = match orders.get(idx).copied().unwrap_or_default() {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Tuple of values usable as an ordered map key (GROUP BY keys).
#[derive(Clone, Debug, Default)]
pub struct SortKey(pub Vec<Value>);

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_slices(&self.0, &other.0)
    }
}

/// Stable 64-bit hash of a value; equal under [`compare_values`] implies equal hash.
pub fn hash_value(value: &Value) -> u64 {
    let mut hasher = Xxh64::new(HASH_SEED);
    feed(&mut hasher, value);
    hasher.digest()
}

fn feed(hasher: &mut Xxh64, value: &Value) {
    hasher.update(&[type_rank(value)]);
    match value {
        Value::Null => {}
        Value::Bool(b) => hasher.update(&[u8::from(*b)]),
        Value::Number(n) => hasher.update(&normalize_zero(number_f64(n)).to_bits().to_le_bytes()),
        Value::String(s) => {
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                feed(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            hasher.update(&(entries.len() as u64).to_le_bytes());
            for (key, item) in entries {
                hasher.update(&(key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                feed(hasher, item);
            }
        }
    }
}

/// Converts an `f64` back into a JSON number, preferring an integer form.
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_order_precedes_content() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-5),
            json!(2.5),
            json!("a"),
            json!("b"),
            json!([1]),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn integers_and_floats_share_keys() {
        assert_eq!(compare_values(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(hash_value(&json!(1)), hash_value(&json!(1.0)));
        assert_eq!(hash_value(&json!(0.0)), hash_value(&json!(-0.0)));
        assert_ne!(hash_value(&json!(1)), hash_value(&json!("1")));
    }

    #[test]
    fn object_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":[true,null]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":[true,null],"x":1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
        assert_eq!(compare_values(&a, &b), Ordering::Equal);
    }

    #[test]
    fn descending_keys_reverse_only_their_column() {
        let orders = [SortOrder::Ascending, SortOrder::Descending];
        let a = [json!(1), json!(9)];
        let b = [json!(1), json!(3)];
        assert_eq!(compare_order_by(&a, &b, &orders), Ordering::Less);
        let c = [json!(0), json!(0)];
        assert_eq!(compare_order_by(&c, &a, &orders), Ordering::Less);
    }

    #[test]
    fn number_value_prefers_integers() {
        assert_eq!(number_value(4.0), json!(4));
        assert_eq!(number_value(2.5), json!(2.5));
        assert_eq!(number_value(f64::NAN), Value::Null);
    }
}
