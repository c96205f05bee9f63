//! Value comparators for B-tree indexes.
//!
//! A comparator is a strict "a < b" over raw item values, carried as data
//! inside the index's tree. The helpers here cover the common cases;
//! embedders can supply any `Fn(&[u8], &[u8]) -> bool`.

use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// A strict less-than over item values.
pub type LessFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Compares values as raw bytes.
pub fn binary() -> LessFn {
    Arc::new(|a, b| a < b)
}

/// Compares values as ASCII case-insensitive strings.
///
/// `"Hello"` and `"hello"` compare equal; the index's key fallback then
/// decides their relative position.
pub fn string() -> LessFn {
    Arc::new(|a, b| caseless_cmp(a, b) == Ordering::Less)
}

/// Compares values as signed decimal integers. Unparseable values
/// compare as zero.
pub fn int() -> LessFn {
    Arc::new(|a, b| parse_or_default::<i64>(a) < parse_or_default::<i64>(b))
}

/// Compares values as unsigned decimal integers.
pub fn uint() -> LessFn {
    Arc::new(|a, b| parse_or_default::<u64>(a) < parse_or_default::<u64>(b))
}

/// Compares values as floating point numbers.
pub fn float() -> LessFn {
    Arc::new(|a, b| parse_or_default::<f64>(a) < parse_or_default::<f64>(b))
}

/// Compares values by a dotted-path field of their JSON representation.
///
/// String fields compare case-insensitively; use
/// [`json_case_sensitive`] otherwise. Values that fail to parse, or
/// paths that do not resolve, order before everything else.
pub fn json(path: &str) -> LessFn {
    let segments = split_path(path);
    Arc::new(move |a, b| json_less(a, b, &segments, false))
}

/// Like [`json`] with case-sensitive string comparison.
pub fn json_case_sensitive(path: &str) -> LessFn {
    let segments = split_path(path);
    Arc::new(move |a, b| json_less(a, b, &segments, true))
}

/// Reverses the order of another comparator.
pub fn desc(less: LessFn) -> LessFn {
    Arc::new(move |a, b| less(b, a))
}

/// Folds several comparators into one lexicographic comparator.
///
/// Each comparator in turn gets a chance to declare strict inequality
/// either way; the last one decides remaining ties. Returns `None` for
/// an empty list - such an index orders by key alone.
pub(crate) fn composite(lessers: &[LessFn]) -> Option<LessFn> {
    match lessers {
        [] => None,
        [single] => Some(Arc::clone(single)),
        _ => {
            let fns: Vec<LessFn> = lessers.to_vec();
            Some(Arc::new(move |a, b| {
                for less in &fns[..fns.len() - 1] {
                    if less(a, b) {
                        return true;
                    }
                    if less(b, a) {
                        return false;
                    }
                }
                fns[fns.len() - 1](a, b)
            }))
        }
    }
}

fn parse_or_default<T: std::str::FromStr + Default>(bytes: &[u8]) -> T {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn caseless_cmp(a: &[u8], b: &[u8]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_owned).collect()
}

fn lookup<'v>(value: &'v Value, segments: &[String]) -> Option<&'v Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Type rank for cross-type JSON comparison: null < false < number <
/// string < true < arrays and objects.
fn rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(false)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Bool(true)) => 4,
        Some(Value::Array(_) | Value::Object(_)) => 5,
    }
}

fn json_less(a: &[u8], b: &[u8], segments: &[String], case_sensitive: bool) -> bool {
    let doc_a = serde_json::from_slice::<Value>(a).ok();
    let doc_b = serde_json::from_slice::<Value>(b).ok();
    let va = doc_a.as_ref().and_then(|d| lookup(d, segments));
    let vb = doc_b.as_ref().and_then(|d| lookup(d, segments));

    let (ra, rb) = (rank(va), rank(vb));
    if ra != rb {
        return ra < rb;
    }
    match (va, vb) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().unwrap_or(0.0) < y.as_f64().unwrap_or(0.0)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            if case_sensitive {
                x < y
            } else {
                caseless_cmp(x.as_bytes(), y.as_bytes()) == Ordering::Less
            }
        }
        (Some(x @ (Value::Array(_) | Value::Object(_))), Some(y)) => {
            x.to_string() < y.to_string()
        }
        _ => false,
    }
}
