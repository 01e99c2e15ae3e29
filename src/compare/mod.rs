//! Structural comparison of HTTP responses under a noise policy
//!
//! Responses are flattened to dot-delimited paths (`status`, `header.Date`,
//! `body.user.id`, ...) and compared path by path. The noise policy maps a
//! path to "always noisy" (empty list) or to regexes that mark the path
//! noisy when any of them matches the expected value. Noisy paths never
//! fail a comparison.

use crate::models::{DiffRecord, HttpResp, NoiseMap};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Flattened representation: path -> values observed at that path.
/// Arrays contribute one value per element under the same path.
pub type FlatMap = BTreeMap<String, Vec<String>>;

/// Outcome of comparing one response pair
#[derive(Debug, Clone)]
pub struct Comparison {
    pub passed: bool,
    pub diffs: Vec<DiffRecord>,
}

/// Merge per-test-set noise over the global noise; set entries win on
/// conflicting paths.
pub fn left_join_noise(global: &NoiseMap, test_set: &NoiseMap) -> NoiseMap {
    let mut merged = global.clone();
    for (path, patterns) in test_set {
        merged.insert(path.clone(), patterns.clone());
    }
    merged
}

fn stringify_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format!("{:E}", n.as_f64().unwrap_or(0.0)),
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

/// Flatten a JSON value into dot-delimited paths. The root scalar lives
/// under the empty key; callers prefix with `body`.
pub fn flatten_json(value: &Value) -> FlatMap {
    let mut out = FlatMap::new();
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                for (nested_key, nested_vals) in flatten_json(child) {
                    let full = if nested_key.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", key, nested_key)
                    };
                    out.entry(full).or_default().extend(nested_vals);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                for (nested_key, nested_vals) in flatten_json(item) {
                    out.entry(nested_key).or_default().extend(nested_vals);
                }
            }
        }
        scalar => {
            out.insert(String::new(), vec![stringify_scalar(scalar)]);
        }
    }
    out
}

/// Flatten a full response: `status`, `header.<Name>` and `body[...]` paths
pub fn flatten_response(resp: &HttpResp) -> FlatMap {
    let mut out = FlatMap::new();
    out.insert("status".to_string(), vec![resp.status_code.to_string()]);
    for (name, value) in &resp.header {
        out.insert(format!("header.{}", name), vec![value.clone()]);
    }
    match serde_json::from_str::<Value>(&resp.body) {
        Ok(json) => {
            for (key, vals) in flatten_json(&json) {
                let full = if key.is_empty() {
                    "body".to_string()
                } else {
                    format!("body.{}", key)
                };
                out.insert(full, vals);
            }
        }
        Err(_) => {
            out.insert("body".to_string(), vec![resp.body.clone()]);
        }
    }
    out
}

/// Whether `path` is noisy given the expected values observed there.
/// `header` and `body` act as subtree catch-alls for their sections.
fn is_noisy(noise: &NoiseMap, path: &str, expected: &[String]) -> bool {
    let patterns = match noise.get(path) {
        Some(p) => p,
        None => {
            let section_noisy = (path.starts_with("header.")
                && noise.get("header").is_some_and(Vec::is_empty))
                || (path.starts_with("body.") && noise.get("body").is_some_and(Vec::is_empty));
            return section_noisy;
        }
    };
    if patterns.is_empty() {
        return true;
    }
    let probe = expected.first().map(String::as_str).unwrap_or("");
    patterns.iter().any(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(probe))
            .unwrap_or_else(|e| {
                debug!("skipping unparseable noise regex {:?}: {}", pattern, e);
                false
            })
    })
}

fn values_match(expected: &[String], actual: &[String], ignore_ordering: bool) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    if ignore_ordering {
        let mut e: Vec<&String> = expected.iter().collect();
        let mut a: Vec<&String> = actual.iter().collect();
        e.sort();
        a.sort();
        e == a
    } else {
        expected == actual
    }
}

/// Compare an actual response against the expected one.
///
/// Passing means every non-noise path carries equal values. Paths present
/// on only one side fail unless noisy. Duplicate-valued paths compare
/// length first, then elementwise (multisets when `ignore_ordering`).
pub fn compare(
    expected: &HttpResp,
    actual: &HttpResp,
    noise: &NoiseMap,
    ignore_ordering: bool,
) -> Comparison {
    let expected_flat = flatten_response(expected);
    let actual_flat = flatten_response(actual);

    let paths: BTreeSet<&String> = expected_flat.keys().chain(actual_flat.keys()).collect();
    let empty: Vec<String> = Vec::new();

    let mut passed = true;
    let mut diffs = Vec::with_capacity(paths.len());
    for path in paths {
        let exp = expected_flat.get(path).unwrap_or(&empty);
        let act = actual_flat.get(path).unwrap_or(&empty);
        let normal = if is_noisy(noise, path, exp) {
            true
        } else {
            let matched = values_match(exp, act, ignore_ordering);
            passed &= matched;
            matched
        };
        diffs.push(DiffRecord {
            path: path.clone(),
            expected: exp.join(", "),
            actual: act.join(", "),
            normal,
        });
    }

    Comparison { passed, diffs }
}
