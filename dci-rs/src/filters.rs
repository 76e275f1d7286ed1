//! Small data-shaping helpers exposed to playbooks as filters.

use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Parse a kernel command line into a JSON object.
///
/// `key=value` pairs map to strings, except that comma-separated values
/// become lists (`BOOT_IMAGE` excepted). Bare words map to `""`. Dotted keys
/// nest: `nvme.core.io_timeout=4` yields `{"nvme": {"core": {"io_timeout": "4"}}}`.
/// A later dotted key below an existing scalar replaces that scalar.
pub fn cmdline_to_json(cmdline: &str) -> Value {
    let mut kernel = Map::new();

    for item in cmdline.split_whitespace() {
        let (key, value) = match item.split_once('=') {
            Some((k, v)) if v.contains(',') && k != "BOOT_IMAGE" => (
                k,
                Value::Array(v.split(',').map(|s| Value::String(s.into())).collect()),
            ),
            Some((k, v)) => (k, Value::String(v.into())),
            None => (item, Value::String(String::new())),
        };

        let mut parts: Vec<&str> = key.split('.').collect();
        let leaf = parts.pop().unwrap_or(key);
        let mut current = &mut kernel;
        for part in parts {
            let slot = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot was just made an object"),
            };
        }
        current.insert(leaf.to_string(), value);
    }

    Value::Object(kernel)
}

/// Recursively replace `.` by `_` in object keys. Values are left alone.
pub fn dot_to_underscore(data: &Value) -> Value {
    match data {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.replace('.', "_"), dot_to_underscore(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(dot_to_underscore).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum VersionPart {
    Number(u64),
    Text(String),
}

fn version_parts(version: &str) -> Vec<VersionPart> {
    static COMPONENT: OnceLock<Regex> = OnceLock::new();
    let component = COMPONENT.get_or_init(|| Regex::new(r"\d+|[a-z]+|\.").unwrap());

    let mut parts = Vec::new();
    let mut push = |chunk: &str| {
        if chunk.is_empty() || chunk == "." {
            return;
        }
        parts.push(match chunk.parse() {
            Ok(n) if chunk.bytes().all(|b| b.is_ascii_digit()) => VersionPart::Number(n),
            _ => VersionPart::Text(chunk.to_string()),
        });
    };

    let mut last = 0;
    for m in component.find_iter(version) {
        push(&version[last..m.start()]);
        push(m.as_str());
        last = m.end();
    }
    push(&version[last..]);
    parts
}

/// Compare two versions loosely: numeric runs compare as numbers, anything
/// else lexically, numbers sorting before text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_parts(a).cmp(&version_parts(b))
}

pub fn version_sort<S: AsRef<str>>(versions: &[S]) -> Vec<String> {
    let mut sorted: Vec<String> = versions.iter().map(|v| v.as_ref().to_string()).collect();
    sorted.sort_by(|a, b| compare_versions(a, b));
    sorted
}
