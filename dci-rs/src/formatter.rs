//! Human-readable rendering of task results, uploaded as job files.

use serde_json::{Map, Value};

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Render a field for display: strings as-is, anything else as JSON.
fn show(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn module_name(result: &Value) -> &str {
    match result.get("invocation") {
        None => "file",
        Some(_) if result.get("extract_result").is_some() => "unarchive",
        Some(invocation) => str_field(invocation, "module_name").unwrap_or("package"),
    }
}

/// Pick the most meaningful output of a task result.
///
/// Tasks do not agree on where their output lives: it is usually `stdout`,
/// but several modules report through other fields. The result always ends
/// with a newline.
pub fn format_output(result: &Value) -> String {
    let stderr = str_field(result, "stderr").unwrap_or_default();
    let stdout = str_field(result, "stdout").unwrap_or_default();

    let output = if !stderr.is_empty() {
        if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("Error Output:\n\n{stderr}\n\nStandard Output:\n\n{stdout}")
        }
    } else {
        match module_name(result) {
            "os_server" => {
                let server = result.get("server").unwrap_or(&Value::Null);
                format!(
                    "{} - {}",
                    show(server.get("status")),
                    show(server.get("id"))
                )
            }
            "hostname" => format!("Hostname: {}", show(result.get("name"))),
            "user" => format!(
                "Name: {} - uid: {} - gid: {}",
                show(result.get("name")),
                show(result.get("uid")),
                show(result.get("group"))
            ),
            "lineinfile" => format!(
                "{} - {}",
                show(result.pointer("/invocation/module_args/line")),
                show(result.get("msg"))
            ),
            "get_url" => format!(
                "{} - {}",
                show(result.get("dest")),
                show(result.get("msg"))
            ),
            "unarchive" => format!(
                "{} unarchived in {}",
                show(result.get("src")),
                show(result.get("dest"))
            ),
            _ => {
                if let Some(lines) = result.get("stdout_lines").and_then(Value::as_array) {
                    lines
                        .iter()
                        .map(|l| show(Some(l)))
                        .collect::<Vec<_>>()
                        .join("\n")
                } else if let Some(msg) = result.get("msg") {
                    show(Some(msg))
                } else {
                    "All items completed".to_string()
                }
            }
        }
    };

    format!("{output}\n")
}

/// Drop `stdout_lines`/`stderr_lines` when `stdout`/`stderr` carry the same
/// content. Non-object values are returned unchanged.
pub fn remove_duplicated_content(result: &Value) -> Value {
    let Some(object) = result.as_object() else {
        return result.clone();
    };
    let mut cleaned: Map<String, Value> = object.clone();
    for (keep, drop) in [("stdout", "stdout_lines"), ("stderr", "stderr_lines")] {
        if cleaned.contains_key(keep) {
            cleaned.remove(drop);
        }
    }
    Value::Object(cleaned)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn stderr_and_stdout_are_combined() {
        let result = json!({"stderr": "boom", "stdout": "partial"});
        assert_eq!(
            format_output(&result),
            "Error Output:\n\nboom\n\nStandard Output:\n\npartial\n"
        );
        assert_eq!(format_output(&json!({"stderr": "boom", "stdout": ""})), "boom\n");
    }

    #[test]
    fn stdout_lines_are_joined() {
        let result = json!({
            "invocation": {"module_name": "command"},
            "stdout_lines": ["a", "b"],
            "stderr": ""
        });
        assert_eq!(format_output(&result), "a\nb\n");
    }

    #[test]
    fn module_specific_summaries() {
        let user = json!({
            "invocation": {"module_name": "user"},
            "name": "ci", "uid": 1000, "group": 1000
        });
        assert_eq!(format_output(&user), "Name: ci - uid: 1000 - gid: 1000\n");

        let line = json!({
            "invocation": {"module_name": "lineinfile", "module_args": {"line": "x=1"}},
            "msg": "line added"
        });
        assert_eq!(format_output(&line), "x=1 - line added\n");

        let unarchive = json!({
            "invocation": {"module_args": {}},
            "extract_result": {},
            "src": "/tmp/a.tgz", "dest": "/opt"
        });
        assert_eq!(format_output(&unarchive), "/tmp/a.tgz unarchived in /opt\n");
    }

    #[test]
    fn fallbacks() {
        assert_eq!(format_output(&json!({"msg": "hello"})), "hello\n");
        assert_eq!(format_output(&json!({})), "All items completed\n");
    }

    #[test]
    fn duplicated_lines_are_removed() {
        let result = json!({
            "stdout": "a\nb",
            "stdout_lines": ["a", "b"],
            "stderr_lines": ["c"]
        });
        assert_eq!(
            remove_duplicated_content(&result),
            json!({"stdout": "a\nb", "stderr_lines": ["c"]})
        );
        assert_eq!(remove_duplicated_content(&json!("raw")), json!("raw"));
    }
}
