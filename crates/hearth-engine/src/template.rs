use serde_json::Value;

use crate::context::ExecutionContext;

/// Render `{{path}}` placeholders in tool arguments against the context.
///
/// A string that is exactly one placeholder is replaced by the resolved JSON
/// value (or `null`). Placeholders embedded in longer strings are spliced in
/// as text, with unresolved paths rendering empty. Object keys are left alone.
pub fn render_args(args: &Value, context: &ExecutionContext) -> Value {
    match args {
        Value::String(s) => render_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_args(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_args(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, context: &ExecutionContext) -> Value {
    if let Some(path) = whole_placeholder(s) {
        return context.resolve(path).cloned().unwrap_or(Value::Null);
    }
    if !s.contains("{{") {
        return Value::String(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                match context.resolve(after[..end].trim()) {
                    Some(Value::String(v)) => out.push_str(v),
                    Some(Value::Null) | None => {}
                    Some(other) => out.push_str(&other.to_string()),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextEntry;
    use serde_json::{json, Map};

    fn ctx() -> ExecutionContext {
        let mut inputs = Map::new();
        inputs.insert("host".into(), json!("nas.local"));
        let mut ctx = ExecutionContext::with_inputs(inputs);
        ctx.record(
            "ping",
            ContextEntry::Success(json!({"latency_ms": 12, "hosts": ["nas"]})),
        )
        .unwrap();
        ctx
    }

    #[test]
    fn whole_placeholder_keeps_json_type() {
        let out = render_args(
            &json!({"latency": "{{ ping.result.latency_ms }}", "hosts": "{{ping.result.hosts}}"}),
            &ctx(),
        );
        assert_eq!(out, json!({"latency": 12, "hosts": ["nas"]}));
    }

    #[test]
    fn embedded_placeholders_become_text() {
        let out = render_args(
            &json!({"message": "{{input.host}} answered in {{ping.result.latency_ms}}ms{{missing}}"}),
            &ctx(),
        );
        assert_eq!(out["message"], "nas.local answered in 12ms");
    }

    #[test]
    fn missing_whole_placeholder_is_null_and_literals_pass_through() {
        let out = render_args(
            &json!(["{{notify.result}}", 3, true, "plain", "{{open"]),
            &ctx(),
        );
        assert_eq!(out, json!([null, 3, true, "plain", "{{open"]));
    }
}
