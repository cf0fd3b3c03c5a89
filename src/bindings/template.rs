use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\w+)\}").unwrap());

/// Fill `{field}` placeholders in a path from top-level payload fields.
/// Each value is percent-encoded as a single path segment. Fails on the first
/// placeholder the payload cannot supply.
pub fn render(template: &str, payload: &serde_json::Value) -> Result<String, String> {
    if let Some(missing) = PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .find(|field| json_string_field(payload, field).is_none())
    {
        return Err(format!("payload is missing '{missing}' required by {template}"));
    }

    Ok(PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            json_string_field(payload, &caps[1])
                .map(|value| urlencoding::encode(&value).into_owned())
                .unwrap_or_default()
        })
        .to_string())
}

fn json_string_field(value: &serde_json::Value, field: &str) -> Option<String> {
    match value.get(field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::String(_) | serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}
