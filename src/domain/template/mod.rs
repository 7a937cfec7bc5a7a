//! Literal `{{name}}` variable substitution.
//!
//! Applied to subject and content at submission time when the caller supplies
//! a `variables` object in the metadata. No conditionals, no loops; richer
//! templating belongs in a collaborator service.

/// Substitute every `{{key}}` occurrence with the matching variable value.
///
/// Non-string values render via their JSON representation; null renders as
/// the empty string. Unknown placeholders are left untouched.
pub fn substitute_variables(
    template: &str,
    variables: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let pattern = format!("{{{{{}}}}}", key);
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => String::new(),
            _ => value.to_string(),
        };
        result = result.replace(&pattern, &replacement);
    }

    result
}
