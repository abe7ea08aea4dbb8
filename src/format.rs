use serde_json::Value;

use crate::types::FormData;

/// Human-readable body shared by text channels.
///
/// One `key: value` line per field, in submission order, under a heading
/// naming the form.
pub fn format_submission_message(form_name: &str, form_data: &FormData) -> String {
    let mut message = format!("New submission for {form_name}\n");
    if form_data.is_empty() {
        message.push_str("\n(no fields submitted)");
        return message;
    }
    for (key, value) in form_data {
        message.push('\n');
        message.push_str(key);
        message.push_str(": ");
        message.push_str(&field_text(value));
    }
    message
}

/// Text of one field value: strings as-is, arrays comma-joined, other
/// values as compact JSON.
pub fn field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(field_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> FormData {
        match value {
            Value::Object(map) => map,
            _ => FormData::new(),
        }
    }

    #[test]
    fn lines_follow_submission_order() {
        let form_data = data(json!({
            "name": "Ada",
            "topics": ["rust", "queues"],
            "age": 36,
            "address": {"city": "London"},
            "newsletter": true,
            "note": null
        }));

        let message = format_submission_message("Contact", &form_data);

        assert_eq!(
            message,
            "New submission for Contact\n\
             \nname: Ada\
             \ntopics: rust, queues\
             \nage: 36\
             \naddress: {\"city\":\"London\"}\
             \nnewsletter: true\
             \nnote: "
        );
    }

    #[test]
    fn empty_submission_is_still_readable() {
        let message = format_submission_message("Signup", &FormData::new());
        assert!(message.starts_with("New submission for Signup"));
        assert!(message.ends_with("(no fields submitted)"));
    }
}
