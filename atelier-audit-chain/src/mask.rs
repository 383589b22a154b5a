use serde_json::Value;

/// Lowercased key fragments whose values never leave the producer.
const SENSITIVE_FRAGMENTS: &[&str] = &[
    "password",
    "secret",
    "token",
    "authorization",
    "api_key",
    "recovery",
    "card_number",
    "cvv",
    "ssn",
];

const REDACTED: &str = "[REDACTED]";

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_FRAGMENTS
        .iter()
        .any(|fragment| key.contains(fragment))
}

/// Recursively replaces the value of every sensitive key. Masking runs
/// at the audit producer, before the entry reaches the queue, so queue
/// storage never carries unmasked data.
pub fn mask_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if is_sensitive(key) {
                    *nested = Value::String(REDACTED.into());
                } else {
                    mask_sensitive(nested);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                mask_sensitive(item);
            }
        }
        _ => {}
    }
}
