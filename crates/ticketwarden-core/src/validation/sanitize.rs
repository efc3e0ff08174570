//! Redaction of credential-shaped text before it reaches logs or users.
//!
//! Rules run in a fixed order: password, token, secret, credential, long
//! base64-like runs, then helper command arguments. Each rule replaces the
//! whole match with a literal marker, so the key name itself does not
//! survive (`password=x` becomes `[PASSWORD_REDACTED]`).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

pub const PASSWORD_MARKER: &str = "[PASSWORD_REDACTED]";
pub const TOKEN_MARKER: &str = "[TOKEN_REDACTED]";
pub const SECRET_MARKER: &str = "[SECRET_REDACTED]";
pub const CREDENTIAL_MARKER: &str = "[CREDENTIAL_REDACTED]";
pub const BASE64_MARKER: &str = "[BASE64_REDACTED]";
pub const ARGS_MARKER: &str = "[ARGS_REDACTED]";
pub const KEY_MARKER: &str = "[REDACTED]";

/// Substrings that mark a map key as credential-bearing
const SENSITIVE_KEY_MARKERS: &[&str] = &["password", "token", "secret", "key", "credential", "auth"];

/// Separator and value after a credential-shaped key. The key may be closed
/// by a quote (`"token": ...`) and the value may be empty (`password=`).
const VALUE: &str = r#"["']?\s*[=:]\s*(?:"[^"]*"|'[^']*'|\S+)?"#;

struct RedactionRule {
    pattern: Regex,
    replacement: &'static str,
}

impl RedactionRule {
    fn new(pattern: &str, replacement: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("invalid redaction regex"),
            replacement,
        }
    }
}

static RULES: LazyLock<Vec<RedactionRule>> = LazyLock::new(|| {
    vec![
        RedactionRule::new(&format!(r"(?i)[a-z0-9_-]*(?:password|passwd|pwd){}", VALUE), PASSWORD_MARKER),
        RedactionRule::new(&format!(r"(?i)[a-z0-9_-]*token{}", VALUE), TOKEN_MARKER),
        RedactionRule::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+", TOKEN_MARKER),
        RedactionRule::new(&format!(r"(?i)[a-z0-9_-]*secret{}", VALUE), SECRET_MARKER),
        RedactionRule::new(&format!(r"(?i)[a-z0-9_-]*credentials?{}", VALUE), CREDENTIAL_MARKER),
        RedactionRule::new(r"[A-Za-z0-9+/]{20,}={0,2}", BASE64_MARKER),
        RedactionRule::new(r"(?i)\b(mwinit|kinit|klist)(?:\s+-\S+)+", "${1} [ARGS_REDACTED]"),
    ]
});

/// Apply every redaction rule, in order, to free-form text
pub fn sanitize_text(text: &str) -> String {
    RULES.iter().fold(text.to_string(), |acc, rule| {
        rule.pattern.replace_all(&acc, rule.replacement).into_owned()
    })
}

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Sanitize a string-keyed map. Sensitive keys are replaced wholesale;
/// other values are sanitized recursively.
pub fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let cleaned = if is_sensitive_key(key) {
                Value::String(KEY_MARKER.to_string())
            } else {
                sanitize_value(value)
            };
            (key.clone(), cleaned)
        })
        .collect()
}

pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_text(s)),
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_password_patterns_redacted() {
        for input in [
            "login failed: password=hunter2",
            "PASSWORD: hunter2 was rejected",
            r#"config has passwd="two words""#,
            "user_password=hunter2",
        ] {
            let out = sanitize_text(input);
            assert!(out.contains(PASSWORD_MARKER), "{} -> {}", input, out);
            assert!(!out.to_lowercase().contains("password="), "{}", out);
            assert!(!out.contains("hunter2"));
            assert!(!out.contains("two words"));
        }
    }

    #[test]
    fn test_token_secret_credential_patterns_redacted() {
        let out = sanitize_text("token: abc123 and access_token=xyz");
        assert!(!out.contains("token:"));
        assert!(!out.contains("abc123"));
        assert!(!out.contains("xyz"));
        assert_eq!(out.matches(TOKEN_MARKER).count(), 2);

        let out = sanitize_text("Authorization: Bearer eyJhbGciOi.abc");
        assert!(out.contains(TOKEN_MARKER));
        assert!(!out.contains("eyJhbGciOi"));

        let out = sanitize_text("client_secret=s3cr3t");
        assert_eq!(out, SECRET_MARKER);

        let out = sanitize_text("bad credentials: alice/hunter");
        assert_eq!(out, format!("bad {}", CREDENTIAL_MARKER));
    }

    #[test]
    fn test_empty_values_redacted() {
        for (input, marker) in [
            ("login failed: password=", PASSWORD_MARKER),
            ("secret= ", SECRET_MARKER),
            ("token:\n", TOKEN_MARKER),
        ] {
            let out = sanitize_text(input);
            assert!(out.contains(marker), "{:?} -> {:?}", input, out);
            for literal in ["password=", "secret=", "token:"] {
                assert!(!out.contains(literal), "{:?} -> {:?}", input, out);
            }
        }
    }

    #[test]
    fn test_keys_with_digits_redacted() {
        let out = sanitize_text("db1password=hunter2");
        assert_eq!(out, PASSWORD_MARKER);

        let out = sanitize_text("using svc2_token=abc and k8s-secret: xyz");
        assert!(!out.contains("abc"));
        assert!(!out.contains("xyz"));
        assert!(out.contains(TOKEN_MARKER));
        assert!(out.contains(SECRET_MARKER));
    }

    #[test]
    fn test_json_shaped_fields_redacted() {
        let out = sanitize_text(r#"{"token": "abcdefg"}"#);
        assert!(out.contains(TOKEN_MARKER), "{}", out);
        assert!(!out.contains("abcdefg"));

        let out = sanitize_text(r#"error: {"user": "alice", "password": "two words"}"#);
        assert!(out.contains("alice"));
        assert!(out.contains(PASSWORD_MARKER));
        assert!(!out.contains("two words"));

        let out = sanitize_text("{'client_secret': 'x1'}");
        assert!(!out.contains("x1"));
    }

    #[test]
    fn test_base64_runs_redacted() {
        let blob = "QUJDREVGR0hJSktMTU5PUFFSU1RVVldY";
        let out = sanitize_text(&format!("ticket {} rejected", blob));
        assert_eq!(out, format!("ticket {} rejected", BASE64_MARKER));

        // 19 characters stays
        let short = "ABCDEFGHIJKLMNOPQRS";
        assert_eq!(sanitize_text(short), short);
    }

    #[test]
    fn test_helper_arguments_redacted() {
        let out = sanitize_text("ran mwinit -o --aea x");
        assert!(out.contains("mwinit [ARGS_REDACTED]"), "{}", out);
        assert!(!out.contains("--aea"));

        let out = sanitize_text("KINIT -R failed");
        assert_eq!(out, "KINIT [ARGS_REDACTED] failed");
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "Network unreachable, retry later";
        assert_eq!(sanitize_text(text), text);
    }

    #[test]
    fn test_sensitive_keys_replaced_regardless_of_shape() {
        let data = json!({
            "user": "alice",
            "api_key": 12345,
            "AuthHeader": {"nested": "value"},
            "session_token": ["a", "b"],
            "note": "password=hunter2",
            "context": {
                "secret_value": "x",
                "count": 3,
                "items": ["token=abc", 7]
            }
        });
        let Value::Object(map) = data else { unreachable!() };
        let out = Value::Object(sanitize_map(&map));

        assert_eq!(out["user"], "alice");
        assert_eq!(out["api_key"], KEY_MARKER);
        assert_eq!(out["AuthHeader"], KEY_MARKER);
        assert_eq!(out["session_token"], KEY_MARKER);
        assert_eq!(out["note"], PASSWORD_MARKER);
        assert_eq!(out["context"]["secret_value"], KEY_MARKER);
        assert_eq!(out["context"]["count"], 3);
        assert_eq!(out["context"]["items"][0], TOKEN_MARKER);
        assert_eq!(out["context"]["items"][1], 7);
    }
}
