//! PII redaction for persisted failed batches
//!
//! Two layers: field names that are sensitive by convention are replaced
//! wholesale, and string values are scanned for sensitive content patterns.
//! Redaction always operates on a copy; callers keep the original batch
//! untouched.

use logs2sentinel_core::{Record, Scalar};
use once_cell::sync::Lazy;
use regex::Regex;

// Field-name fragments that mark the whole value as sensitive.
const SENSITIVE_FIELD_FRAGMENTS: [&str; 10] = [
    "password",
    "pwd",
    "token",
    "secret",
    "api_key",
    "apikey",
    "email",
    "ssn",
    "credit_card",
    "phone",
];

struct ContentPattern {
    kind: &'static str,
    regex: &'static Lazy<Regex>,
}

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CREDIT_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").unwrap());
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(?\b\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b").unwrap());
static IPV4: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static API_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Za-z0-9_-]{32,}\b").unwrap());

// Checked in order; earlier, more specific patterns win.
static CONTENT_PATTERNS: [ContentPattern; 6] = [
    ContentPattern {
        kind: "EMAIL",
        regex: &EMAIL,
    },
    ContentPattern {
        kind: "SSN",
        regex: &SSN,
    },
    ContentPattern {
        kind: "CREDIT_CARD",
        regex: &CREDIT_CARD,
    },
    ContentPattern {
        kind: "PHONE",
        regex: &PHONE,
    },
    ContentPattern {
        kind: "IPV4",
        regex: &IPV4,
    },
    ContentPattern {
        kind: "API_KEY",
        regex: &API_KEY,
    },
];

fn is_sensitive_field(name: &str) -> bool {
    let lowered = name.to_lowercase();
    SENSITIVE_FIELD_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

fn redact_content(value: &str) -> String {
    let mut redacted = value.to_string();
    for pattern in &CONTENT_PATTERNS {
        redacted = pattern
            .regex
            .replace_all(&redacted, format!("[REDACTED:{}]", pattern.kind))
            .into_owned();
    }
    redacted
}

/// Redact one record into a fresh copy.
pub fn redact_record(record: &Record) -> Record {
    record
        .iter()
        .map(|(name, value)| {
            if is_sensitive_field(name) {
                return (
                    name.clone(),
                    Scalar::String(format!("[REDACTED:{}]", name.to_uppercase())),
                );
            }
            let redacted = match value {
                Scalar::String(s) => Scalar::String(redact_content(s)),
                other => other.clone(),
            };
            (name.clone(), redacted)
        })
        .collect()
}

/// Redact a whole batch; the input slice is never mutated.
pub fn redact_batch(records: &[Record]) -> Vec<Record> {
    records.iter().map(redact_record).collect()
}

/// True when `text` still contains something a content pattern would match.
/// Used by tests to assert persisted files are clean.
pub fn contains_sensitive_content(text: &str) -> bool {
    CONTENT_PATTERNS
        .iter()
        .any(|pattern| pattern.regex.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(fields: &[(&str, &str)]) -> Record {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), Scalar::String(v.to_string())))
            .collect()
    }

    #[test]
    fn redacts_email_addresses() {
        let record = record_with(&[
            ("user", "john.doe@example.com"),
            ("message", "contact help@company.org for support"),
        ]);
        let redacted = redact_record(&record);
        assert_eq!(redacted["user"], Scalar::from("[REDACTED:EMAIL]"));
        assert_eq!(
            redacted["message"],
            Scalar::from("contact [REDACTED:EMAIL] for support")
        );
    }

    #[test]
    fn redacts_ssn_and_credit_cards() {
        let record = record_with(&[
            ("notes", "SSN: 123-45-6789"),
            ("payment", "4532-1234-5678-9010"),
        ]);
        let redacted = redact_record(&record);
        assert_eq!(redacted["notes"], Scalar::from("SSN: [REDACTED:SSN]"));
        assert_eq!(redacted["payment"], Scalar::from("[REDACTED:CREDIT_CARD]"));
    }

    #[test]
    fn redacts_phone_numbers_and_ipv4() {
        let record = record_with(&[("contact", "555-123-4567"), ("source", "192.168.1.100")]);
        let redacted = redact_record(&record);
        assert_eq!(redacted["contact"], Scalar::from("[REDACTED:PHONE]"));
        assert_eq!(redacted["source"], Scalar::from("[REDACTED:IPV4]"));
    }

    #[test]
    fn redacts_high_entropy_tokens() {
        let record = record_with(&[(
            "note",
            "issued key abcdef0123456789abcdef0123456789abcdef01 yesterday",
        )]);
        let redacted = redact_record(&record);
        assert_eq!(
            redacted["note"],
            Scalar::from("issued key [REDACTED:API_KEY] yesterday")
        );
    }

    #[test]
    fn redacts_by_field_name() {
        let record = record_with(&[
            ("password", "hunter2"),
            ("user_password", "hunter3"),
            ("auth_token", "bearer-xyz"),
            ("client_secret", "shhh"),
        ]);
        let redacted = redact_record(&record);
        assert_eq!(redacted["password"], Scalar::from("[REDACTED:PASSWORD]"));
        assert_eq!(
            redacted["user_password"],
            Scalar::from("[REDACTED:USER_PASSWORD]")
        );
        assert_eq!(redacted["auth_token"], Scalar::from("[REDACTED:AUTH_TOKEN]"));
        assert_eq!(
            redacted["client_secret"],
            Scalar::from("[REDACTED:CLIENT_SECRET]")
        );
        let serialized = serde_json::to_string(&redacted).unwrap();
        assert!(!serialized.contains("hunter2"));
        assert!(!serialized.contains("shhh"));
    }

    #[test]
    fn non_string_scalars_pass_through() {
        let mut record = Record::new();
        record.insert("count".into(), Scalar::Int(42));
        record.insert("ratio".into(), Scalar::Float(0.5));
        record.insert("ok".into(), Scalar::Bool(true));
        let redacted = redact_record(&record);
        assert_eq!(redacted, record);
    }

    #[test]
    fn original_batch_is_untouched() {
        let batch = vec![record_with(&[("user", "john.doe@example.com")])];
        let redacted = redact_batch(&batch);
        assert_eq!(batch[0]["user"], Scalar::from("john.doe@example.com"));
        assert_eq!(redacted[0]["user"], Scalar::from("[REDACTED:EMAIL]"));
    }

    #[test]
    fn redacted_output_has_no_sensitive_content() {
        let batch = vec![record_with(&[
            ("a", "john.doe@example.com"),
            ("b", "123-45-6789"),
            ("c", "4532123456789010"),
            ("d", "(555) 987-6543"),
            ("e", "10.0.0.1"),
        ])];
        let serialized = serde_json::to_string(&redact_batch(&batch)).unwrap();
        assert!(!contains_sensitive_content(&serialized));
    }
}
