//! Listing and filtering of new log objects

use chrono::{DateTime, Utc};

/// One listed object, identity (bucket, key, etag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub storage_class: String,
}

const VALID_EXTENSIONS: [&str; 4] = [".log", ".json", ".gz", ".csv"];
const EXCLUDED_PATTERNS: [&str; 3] = ["temp", "partial", "incomplete"];

/// Suffix/substring filter applied to listed keys. Work-in-progress markers
/// (temp, partial, incomplete) are skipped regardless of extension.
pub(crate) fn is_valid_key(key: &str) -> bool {
    if !VALID_EXTENSIONS.iter().any(|ext| key.ends_with(ext)) {
        return false;
    }
    let lowered = key.to_lowercase();
    if EXCLUDED_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return false;
    }
    true
}

/// Full listing filter: drops empty objects, invalid keys, and anything at
/// or before the watermark.
pub(crate) fn passes_filters(descriptor: &ObjectDescriptor, since: Option<DateTime<Utc>>) -> bool {
    if descriptor.size == 0 {
        return false;
    }
    if !is_valid_key(&descriptor.key) {
        return false;
    }
    if let Some(since) = since {
        if descriptor.last_modified <= since {
            return false;
        }
    }
    true
}
