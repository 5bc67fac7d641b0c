//! Log parser family
//!
//! Parsers decode raw object bytes into records and pre-validate them before
//! the sink's schema enforcement. Parse failures are terminal for the input
//! in question (bad bytes stay bad), so `ParseError` is never retried.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ParseError;
use crate::record::Record;

mod firewall;
mod json;

pub use firewall::FirewallParser;
pub use json::{JsonParser, JsonSchema};

/// Decode raw bytes into a normalized record.
pub trait LogParser: Send + Sync {
    fn parse(&self, data: &[u8]) -> Result<Record, ParseError>;

    /// Cheap structural validation of a parsed record. Returns false rather
    /// than erroring: an invalid record is dropped, not failed.
    fn validate(&self, record: &Record) -> bool;

    fn metrics(&self) -> MetricsSnapshot;
}

/// Internal counters kept by each parser.
#[derive(Debug, Default)]
pub struct ParserMetrics {
    parsed: AtomicU64,
    parse_failures: AtomicU64,
    size_rejections: AtomicU64,
    depth_rejections: AtomicU64,
}

/// Point-in-time view of parser counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub parsed: u64,
    pub parse_failures: u64,
    pub size_rejections: u64,
    pub depth_rejections: u64,
}

impl ParserMetrics {
    pub fn record_parsed(&self) {
        self.parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: &ParseError) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
        match error {
            ParseError::PayloadTooLarge { .. } => {
                self.size_rejections.fetch_add(1, Ordering::Relaxed);
            }
            ParseError::TooDeep { .. } => {
                self.depth_rejections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            parsed: self.parsed.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            size_rejections: self.size_rejections.load(Ordering::Relaxed),
            depth_rejections: self.depth_rejections.load(Ordering::Relaxed),
        }
    }
}
