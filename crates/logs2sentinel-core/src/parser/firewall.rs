//! Pipe-delimited firewall log parser
//!
//! Expected line shape:
//! `timestamp|src_ip|dst_ip|action|rule_name|proto|src_port|dst_port|bytes`

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::ParseError;
use crate::parser::{LogParser, MetricsSnapshot, ParserMetrics};
use crate::record::{Record, Scalar};

const VALID_ACTIONS: [&str; 4] = ["allow", "deny", "drop", "reset"];

// Positional source fields after the timestamp, with their normalized names.
const FIELD_SEQUENCE: [(&str, &str); 8] = [
    ("src_ip", "SourceIP"),
    ("dst_ip", "DestinationIP"),
    ("action", "FirewallAction"),
    ("rule_name", "RuleName"),
    ("proto", "Protocol"),
    ("src_port", "SourcePort"),
    ("dst_port", "DestinationPort"),
    ("bytes", "BytesTransferred"),
];

// Tried in order; naive results are taken as UTC.
const TIMESTAMP_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%d %H:%M:%S",
    "%b %d %Y %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
];

/// Parser for single-line, pipe-delimited firewall exports.
#[derive(Debug, Default)]
pub struct FirewallParser {
    metrics: ParserMetrics,
}

impl FirewallParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_inner(&self, data: &[u8]) -> Result<Record, ParseError> {
        let line = std::str::from_utf8(data)?.trim();
        let mut fields = line.split('|');

        let timestamp_str = fields.next().unwrap_or_default();
        let mut record = Record::new();
        record.insert(
            "TimeGenerated".to_string(),
            Scalar::Timestamp(parse_timestamp(timestamp_str)?),
        );

        for ((source_name, normalized_name), value) in FIELD_SEQUENCE.iter().zip(fields) {
            record.insert(
                normalized_name.to_string(),
                normalize_field(source_name, value)?,
            );
        }

        record.insert("LogSource".to_string(), Scalar::String("Firewall".into()));
        record.insert("ProcessingTime".to_string(), Scalar::Timestamp(Utc::now()));

        Ok(record)
    }
}

impl LogParser for FirewallParser {
    fn parse(&self, data: &[u8]) -> Result<Record, ParseError> {
        match self.parse_inner(data) {
            Ok(record) => {
                self.metrics.record_parsed();
                Ok(record)
            }
            Err(e) => {
                self.metrics.record_failure(&e);
                Err(e)
            }
        }
    }

    fn validate(&self, record: &Record) -> bool {
        for field in ["TimeGenerated", "SourceIP", "DestinationIP", "FirewallAction"] {
            if !record.contains_key(field) {
                tracing::error!(field, "missing required field");
                return false;
            }
        }

        for field in ["SourceIP", "DestinationIP"] {
            let valid = record
                .get(field)
                .and_then(Scalar::as_str)
                .map(|s| IpAddr::from_str(s).is_ok())
                .unwrap_or(false);
            if !valid {
                tracing::error!(field, "invalid IP address format");
                return false;
            }
        }

        let action_valid = record
            .get("FirewallAction")
            .and_then(Scalar::as_str)
            .map(|a| VALID_ACTIONS.contains(&a.to_lowercase().as_str()))
            .unwrap_or(false);
        if !action_valid {
            tracing::error!("invalid firewall action");
            return false;
        }

        true
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParseError> {
    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ParseError::Timestamp(value.to_string()))
}

fn normalize_field(source_name: &str, value: &str) -> Result<Scalar, ParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(Scalar::Null);
    }

    match source_name {
        "src_ip" | "dst_ip" => {
            let addr = IpAddr::from_str(value).map_err(|e| ParseError::Field {
                field: source_name.to_string(),
                message: e.to_string(),
            })?;
            Ok(Scalar::String(addr.to_string()))
        }
        "src_port" | "dst_port" | "bytes" => {
            let n: i64 = value.parse().map_err(|e: std::num::ParseIntError| {
                ParseError::Field {
                    field: source_name.to_string(),
                    message: e.to_string(),
                }
            })?;
            Ok(Scalar::Int(n))
        }
        "action" => Ok(Scalar::String(value.to_lowercase())),
        "proto" => Ok(Scalar::String(value.to_uppercase())),
        _ => Ok(Scalar::String(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse_line(line: &str) -> Record {
        FirewallParser::new().parse(line.as_bytes()).unwrap()
    }

    #[test]
    fn parses_well_formed_line() {
        let record =
            parse_line("2024-01-01T10:00:00Z|192.168.1.100|10.0.0.1|ALLOW|r1|TCP|80|443|1024");

        assert_eq!(
            record.get("TimeGenerated"),
            Some(&Scalar::Timestamp(
                Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
            ))
        );
        assert_eq!(record.get("SourceIP"), Some(&Scalar::from("192.168.1.100")));
        assert_eq!(record.get("DestinationIP"), Some(&Scalar::from("10.0.0.1")));
        assert_eq!(record.get("FirewallAction"), Some(&Scalar::from("allow")));
        assert_eq!(record.get("RuleName"), Some(&Scalar::from("r1")));
        assert_eq!(record.get("Protocol"), Some(&Scalar::from("TCP")));
        assert_eq!(record.get("SourcePort"), Some(&Scalar::Int(80)));
        assert_eq!(record.get("DestinationPort"), Some(&Scalar::Int(443)));
        assert_eq!(record.get("BytesTransferred"), Some(&Scalar::Int(1024)));
        assert_eq!(record.get("LogSource"), Some(&Scalar::from("Firewall")));
        assert!(matches!(
            record.get("ProcessingTime"),
            Some(Scalar::Timestamp(_))
        ));
    }

    #[test]
    fn lowercases_action_and_uppercases_protocol() {
        let record = parse_line("2024-01-01 10:00:00|1.2.3.4|5.6.7.8|DeNy|r|tcp|1|2|3");
        assert_eq!(record.get("FirewallAction"), Some(&Scalar::from("deny")));
        assert_eq!(record.get("Protocol"), Some(&Scalar::from("TCP")));
    }

    #[test]
    fn accepts_every_documented_timestamp_format() {
        for ts in [
            "2024-01-01T10:00:00.123Z",
            "2024-01-01T10:00:00Z",
            "2024-01-01 10:00:00",
            "Jan 01 2024 10:00:00",
            "2024/01/01 10:00:00",
        ] {
            let line = format!("{ts}|1.2.3.4|5.6.7.8|allow|r|TCP|1|2|3");
            let record = parse_line(&line);
            match record.get("TimeGenerated") {
                Some(Scalar::Timestamp(parsed)) => {
                    assert_eq!(
                        parsed.date_naive(),
                        chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                        "wrong date for {ts}"
                    );
                }
                other => panic!("expected timestamp for {ts}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let err = FirewallParser::new()
            .parse(b"not-a-time|1.2.3.4|5.6.7.8|allow|r|TCP|1|2|3")
            .unwrap_err();
        assert!(matches!(err, ParseError::Timestamp(_)));
    }

    #[test]
    fn rejects_bad_ip_and_bad_port() {
        let parser = FirewallParser::new();
        assert!(parser
            .parse(b"2024-01-01T10:00:00Z|999.999.1.1|5.6.7.8|allow|r|TCP|1|2|3")
            .is_err());
        assert!(parser
            .parse(b"2024-01-01T10:00:00Z|1.2.3.4|5.6.7.8|allow|r|TCP|eighty|2|3")
            .is_err());
    }

    #[test]
    fn accepts_ipv6_addresses() {
        let record = parse_line("2024-01-01T10:00:00Z|2001:db8::1|::1|drop|r|UDP|1|2|3");
        assert_eq!(record.get("SourceIP"), Some(&Scalar::from("2001:db8::1")));
        assert!(FirewallParser::new().validate(&record));
    }

    #[test]
    fn short_lines_yield_partial_records() {
        let record = parse_line("2024-01-01T10:00:00Z|1.2.3.4|5.6.7.8|reset");
        assert!(record.contains_key("FirewallAction"));
        assert!(!record.contains_key("Protocol"));
    }

    #[test]
    fn empty_field_becomes_null() {
        let record = parse_line("2024-01-01T10:00:00Z|1.2.3.4|5.6.7.8|allow||TCP|1|2|3");
        assert_eq!(record.get("RuleName"), Some(&Scalar::Null));
    }

    #[test]
    fn validate_rejects_unknown_action_and_missing_fields() {
        let parser = FirewallParser::new();

        let record = parse_line("2024-01-01T10:00:00Z|1.2.3.4|5.6.7.8|allow|r|TCP|1|2|3");
        assert!(parser.validate(&record));

        let mut bad_action = record.clone();
        bad_action.insert("FirewallAction".into(), Scalar::from("blocked"));
        assert!(!parser.validate(&bad_action));

        let mut missing = record.clone();
        missing.remove("SourceIP");
        assert!(!parser.validate(&missing));
    }

    #[test]
    fn metrics_count_parses_and_failures() {
        let parser = FirewallParser::new();
        parser
            .parse(b"2024-01-01T10:00:00Z|1.2.3.4|5.6.7.8|allow|r|TCP|1|2|3")
            .unwrap();
        let _ = parser.parse(b"garbage");
        let snap = parser.metrics();
        assert_eq!(snap.parsed, 1);
        assert_eq!(snap.parse_failures, 1);
    }
}
