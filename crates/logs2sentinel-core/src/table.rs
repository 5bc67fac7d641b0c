//! Per-table schema configuration
//!
//! One `TableConfig` per log type, created at startup and immutable
//! thereafter. The sink uses it to rename fields, coerce types, and enforce
//! required fields before upload.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of semantic column types understood by the ingestion
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Datetime,
    Long,
    Double,
    Boolean,
    String,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Datetime => "datetime",
            SemanticType::Long => "long",
            SemanticType::Double => "double",
            SemanticType::Boolean => "boolean",
            SemanticType::String => "string",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SemanticType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "datetime" => Ok(SemanticType::Datetime),
            "long" => Ok(SemanticType::Long),
            "double" => Ok(SemanticType::Double),
            "boolean" => Ok(SemanticType::Boolean),
            "string" => Ok(SemanticType::String),
            _ => Err(format!("unsupported data type: {}", s)),
        }
    }
}

/// Destination table schema for one log type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Remote table name (e.g. `Custom_Firewall_CL`).
    pub name: String,
    pub schema_version: String,
    pub required_fields: BTreeSet<String>,
    /// Source-field → destination-field renames applied before validation.
    #[serde(default)]
    pub transform_map: BTreeMap<String, String>,
    /// Destination-field → semantic type coercions.
    #[serde(default)]
    pub type_map: BTreeMap<String, SemanticType>,
    pub retention_days: u32,
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_compression")]
    pub compression: bool,
}

fn default_max_batch_records() -> usize {
    1000
}

// Logs Ingestion API caps a single call at roughly 1 MB.
fn default_max_batch_bytes() -> usize {
    1_000_000
}

fn default_compression() -> bool {
    true
}

impl TableConfig {
    /// Built-in firewall table, used as the default when no table section is
    /// configured.
    pub fn firewall_default() -> Self {
        TableConfig {
            name: "Custom_Firewall_CL".to_string(),
            schema_version: "1.0".to_string(),
            required_fields: ["TimeGenerated", "SourceIP", "DestinationIP", "FirewallAction"]
                .into_iter()
                .map(String::from)
                .collect(),
            transform_map: [
                ("src_ip", "SourceIP"),
                ("dst_ip", "DestinationIP"),
                ("action", "FirewallAction"),
            ]
            .into_iter()
            .map(|(s, d)| (s.to_string(), d.to_string()))
            .collect(),
            type_map: [
                ("TimeGenerated", SemanticType::Datetime),
                ("SourceIP", SemanticType::String),
                ("DestinationIP", SemanticType::String),
                ("BytesTransferred", SemanticType::Long),
            ]
            .into_iter()
            .map(|(f, t)| (f.to_string(), t))
            .collect(),
            retention_days: 90,
            max_batch_records: 1000,
            max_batch_bytes: default_max_batch_bytes(),
            compression: true,
        }
    }

    /// Built-in VPN session table.
    pub fn vpn_default() -> Self {
        TableConfig {
            name: "Custom_VPN_CL".to_string(),
            schema_version: "2.1".to_string(),
            required_fields: ["TimeGenerated", "UserPrincipalName", "SessionID"]
                .into_iter()
                .map(String::from)
                .collect(),
            transform_map: [
                ("user", "UserPrincipalName"),
                ("session", "SessionID"),
                ("ip_address", "ClientIP"),
            ]
            .into_iter()
            .map(|(s, d)| (s.to_string(), d.to_string()))
            .collect(),
            type_map: [
                ("TimeGenerated", SemanticType::Datetime),
                ("SessionID", SemanticType::String),
                ("BytesIn", SemanticType::Long),
                ("BytesOut", SemanticType::Long),
            ]
            .into_iter()
            .map(|(f, t)| (f.to_string(), t))
            .collect(),
            retention_days: 30,
            max_batch_records: 1000,
            max_batch_bytes: default_max_batch_bytes(),
            compression: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_type_roundtrip() {
        for ty in [
            SemanticType::Datetime,
            SemanticType::Long,
            SemanticType::Double,
            SemanticType::Boolean,
            SemanticType::String,
        ] {
            assert_eq!(SemanticType::from_str(ty.as_str()).unwrap(), ty);
        }
        assert!(SemanticType::from_str("varchar").is_err());
    }

    #[test]
    fn firewall_default_covers_required_fields() {
        let table = TableConfig::firewall_default();
        assert_eq!(table.name, "Custom_Firewall_CL");
        assert!(table.required_fields.contains("TimeGenerated"));
        assert!(table.required_fields.contains("FirewallAction"));
        assert_eq!(
            table.transform_map.get("src_ip").map(String::as_str),
            Some("SourceIP")
        );
    }

    #[test]
    fn table_config_deserializes_from_toml_style_json() {
        let json = serde_json::json!({
            "name": "Custom_Dns_CL",
            "schema_version": "1.0",
            "required_fields": ["TimeGenerated", "QueryName"],
            "type_map": {"TimeGenerated": "datetime", "Latency": "double"},
            "retention_days": 14
        });
        let table: TableConfig = serde_json::from_value(json).unwrap();
        assert_eq!(table.max_batch_records, 1000);
        assert!(table.compression);
        assert_eq!(
            table.type_map.get("Latency").copied(),
            Some(SemanticType::Double)
        );
    }
}
