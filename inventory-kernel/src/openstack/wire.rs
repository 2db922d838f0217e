//! Remote representations, decoded leniently.
//!
//! Every field has a default so a record missing a field, or carrying it
//! with an unexpected JSON type, still maps to something usable.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteProject {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "or_default")]
    pub name: String,
    #[serde(deserialize_with = "or_default")]
    pub enabled: bool,
    #[serde(deserialize_with = "or_default")]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteImage {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "or_default")]
    pub name: String,
    #[serde(deserialize_with = "or_default")]
    pub status: String,
    #[serde(deserialize_with = "or_default")]
    pub created: String,
    #[serde(deserialize_with = "or_default")]
    pub updated: String,
    #[serde(deserialize_with = "or_default")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteFlavor {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "or_default")]
    pub name: String,
    #[serde(deserialize_with = "int")]
    pub ram: i64,
    #[serde(deserialize_with = "int")]
    pub vcpus: i64,
    #[serde(deserialize_with = "int")]
    pub disk: i64,
    /// Reported as `""` when the flavor has no swap.
    #[serde(deserialize_with = "int")]
    pub swap: i64,
    #[serde(deserialize_with = "float")]
    pub rxtx_factor: f64,
    #[serde(rename = "os-flavor-access:is_public", deserialize_with = "or_default")]
    pub is_public: bool,
    #[serde(rename = "OS-FLV-EXT-DATA:ephemeral", deserialize_with = "int")]
    pub ephemeral: i64,
}

impl Default for RemoteFlavor {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            ram: 0,
            vcpus: 0,
            disk: 0,
            swap: 0,
            rxtx_factor: 1.0,
            is_public: true,
            ephemeral: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteAggregate {
    #[serde(deserialize_with = "int")]
    pub id: i64,
    #[serde(deserialize_with = "or_default")]
    pub name: String,
    #[serde(deserialize_with = "or_default")]
    pub availability_zone: String,
    #[serde(deserialize_with = "or_default")]
    pub hosts: Vec<String>,
    #[serde(deserialize_with = "string_map")]
    pub metadata: HashMap<String, String>,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(deserialize_with = "timestamp")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(deserialize_with = "or_default")]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteHypervisor {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "or_default")]
    pub hypervisor_hostname: String,
    #[serde(deserialize_with = "or_default")]
    pub status: String,
    #[serde(deserialize_with = "or_default")]
    pub state: String,
    #[serde(deserialize_with = "or_default")]
    pub host_ip: String,
    #[serde(deserialize_with = "int")]
    pub vcpus: i64,
    #[serde(deserialize_with = "int")]
    pub vcpus_used: i64,
    #[serde(deserialize_with = "int")]
    pub free_disk_gb: i64,
    #[serde(deserialize_with = "int")]
    pub local_gb: i64,
    #[serde(deserialize_with = "int")]
    pub free_ram_mb: i64,
    #[serde(deserialize_with = "int")]
    pub memory_mb: i64,
    #[serde(deserialize_with = "int")]
    pub running_vms: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityGroupRef {
    #[serde(deserialize_with = "or_default")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteServer {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "or_default")]
    pub name: String,
    #[serde(deserialize_with = "or_default")]
    pub status: String,
    #[serde(rename = "hostId", deserialize_with = "or_default")]
    pub host_id: String,
    #[serde(deserialize_with = "or_default")]
    pub tenant_id: String,
    /// `{"id": ...}`, or `""` for servers booted from a volume.
    pub image: Value,
    pub flavor: Value,
    #[serde(deserialize_with = "or_default")]
    pub addresses: Map<String, Value>,
    #[serde(deserialize_with = "string_map")]
    pub metadata: HashMap<String, String>,
    #[serde(deserialize_with = "or_default")]
    pub security_groups: Vec<SecurityGroupRef>,
    #[serde(deserialize_with = "timestamp")]
    pub created: Option<OffsetDateTime>,
    #[serde(deserialize_with = "timestamp")]
    pub updated: Option<OffsetDateTime>,
}

impl RemoteServer {
    pub fn image_id(&self) -> String {
        nested_id(&self.image)
    }

    pub fn flavor_id(&self) -> String {
        nested_id(&self.flavor)
    }
}

fn nested_id(value: &Value) -> String {
    match value.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Parses RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(ts);
    }
    let naive = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    PrimitiveDateTime::parse(raw, &naive)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + serde::de::DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn float<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

fn string_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<String, String>, D::Error> {
    let Value::Object(map) = Value::deserialize(deserializer)? else {
        return Ok(HashMap::new());
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

fn timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<OffsetDateTime>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => parse_timestamp(&s),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flavor_empty_swap_and_extension_fields() {
        let flavor: RemoteFlavor = serde_json::from_value(json!({
            "id": "m1.small",
            "name": "m1.small",
            "ram": 2048,
            "vcpus": 1,
            "disk": 20,
            "swap": "",
            "rxtx_factor": 1.0,
            "os-flavor-access:is_public": false,
            "OS-FLV-EXT-DATA:ephemeral": 10
        }))
        .unwrap();
        assert_eq!(flavor.swap, 0);
        assert!(!flavor.is_public);
        assert_eq!(flavor.ephemeral, 10);
    }

    #[test]
    fn test_numeric_ids_become_strings() {
        let hv: RemoteHypervisor = serde_json::from_value(json!({
            "id": 42, "hypervisor_hostname": "cmp-1.dc", "memory_mb": 4096
        }))
        .unwrap();
        assert_eq!(hv.id, "42");
        assert_eq!(hv.memory_mb, 4096);
        assert_eq!(hv.free_ram_mb, 0);
    }

    #[test]
    fn test_server_volume_boot_and_nulls() {
        let server: RemoteServer = serde_json::from_value(json!({
            "id": "a1",
            "name": "web-1",
            "hostId": null,
            "image": "",
            "flavor": {"id": "3"},
            "metadata": {"cluster": "web", "weight": 3},
            "security_groups": [{"name": "default"}],
            "created": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(server.image_id(), "");
        assert_eq!(server.flavor_id(), "3");
        assert_eq!(server.host_id, "");
        assert_eq!(server.metadata["weight"], "3");
        assert_eq!(server.security_groups[0].name, "default");
        assert!(server.created.is_some());
        assert!(server.updated.is_none());
    }

    #[test]
    fn test_aggregate_naive_timestamp_is_utc() {
        let agg: RemoteAggregate = serde_json::from_value(json!({
            "id": 7,
            "name": "ssd",
            "availability_zone": null,
            "hosts": ["cmp-1"],
            "metadata": {"ssd": "true"},
            "created_at": "2024-05-01T10:20:30.000000",
            "deleted": false
        }))
        .unwrap();
        let created = agg.created_at.unwrap();
        assert_eq!(created.offset(), time::UtcOffset::UTC);
        assert_eq!(created.hour(), 10);
        assert_eq!(agg.availability_zone, "");
    }

    #[test]
    fn test_parse_timestamp_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
