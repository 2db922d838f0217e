//! Local schema of the mirrored inventory.
//!
//! Every entity lives in a per-deployment bucket and is fully overwritten on
//! each reconciliation pass. `Record` tells the store which field is the
//! primary key and which fields carry a secondary index.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::collections::HashMap;
use time::OffsetDateTime;

use crate::store::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub poll_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: String,
    /// As reported by the compute API, not reparsed.
    pub created: String,
    pub updated: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Names of the instances booted from this image.
    pub used_by: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub poll_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub ram: i64,
    pub vcpus: i64,
    pub disk: i64,
    pub swap: i64,
    pub rxtx_factor: f64,
    pub is_public: bool,
    pub ephemeral: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub poll_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub id: i64,
    pub name: String,
    pub availability_zone: String,
    pub hosts: Vec<String>,
    pub metadata: HashMap<String, String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub poll_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypervisor {
    pub id: String,
    /// Short hostname: the FQDN cut at the first dot.
    pub hostname: String,
    pub fqdn: String,
    pub status: String,
    pub state: String,
    pub host_ip: String,
    pub vcpus: i64,
    pub vcpus_used: i64,
    pub free_disk_gb: i64,
    pub total_disk_gb: i64,
    pub free_ram_mb: i64,
    pub total_ram_mb: i64,
    pub running_vms: i64,
    /// Filled by the query layer, always empty in the store.
    #[serde(default)]
    pub vms: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub poll_time: OffsetDateTime,
}

impl Hypervisor {
    /// Whether this hypervisor counts towards usable capacity.
    pub fn in_service(&self) -> bool {
        self.status == "enabled" && self.state == "up"
    }
}

/// Links the opaque per-(project, host) identifier found on instances back
/// to a hypervisor hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorHash {
    pub hash: String,
    pub hostname: String,
    pub project_id: String,
}

impl HypervisorHash {
    pub fn new(project_id: &str, hostname: &str) -> Self {
        Self {
            hash: host_id_hash(project_id, hostname),
            hostname: hostname.to_string(),
            project_id: project_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image_id: String,
    pub flavor_id: String,
    pub host_id: String,
    /// Resolved through the hash table; empty until the hash is known.
    pub hypervisor: String,
    pub project_id: String,
    pub fixed_ipv4: String,
    pub floating_ipv4: String,
    pub fixed_ipv6: String,
    pub floating_ipv6: String,
    pub metadata: HashMap<String, String>,
    pub security_groups: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub poll_time: OffsetDateTime,
}

/// Daily usage aggregate, keyed by its UTC calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub flavors: usize,
    pub hypervisors: usize,
    pub images: usize,
    pub instances: usize,
    pub projects: usize,
    pub vcpus: i64,
    pub vcpus_used: i64,
    pub memory_mb: i64,
    pub memory_used_mb: i64,
}

/// Public projection of a snapshot: the storage key is not part of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotView {
    pub flavors: usize,
    pub hypervisors: usize,
    pub images: usize,
    pub instances: usize,
    pub projects: usize,
    pub vcpus: i64,
    pub vcpus_used: i64,
    pub memory_mb: i64,
    pub memory_used_mb: i64,
}

impl Snapshot {
    pub fn public(&self) -> SnapshotView {
        SnapshotView {
            flavors: self.flavors,
            hypervisors: self.hypervisors,
            images: self.images,
            instances: self.instances,
            projects: self.projects,
            vcpus: self.vcpus,
            vcpus_used: self.vcpus_used,
            memory_mb: self.memory_mb,
            memory_used_mb: self.memory_used_mb,
        }
    }
}

/// Host identifier as the compute service computes it for `hostId`:
/// hex SHA-224 of the project id immediately followed by the host name.
pub fn host_id_hash(project_id: &str, hostname: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(project_id.as_bytes());
    hasher.update(hostname.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `compute-01.dc1.example.org` -> `compute-01`
pub fn short_hostname(fqdn: &str) -> &str {
    fqdn.split('.').next().unwrap_or(fqdn)
}

impl Record for Project {
    const KIND: &'static str = "projects";
    const INDEXES: &'static [&'static str] = &["name"];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_value(&self, field: &str) -> Option<&str> {
        match field {
            "name" => Some(&self.name),
            _ => None,
        }
    }
}

impl Record for Image {
    const KIND: &'static str = "images";
    const INDEXES: &'static [&'static str] = &["name"];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_value(&self, field: &str) -> Option<&str> {
        match field {
            "name" => Some(&self.name),
            _ => None,
        }
    }
}

impl Record for Flavor {
    const KIND: &'static str = "flavors";
    const INDEXES: &'static [&'static str] = &["name"];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_value(&self, field: &str) -> Option<&str> {
        match field {
            "name" => Some(&self.name),
            _ => None,
        }
    }
}

impl Record for Aggregate {
    const KIND: &'static str = "aggregates";
    const INDEXES: &'static [&'static str] = &["name"];

    fn primary_key(&self) -> String {
        self.id.to_string()
    }

    fn index_value(&self, field: &str) -> Option<&str> {
        match field {
            "name" => Some(&self.name),
            _ => None,
        }
    }
}

impl Record for Hypervisor {
    const KIND: &'static str = "hypervisors";
    const INDEXES: &'static [&'static str] = &["hostname"];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_value(&self, field: &str) -> Option<&str> {
        match field {
            "hostname" => Some(&self.hostname),
            _ => None,
        }
    }
}

impl Record for HypervisorHash {
    const KIND: &'static str = "hypervisor_hashes";
    const INDEXES: &'static [&'static str] = &["hostname"];

    fn primary_key(&self) -> String {
        self.hash.clone()
    }

    fn index_value(&self, field: &str) -> Option<&str> {
        match field {
            "hostname" => Some(&self.hostname),
            _ => None,
        }
    }
}

impl Record for Instance {
    const KIND: &'static str = "instances";
    const INDEXES: &'static [&'static str] = &["name", "host_id", "project_id"];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_value(&self, field: &str) -> Option<&str> {
        match field {
            "name" => Some(&self.name),
            "host_id" => Some(&self.host_id),
            "project_id" => Some(&self.project_id),
            _ => None,
        }
    }
}

impl Record for Snapshot {
    const KIND: &'static str = "snapshots";
    const INDEXES: &'static [&'static str] = &[];

    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn index_value(&self, _field: &str) -> Option<&str> {
        None
    }
}
