//! Read side of the inventory, scoped to one deployment.
//!
//! List queries never fail: a store read error is logged and answered with
//! an empty result. Single-record lookups tell "not found" apart from
//! storage failures. Hypervisor hashes stay internal: the two-hop join from
//! a hypervisor to its instances is resolved here and only names come out.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error};

use crate::models::{
    Aggregate, Flavor, Hypervisor, HypervisorHash, Image, Instance, Project, Snapshot,
    SnapshotView,
};
use crate::store::{Bucket, Record, Store, StoreError};

/// Metadata key grouping instances into clusters.
pub const CLUSTER_KEY: &str = "cluster";

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryError::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentSummary {
    pub deployment: String,
    pub images: usize,
    pub flavors: usize,
    pub projects: usize,
    pub instances: usize,
    pub hypervisors: usize,
}

pub struct Inventory {
    bucket: Bucket,
}

impl Inventory {
    pub fn new(store: &Store, deployment: &str) -> Self {
        Self {
            bucket: store.bucket(deployment),
        }
    }

    pub fn deployment(&self) -> &str {
        self.bucket.namespace()
    }

    pub fn projects(&self) -> Vec<Project> {
        self.list()
    }

    pub fn images(&self) -> Vec<Image> {
        self.list()
    }

    pub fn flavors(&self) -> Vec<Flavor> {
        self.list()
    }

    pub fn aggregates(&self) -> Vec<Aggregate> {
        self.list()
    }

    /// Every hypervisor with `vms` filled in.
    pub fn hypervisors(&self) -> Vec<Hypervisor> {
        self.list::<Hypervisor>()
            .into_iter()
            .map(|h| self.with_vms(h))
            .collect()
    }

    /// Hypervisors no known instance runs on.
    pub fn empty_hypervisors(&self) -> Vec<Hypervisor> {
        self.list::<Hypervisor>()
            .into_iter()
            .filter(|h| self.hypervisor_instances(&h.hostname).is_empty())
            .collect()
    }

    /// All instances, or those whose name contains `filter` (case-sensitive).
    pub fn instances(&self, filter: Option<&str>) -> Vec<Instance> {
        let instances = self.list::<Instance>();
        match filter.filter(|f| !f.is_empty()) {
            Some(pattern) => instances
                .into_iter()
                .filter(|i| i.name.contains(pattern))
                .collect(),
            None => instances,
        }
    }

    pub fn project(&self, name: &str) -> Result<Project, QueryError> {
        self.by_index("name", name, "project")
    }

    pub fn project_by_id(&self, id: &str) -> Result<Project, QueryError> {
        self.by_key(id, "project")
    }

    pub fn project_exists(&self, name: &str) -> bool {
        self.project(name).is_ok()
    }

    pub fn image(&self, name: &str) -> Result<Image, QueryError> {
        self.by_index("name", name, "image")
    }

    pub fn image_by_id(&self, id: &str) -> Result<Image, QueryError> {
        self.by_key(id, "image")
    }

    pub fn flavor(&self, name: &str) -> Result<Flavor, QueryError> {
        self.by_index("name", name, "flavor")
    }

    pub fn flavor_by_id(&self, id: &str) -> Result<Flavor, QueryError> {
        self.by_key(id, "flavor")
    }

    pub fn aggregate(&self, name: &str) -> Result<Aggregate, QueryError> {
        self.by_index("name", name, "aggregate")
    }

    pub fn aggregate_by_id(&self, id: i64) -> Result<Aggregate, QueryError> {
        self.by_key(&id.to_string(), "aggregate")
    }

    pub fn instance(&self, name: &str) -> Result<Instance, QueryError> {
        self.by_index("name", name, "instance")
    }

    pub fn instance_by_id(&self, id: &str) -> Result<Instance, QueryError> {
        self.by_key(id, "instance")
    }

    pub fn hypervisor(&self, hostname: &str) -> Result<Hypervisor, QueryError> {
        self.by_index("hostname", hostname, "hypervisor")
            .map(|h| self.with_vms(h))
    }

    pub fn hypervisor_by_id(&self, id: &str) -> Result<Hypervisor, QueryError> {
        self.by_key(id, "hypervisor").map(|h| self.with_vms(h))
    }

    /// Instances of the project called `name`; empty when the project is
    /// unknown, see [`Inventory::project_exists`].
    pub fn instances_by_project(&self, name: &str) -> Vec<Instance> {
        let project = match self.project(name) {
            Ok(project) => project,
            Err(QueryError::NotFound(_)) => return Vec::new(),
            Err(e) => {
                error!(deployment = %self.deployment(), project = name, error = %e, "project lookup failed");
                return Vec::new();
            }
        };
        self.find::<Instance>("project_id", &project.id)
    }

    /// hostname -> hash rows -> instances carrying one of those host ids.
    pub fn hypervisor_instances(&self, hostname: &str) -> Vec<Instance> {
        let mut seen = HashSet::new();
        self.find::<HypervisorHash>("hostname", hostname)
            .into_iter()
            .flat_map(|hash| self.find::<Instance>("host_id", &hash.hash))
            .filter(|instance| seen.insert(instance.id.clone()))
            .collect()
    }

    /// `{instance name: fixed IPv4}` of one cluster.
    pub fn cluster_members(&self, cluster: &str) -> BTreeMap<String, String> {
        self.list::<Instance>()
            .into_iter()
            .filter(|i| i.metadata.get(CLUSTER_KEY).map(String::as_str) == Some(cluster))
            .map(|i| (i.name, i.fixed_ipv4))
            .collect()
    }

    /// `{cluster: instance count}`. Instances without the key are left out.
    pub fn cluster_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for instance in self.list::<Instance>() {
            if let Some(cluster) = instance.metadata.get(CLUSTER_KEY) {
                *counts.entry(cluster.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// `{YYYY-MM-DD: usage}`.
    pub fn snapshots(&self) -> BTreeMap<String, SnapshotView> {
        self.list::<Snapshot>()
            .into_iter()
            .map(|s| (s.id.clone(), s.public()))
            .collect()
    }

    pub fn summary(&self) -> DeploymentSummary {
        DeploymentSummary {
            deployment: self.deployment().to_string(),
            images: self.list::<Image>().len(),
            flavors: self.list::<Flavor>().len(),
            projects: self.list::<Project>().len(),
            instances: self.list::<Instance>().len(),
            hypervisors: self.list::<Hypervisor>().len(),
        }
    }

    fn with_vms(&self, mut hypervisor: Hypervisor) -> Hypervisor {
        hypervisor.vms = self
            .hypervisor_instances(&hypervisor.hostname)
            .into_iter()
            .map(|i| i.name)
            .collect();
        hypervisor
    }

    fn list<T: Record>(&self) -> Vec<T> {
        debug!(deployment = %self.deployment(), kind = T::KIND, "listing");
        self.bucket.all().unwrap_or_else(|e| {
            error!(deployment = %self.deployment(), kind = T::KIND, error = %e, "read failed");
            Vec::new()
        })
    }

    fn find<T: Record>(&self, field: &str, value: &str) -> Vec<T> {
        self.bucket.find(field, value).unwrap_or_else(|e| {
            error!(deployment = %self.deployment(), kind = T::KIND, field, error = %e, "index lookup failed");
            Vec::new()
        })
    }

    fn by_index<T: Record>(&self, field: &str, value: &str, what: &str) -> Result<T, QueryError> {
        self.bucket.one(field, value).map_err(|e| lookup_error(e, what, value))
    }

    fn by_key<T: Record>(&self, pk: &str, what: &str) -> Result<T, QueryError> {
        self.bucket.get(pk).map_err(|e| lookup_error(e, what, pk))
    }
}

fn lookup_error(e: StoreError, what: &str, key: &str) -> QueryError {
    match e {
        StoreError::NotFound => QueryError::NotFound(format!("{what} {key}")),
        other => QueryError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::host_id_hash;
    use std::collections::HashMap;
    use time::macros::datetime;

    fn instance(id: &str, name: &str, project: &str, host_id: &str, cluster: Option<&str>) -> Instance {
        let mut metadata = HashMap::new();
        if let Some(c) = cluster {
            metadata.insert(CLUSTER_KEY.to_string(), c.to_string());
        }
        Instance {
            id: id.into(),
            name: name.into(),
            status: "ACTIVE".into(),
            image_id: String::new(),
            flavor_id: String::new(),
            host_id: host_id.into(),
            hypervisor: String::new(),
            project_id: project.into(),
            fixed_ipv4: format!("10.0.0.{id}"),
            floating_ipv4: String::new(),
            fixed_ipv6: String::new(),
            floating_ipv6: String::new(),
            metadata,
            security_groups: Vec::new(),
            created: None,
            updated: None,
            poll_time: datetime!(2024-05-01 00:00 UTC),
        }
    }

    fn temp_inventory() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("q.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_filter_and_clusters() {
        let (_dir, store) = temp_inventory();
        store
            .bucket("lab")
            .upsert_all(&[
                instance("1", "web-1", "p1", "", Some("web")),
                instance("2", "web-2", "p1", "", Some("web")),
                instance("3", "db-1", "p2", "", Some("db")),
                instance("4", "Web-3", "p2", "", None),
            ])
            .unwrap();
        let inv = Inventory::new(&store, "lab");

        assert_eq!(inv.instances(None).len(), 4);
        assert_eq!(inv.instances(Some("")).len(), 4);
        assert_eq!(inv.instances(Some("web")).len(), 2);

        let counts = inv.cluster_counts();
        assert_eq!(counts.get("web"), Some(&2));
        assert_eq!(counts.get("db"), Some(&1));
        assert_eq!(counts.len(), 2);

        let members = inv.cluster_members("web");
        assert_eq!(members.get("web-1").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(members.len(), 2);
        assert!(inv.cluster_members("nope").is_empty());
    }

    #[test]
    fn test_hypervisor_instances_union_and_dedup() {
        let (_dir, store) = temp_inventory();
        let bucket = store.bucket("lab");
        let h1 = host_id_hash("p1", "cmp-1");
        let h2 = host_id_hash("p2", "cmp-1");
        bucket
            .upsert_all(&[HypervisorHash::new("p1", "cmp-1"), HypervisorHash::new("p2", "cmp-1")])
            .unwrap();
        bucket
            .upsert_all(&[
                instance("1", "a", "p1", &h1, None),
                instance("2", "b", "p2", &h2, None),
                instance("3", "c", "p3", "other", None),
            ])
            .unwrap();

        let inv = Inventory::new(&store, "lab");
        let mut names: Vec<String> = inv
            .hypervisor_instances("cmp-1")
            .into_iter()
            .map(|i| i.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert!(inv.hypervisor_instances("cmp-9").is_empty());
    }

    #[test]
    fn test_lookups_distinguish_not_found() {
        let (_dir, store) = temp_inventory();
        let inv = Inventory::new(&store, "lab");
        let err = inv.image("missing").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "image missing not found");
        assert!(!inv.project_exists("admin"));
        assert!(inv.instances_by_project("admin").is_empty());
        assert!(inv.snapshots().is_empty());
        assert_eq!(inv.summary().instances, 0);
    }
}
