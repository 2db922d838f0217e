/**
 * RECONCILIATION ENGINE - keeps each deployment's bucket equal to the remote
 *
 * ROLE:
 * One pass per resource kind: the remote listing is authoritative, the
 * local bucket is overwritten with it and anything the listing no longer
 * contains is removed.
 *
 * HOW IT WORKS (every kind):
 * 1. read the local set (read error -> logged, treated as empty)
 * 2. connect to the owning service (unavailable -> skip, cache untouched)
 * 3. fetch the complete remote collection (error -> skip)
 * 4. map to the local schema, upsert everything
 * 5. delete local records whose key is absent from the listing
 *
 * KIND SPECIFICS:
 * - images: `used_by` from the instances stored at that moment
 * - hypervisors: hash rows regenerated for every (project, hypervisor)
 * - aggregates: records flagged `deleted` are left out, hence swept
 * - instances: hypervisor resolved through the hash rows at write time
 *
 * Also hosts namespace cleanup and the daily usage snapshot.
 */

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::addresses::{normalize, primary_nic};
use crate::models::{
    short_hostname, Aggregate, Flavor, Hypervisor, HypervisorHash, Image, Instance, Project,
    Snapshot,
};
use crate::openstack::{Connection, RemoteError, RemoteInventory, Service};
use crate::store::{Bucket, Record, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Projects,
    Images,
    Flavors,
    Aggregates,
    Hypervisors,
    Instances,
}

impl ResourceKind {
    /// Order of a full deployment update: hash rows need projects and
    /// hypervisors, image usage needs instances.
    pub const UPDATE_ORDER: [ResourceKind; 6] = [
        ResourceKind::Projects,
        ResourceKind::Hypervisors,
        ResourceKind::Instances,
        ResourceKind::Images,
        ResourceKind::Flavors,
        ResourceKind::Aggregates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Projects => "projects",
            ResourceKind::Images => "images",
            ResourceKind::Flavors => "flavors",
            ResourceKind::Aggregates => "aggregates",
            ResourceKind::Hypervisors => "hypervisors",
            ResourceKind::Instances => "instances",
        }
    }

    pub fn service(&self) -> Service {
        match self {
            ResourceKind::Projects => Service::Identity,
            _ => Service::Compute,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PassOutcome {
    Applied { upserted: usize, deleted: usize },
    Skipped { reason: String },
}

impl PassOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        PassOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, PassOutcome::Applied { .. })
    }
}

pub struct Reconciler<R> {
    store: Store,
    remote: Arc<R>,
    clock: fn() -> OffsetDateTime,
}

impl<R> Clone for Reconciler<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: self.remote.clone(),
            clock: self.clock,
        }
    }
}

impl<R: RemoteInventory> Reconciler<R> {
    pub fn new(store: Store, remote: Arc<R>) -> Self {
        Self {
            store,
            remote,
            clock: OffsetDateTime::now_utc,
        }
    }

    /// Replaces the wall clock used for poll times and snapshot dates.
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Runs one pass for `kind`, with logging and timing.
    pub async fn reconcile(&self, deployment: &str, kind: ResourceKind) -> PassOutcome {
        info!(deployment, task = %kind, "reconciliation started");
        let started = Instant::now();

        let outcome = match kind {
            ResourceKind::Projects => self.update_projects(deployment).await,
            ResourceKind::Images => self.update_images(deployment).await,
            ResourceKind::Flavors => self.update_flavors(deployment).await,
            ResourceKind::Aggregates => self.update_aggregates(deployment).await,
            ResourceKind::Hypervisors => self.update_hypervisors(deployment).await,
            ResourceKind::Instances => self.update_instances(deployment).await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            PassOutcome::Applied { upserted, deleted } => debug!(
                deployment,
                task = %kind,
                upserted,
                deleted,
                elapsed_ms,
                "reconciliation done"
            ),
            PassOutcome::Skipped { reason } => {
                debug!(deployment, task = %kind, reason = %reason, elapsed_ms, "reconciliation skipped")
            }
        }
        outcome
    }

    pub async fn update_projects(&self, deployment: &str) -> PassOutcome {
        let kind = ResourceKind::Projects;
        let bucket = self.store.bucket(deployment);
        let local = read_local::<Project>(&bucket);
        let conn = match self.connect(deployment, kind).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let remote = match self.remote.list_projects(&conn).await {
            Ok(items) => items,
            Err(e) => return listing_failed(deployment, kind, e),
        };

        let now = (self.clock)();
        let fresh: Vec<Project> = remote
            .into_iter()
            .map(|p| Project {
                id: p.id,
                name: p.name,
                enabled: p.enabled,
                description: p.description,
                poll_time: now,
            })
            .collect();
        apply(&bucket, kind, local, fresh).await
    }

    pub async fn update_images(&self, deployment: &str) -> PassOutcome {
        let kind = ResourceKind::Images;
        let bucket = self.store.bucket(deployment);
        let local = read_local::<Image>(&bucket);
        let conn = match self.connect(deployment, kind).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let remote = match self.remote.list_images(&conn).await {
            Ok(items) => items,
            Err(e) => return listing_failed(deployment, kind, e),
        };

        let mut used_by: HashMap<String, Vec<String>> = HashMap::new();
        for instance in read_local::<Instance>(&bucket) {
            if !instance.image_id.is_empty() {
                used_by.entry(instance.image_id).or_default().push(instance.name);
            }
        }

        let now = (self.clock)();
        let fresh: Vec<Image> = remote
            .into_iter()
            .map(|i| Image {
                used_by: used_by.get(&i.id).cloned().unwrap_or_default(),
                id: i.id,
                name: i.name,
                status: i.status,
                created: i.created,
                updated: i.updated,
                metadata: i.metadata,
                poll_time: now,
            })
            .collect();
        apply(&bucket, kind, local, fresh).await
    }

    pub async fn update_flavors(&self, deployment: &str) -> PassOutcome {
        let kind = ResourceKind::Flavors;
        let bucket = self.store.bucket(deployment);
        let local = read_local::<Flavor>(&bucket);
        let conn = match self.connect(deployment, kind).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let remote = match self.remote.list_flavors(&conn).await {
            Ok(items) => items,
            Err(e) => return listing_failed(deployment, kind, e),
        };

        let now = (self.clock)();
        let fresh: Vec<Flavor> = remote
            .into_iter()
            .map(|f| Flavor {
                id: f.id,
                name: f.name,
                ram: f.ram,
                vcpus: f.vcpus,
                disk: f.disk,
                swap: f.swap,
                rxtx_factor: f.rxtx_factor,
                is_public: f.is_public,
                ephemeral: f.ephemeral,
                poll_time: now,
            })
            .collect();
        apply(&bucket, kind, local, fresh).await
    }

    pub async fn update_aggregates(&self, deployment: &str) -> PassOutcome {
        let kind = ResourceKind::Aggregates;
        let bucket = self.store.bucket(deployment);
        let local = read_local::<Aggregate>(&bucket);
        let conn = match self.connect(deployment, kind).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let remote = match self.remote.list_aggregates(&conn).await {
            Ok(items) => items,
            Err(e) => return listing_failed(deployment, kind, e),
        };

        let now = (self.clock)();
        let fresh: Vec<Aggregate> = remote
            .into_iter()
            .filter(|a| !a.deleted)
            .map(|a| Aggregate {
                id: a.id,
                name: a.name,
                availability_zone: a.availability_zone,
                hosts: a.hosts,
                metadata: a.metadata,
                created: a.created_at,
                updated: a.updated_at,
                poll_time: now,
            })
            .collect();
        apply(&bucket, kind, local, fresh).await
    }

    pub async fn update_hypervisors(&self, deployment: &str) -> PassOutcome {
        let kind = ResourceKind::Hypervisors;
        let bucket = self.store.bucket(deployment);
        let local = read_local::<Hypervisor>(&bucket);
        let conn = match self.connect(deployment, kind).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let remote = match self.remote.list_hypervisors(&conn).await {
            Ok(items) => items,
            Err(e) => return listing_failed(deployment, kind, e),
        };

        let now = (self.clock)();
        let fresh: Vec<Hypervisor> = remote
            .into_iter()
            .map(|h| Hypervisor {
                id: h.id,
                hostname: short_hostname(&h.hypervisor_hostname).to_string(),
                fqdn: h.hypervisor_hostname,
                status: h.status,
                state: h.state,
                host_ip: h.host_ip,
                vcpus: h.vcpus,
                vcpus_used: h.vcpus_used,
                free_disk_gb: h.free_disk_gb,
                total_disk_gb: h.local_gb,
                free_ram_mb: h.free_ram_mb,
                total_ram_mb: h.memory_mb,
                running_vms: h.running_vms,
                vms: Vec::new(),
                poll_time: now,
            })
            .collect();

        let hashes: Vec<HypervisorHash> = read_local::<Project>(&bucket)
            .iter()
            .flat_map(|project| {
                fresh
                    .iter()
                    .map(move |h| HypervisorHash::new(&project.id, &h.hostname))
            })
            .collect();

        let outcome = apply(&bucket, kind, local, fresh).await;
        let count = hashes.len();
        let writer = bucket.clone();
        match tokio::task::spawn_blocking(move || writer.upsert_all(&hashes)).await {
            Ok(Ok(())) => debug!(deployment, count, "hypervisor hashes regenerated"),
            Ok(Err(e)) => error!(deployment, error = %e, "unable to store hypervisor hashes"),
            Err(e) => error!(deployment, error = %e, "hypervisor hash writer failed"),
        }
        outcome
    }

    pub async fn update_instances(&self, deployment: &str) -> PassOutcome {
        let kind = ResourceKind::Instances;
        let bucket = self.store.bucket(deployment);
        let local = read_local::<Instance>(&bucket);
        let conn = match self.connect(deployment, kind).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };
        let remote = match self.remote.list_servers(&conn).await {
            Ok(items) => items,
            Err(e) => return listing_failed(deployment, kind, e),
        };

        let now = (self.clock)();
        let fresh: Vec<Instance> = remote
            .into_iter()
            .map(|s| {
                let networks = normalize(&s.addresses);
                let nic = primary_nic(&networks).cloned().unwrap_or_default();
                let hypervisor = resolve_hypervisor(&bucket, &s.host_id, &s.name);
                Instance {
                    image_id: s.image_id(),
                    flavor_id: s.flavor_id(),
                    id: s.id,
                    name: s.name,
                    status: s.status,
                    host_id: s.host_id,
                    hypervisor,
                    project_id: s.tenant_id,
                    fixed_ipv4: nic.fixed_v4.unwrap_or_default(),
                    floating_ipv4: nic.floating_v4.unwrap_or_default(),
                    fixed_ipv6: nic.fixed_v6.unwrap_or_default(),
                    floating_ipv6: nic.floating_v6.unwrap_or_default(),
                    metadata: s.metadata,
                    security_groups: s.security_groups.into_iter().map(|g| g.name).collect(),
                    created: s.created,
                    updated: s.updated,
                    poll_time: now,
                }
            })
            .collect();
        apply(&bucket, kind, local, fresh).await
    }

    /// Computes and stores today's usage snapshot for one deployment.
    pub fn usage_snapshot(&self, deployment: &str) -> Result<Snapshot, StoreError> {
        info!(deployment, task = "snapshot", "updating usage snapshot");
        let bucket = self.store.bucket(deployment);
        let snapshot = compute_snapshot(
            snapshot_id((self.clock)()),
            read_local::<Flavor>(&bucket).len(),
            read_local::<Image>(&bucket).len(),
            read_local::<Instance>(&bucket).len(),
            read_local::<Project>(&bucket).len(),
            &read_local::<Hypervisor>(&bucket),
        );
        bucket.upsert(&snapshot)?;
        Ok(snapshot)
    }

    /// Drops every namespace that is not a configured deployment.
    pub fn cleanup_namespaces(&self, configured: &[String]) -> Vec<String> {
        cleanup_namespaces(&self.store, configured)
    }

    async fn connect(&self, deployment: &str, kind: ResourceKind) -> Result<Connection, PassOutcome> {
        match self.remote.connect(deployment, kind.service()).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                error!(deployment, task = %kind, error = %e, "unable to connect, keeping cached data");
                Err(PassOutcome::skipped(e.to_string()))
            }
        }
    }
}

pub fn cleanup_namespaces(store: &Store, configured: &[String]) -> Vec<String> {
    let namespaces = match store.namespaces() {
        Ok(namespaces) => namespaces,
        Err(e) => {
            error!(error = %e, "unable to list namespaces");
            return Vec::new();
        }
    };

    let mut dropped = Vec::new();
    for namespace in namespaces {
        if configured.iter().any(|d| *d == namespace) {
            continue;
        }
        match store.drop_namespace(&namespace) {
            Ok(tables) => {
                info!(deployment = %namespace, tables, "dropped unregistered deployment");
                dropped.push(namespace);
            }
            Err(e) => error!(deployment = %namespace, error = %e, "unable to drop namespace"),
        }
    }
    dropped
}

/// Capacity only counts hypervisors that are enabled and up.
pub fn compute_snapshot(
    id: String,
    flavors: usize,
    images: usize,
    instances: usize,
    projects: usize,
    hypervisors: &[Hypervisor],
) -> Snapshot {
    let counted = hypervisors.iter().filter(|h| h.in_service());
    let (vcpus, vcpus_used, memory_mb, free_memory_mb) =
        counted.fold((0, 0, 0, 0), |(vc, vu, mem, free), h| {
            (vc + h.vcpus, vu + h.vcpus_used, mem + h.total_ram_mb, free + h.free_ram_mb)
        });

    Snapshot {
        id,
        flavors,
        hypervisors: hypervisors.len(),
        images,
        instances,
        projects,
        vcpus,
        vcpus_used,
        memory_mb,
        memory_used_mb: memory_mb - free_memory_mb,
    }
}

/// `YYYY-MM-DD` of the UTC calendar date.
pub fn snapshot_id(now: OffsetDateTime) -> String {
    let date = now.to_offset(time::UtcOffset::UTC).date();
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

fn read_local<T: Record>(bucket: &Bucket) -> Vec<T> {
    bucket.all().unwrap_or_else(|e| {
        error!(deployment = %bucket.namespace(), kind = T::KIND, error = %e, "unable to read local records");
        Vec::new()
    })
}

fn listing_failed(deployment: &str, kind: ResourceKind, e: RemoteError) -> PassOutcome {
    error!(deployment, task = %kind, error = %e, "listing failed, keeping cached data");
    PassOutcome::skipped(e.to_string())
}

fn resolve_hypervisor(bucket: &Bucket, host_id: &str, instance: &str) -> String {
    if host_id.is_empty() {
        return String::new();
    }
    match bucket.get::<HypervisorHash>(host_id) {
        Ok(hash) => hash.hostname,
        Err(StoreError::NotFound) => {
            warn!(deployment = %bucket.namespace(), instance, host_id, "no hypervisor known for host id");
            String::new()
        }
        Err(e) => {
            error!(deployment = %bucket.namespace(), instance, error = %e, "hypervisor lookup failed");
            String::new()
        }
    }
}

/// Runs [`apply_blocking`] on the blocking pool.
async fn apply<T>(bucket: &Bucket, kind: ResourceKind, local: Vec<T>, fresh: Vec<T>) -> PassOutcome
where
    T: Record + Send + 'static,
{
    let writer = bucket.clone();
    match tokio::task::spawn_blocking(move || apply_blocking(&writer, kind, local, fresh)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(deployment = %bucket.namespace(), task = %kind, error = %e, "store writer failed");
            PassOutcome::skipped(e.to_string())
        }
    }
}

/// Upserts `fresh`, deletes what `local` has beyond it. Of several remote
/// records sharing a key, the first one wins.
fn apply_blocking<T: Record>(bucket: &Bucket, kind: ResourceKind, local: Vec<T>, fresh: Vec<T>) -> PassOutcome {
    let deployment = bucket.namespace();
    let (fresh, keyless): (Vec<T>, Vec<T>) =
        fresh.into_iter().partition(|r| !r.primary_key().is_empty());
    if !keyless.is_empty() {
        warn!(deployment, task = %kind, count = keyless.len(), "ignoring remote records without id");
    }

    let mut keep: HashSet<String> = HashSet::with_capacity(fresh.len());
    let total = fresh.len();
    let fresh: Vec<T> = fresh
        .into_iter()
        .filter(|r| keep.insert(r.primary_key()))
        .collect();
    if fresh.len() < total {
        warn!(deployment, task = %kind, count = total - fresh.len(), "ignoring duplicate remote records");
    }

    let stale: Vec<T> = local
        .into_iter()
        .filter(|r| !keep.contains(&r.primary_key()))
        .collect();

    let upserted = match bucket.upsert_all(&fresh) {
        Ok(()) => fresh.len(),
        Err(e) => {
            error!(deployment, task = %kind, error = %e, "unable to store records");
            0
        }
    };
    let deleted = match bucket.delete_all(&stale) {
        Ok(()) => stale.len(),
        Err(e) => {
            error!(deployment, task = %kind, error = %e, "unable to delete stale records");
            0
        }
    };
    PassOutcome::Applied { upserted, deleted }
}
