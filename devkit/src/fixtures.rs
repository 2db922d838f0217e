/*!
Builders for remote records

Short constructors for the remote representations the fake cloud serves,
with the defaults a real compute API would report.
*/

use crate::fake_cloud::CloudData;
use inventory_kernel::models::host_id_hash;
use inventory_kernel::openstack::wire::{
    RemoteAggregate, RemoteFlavor, RemoteHypervisor, RemoteImage, RemoteProject, RemoteServer,
    SecurityGroupRef,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub fn project(id: &str, name: &str) -> RemoteProject {
    RemoteProject {
        id: id.into(),
        name: name.into(),
        enabled: true,
        description: format!("{name} project"),
    }
}

pub fn image(id: &str, name: &str) -> RemoteImage {
    RemoteImage {
        id: id.into(),
        name: name.into(),
        status: "ACTIVE".into(),
        created: "2024-01-01T00:00:00Z".into(),
        updated: "2024-01-02T00:00:00Z".into(),
        metadata: Map::new(),
    }
}

pub fn flavor(id: &str, name: &str, vcpus: i64, ram: i64) -> RemoteFlavor {
    RemoteFlavor {
        id: id.into(),
        name: name.into(),
        vcpus,
        ram,
        disk: 20,
        ..RemoteFlavor::default()
    }
}

pub fn aggregate(id: i64, name: &str, hosts: &[&str]) -> RemoteAggregate {
    RemoteAggregate {
        id,
        name: name.into(),
        availability_zone: "nova".into(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        metadata: HashMap::new(),
        ..RemoteAggregate::default()
    }
}

/// Enabled, up hypervisor with no load.
pub fn hypervisor(id: &str, fqdn: &str, vcpus: i64, memory_mb: i64) -> RemoteHypervisor {
    RemoteHypervisor {
        id: id.into(),
        hypervisor_hostname: fqdn.into(),
        status: "enabled".into(),
        state: "up".into(),
        host_ip: "192.0.2.10".into(),
        vcpus,
        memory_mb,
        free_ram_mb: memory_mb,
        local_gb: 500,
        free_disk_gb: 500,
        ..RemoteHypervisor::default()
    }
}

/// Address descriptor as listed under a network in a server record.
pub fn address(kind: &str, version: u8, addr: &str, mac: Option<&str>) -> Value {
    let mut descriptor = json!({
        "version": version,
        "addr": addr,
        "OS-EXT-IPS:type": kind,
    });
    if let Some(mac) = mac {
        descriptor["OS-EXT-IPS-MAC:mac_addr"] = json!(mac);
    }
    descriptor
}

/// Fluent builder for server records.
#[derive(Debug, Clone)]
pub struct ServerBuilder {
    server: RemoteServer,
}

pub fn server(id: &str, name: &str) -> ServerBuilder {
    ServerBuilder {
        server: RemoteServer {
            id: id.into(),
            name: name.into(),
            status: "ACTIVE".into(),
            image: Value::String(String::new()),
            flavor: json!({ "id": "1" }),
            security_groups: vec![SecurityGroupRef { name: "default".into() }],
            ..RemoteServer::default()
        },
    }
}

impl ServerBuilder {
    pub fn project(mut self, project_id: &str) -> Self {
        self.server.tenant_id = project_id.into();
        self
    }

    /// Sets `hostId` the way the compute service derives it.
    pub fn on_host(mut self, hostname: &str) -> Self {
        self.server.host_id = host_id_hash(&self.server.tenant_id, hostname);
        self
    }

    pub fn host_id(mut self, host_id: &str) -> Self {
        self.server.host_id = host_id.into();
        self
    }

    pub fn image(mut self, image_id: &str) -> Self {
        self.server.image = json!({ "id": image_id });
        self
    }

    pub fn flavor(mut self, flavor_id: &str) -> Self {
        self.server.flavor = json!({ "id": flavor_id });
        self
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.server.metadata.insert(key.into(), value.into());
        self
    }

    pub fn address(mut self, network: &str, descriptor: Value) -> Self {
        let list = self
            .server
            .addresses
            .entry(network.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = list {
            items.push(descriptor);
        }
        self
    }

    pub fn build(self) -> RemoteServer {
        self.server
    }
}

/// Small but complete deployment: two projects, three hypervisors (one
/// disabled), two images, two flavors, one live and one deleted aggregate,
/// and three servers spread over two clusters.
pub fn sample_deployment() -> CloudData {
    CloudData {
        projects: vec![project("p-ops", "ops"), project("p-web", "web")],
        images: vec![image("img-ubuntu", "ubuntu-22.04"), image("img-debian", "debian-12")],
        flavors: vec![flavor("1", "m1.small", 1, 2048), flavor("2", "m1.large", 4, 8192)],
        aggregates: vec![
            aggregate(1, "az-a", &["compute-01", "compute-02"]),
            RemoteAggregate {
                deleted: true,
                ..aggregate(2, "retired", &[])
            },
        ],
        hypervisors: vec![
            RemoteHypervisor {
                vcpus_used: 3,
                free_ram_mb: 49152,
                running_vms: 2,
                ..hypervisor("h-1", "compute-01.dc1.example.org", 32, 65536)
            },
            RemoteHypervisor {
                vcpus_used: 4,
                free_ram_mb: 24576,
                running_vms: 1,
                ..hypervisor("h-2", "compute-02.dc1.example.org", 16, 32768)
            },
            RemoteHypervisor {
                status: "disabled".into(),
                ..hypervisor("h-3", "compute-03.dc1.example.org", 64, 131072)
            },
        ],
        servers: vec![
            server("i-web-1", "web-1")
                .project("p-web")
                .on_host("compute-01")
                .image("img-ubuntu")
                .flavor("1")
                .metadata("cluster", "web")
                .address("private", address("fixed", 4, "10.0.0.5", Some("fa:16:3e:00:00:01")))
                .address("private", address("floating", 4, "203.0.113.5", Some("fa:16:3e:00:00:01")))
                .address("private", address("fixed", 6, "2001:db8::5", Some("fa:16:3e:00:00:01")))
                .build(),
            server("i-web-2", "web-2")
                .project("p-web")
                .on_host("compute-01")
                .image("img-ubuntu")
                .flavor("1")
                .metadata("cluster", "web")
                .address("private", address("fixed", 4, "10.0.0.6", Some("fa:16:3e:00:00:02")))
                .build(),
            server("i-db-1", "db-1")
                .project("p-ops")
                .on_host("compute-02")
                .image("img-debian")
                .flavor("2")
                .metadata("cluster", "db")
                .address("backend", address("fixed", 4, "10.0.1.7", Some("fa:16:3e:00:00:03")))
                .build(),
        ],
    }
}
