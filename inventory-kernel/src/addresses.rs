//! Address normalization for compute instances.
//!
//! The compute API reports addresses as `network name -> [descriptor]`, where
//! a descriptor is a loosely typed JSON object. Descriptors are decoded into
//! [`AddressDescriptor`] first; anything that fails to decode simply leaves
//! its slot empty. Decoded descriptors are then grouped into NICs by MAC
//! address, keeping network and descriptor order.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Fixed,
    Floating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDescriptor {
    pub kind: AddressKind,
    pub version: IpVersion,
    pub addr: String,
    pub mac: Option<String>,
}

impl AddressDescriptor {
    /// Validating decode of one remote descriptor, e.g.
    /// `{"version": 4, "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed",
    ///   "OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:01"}`.
    ///
    /// Returns `None` when the address, its type or its version is missing
    /// or unrecognised.
    pub fn decode(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;

        let addr = obj.get("addr")?.as_str()?.trim();
        if addr.is_empty() {
            return None;
        }

        let kind = match obj.get("OS-EXT-IPS:type")?.as_str()? {
            "fixed" => AddressKind::Fixed,
            "floating" => AddressKind::Floating,
            _ => return None,
        };

        let version = match obj.get("version")? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        let version = match version {
            4 => IpVersion::V4,
            6 => IpVersion::V6,
            _ => return None,
        };

        let mac = obj
            .get("OS-EXT-IPS-MAC:mac_addr")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        Some(Self {
            kind,
            version,
            addr: addr.to_string(),
            mac,
        })
    }

    fn rendered(&self) -> String {
        match self.version {
            IpVersion::V4 => self.addr.clone(),
            IpVersion::V6 => format!("[{}]", self.addr),
        }
    }
}

/// One network interface as seen through the addresses of one network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nic {
    pub fixed_v4: Option<String>,
    pub fixed_v6: Option<String>,
    pub floating_v4: Option<String>,
    pub floating_v6: Option<String>,
    pub mac: Option<String>,
}

impl Nic {
    fn slot(&mut self, kind: AddressKind, version: IpVersion) -> &mut Option<String> {
        match (kind, version) {
            (AddressKind::Fixed, IpVersion::V4) => &mut self.fixed_v4,
            (AddressKind::Fixed, IpVersion::V6) => &mut self.fixed_v6,
            (AddressKind::Floating, IpVersion::V4) => &mut self.floating_v4,
            (AddressKind::Floating, IpVersion::V6) => &mut self.floating_v6,
        }
    }

    /// First write wins.
    fn fill(&mut self, descriptor: &AddressDescriptor) {
        let slot = self.slot(descriptor.kind, descriptor.version);
        if slot.is_none() {
            *slot = Some(descriptor.rendered());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddresses {
    pub network: String,
    pub nics: Vec<Nic>,
}

/// Groups every network's descriptors into NICs.
///
/// Networks keep the order of the remote object, NICs the order in which
/// their first descriptor appears. Descriptors without a MAC share the
/// MAC-less NIC of their network.
pub fn normalize(addresses: &Map<String, Value>) -> Vec<NetworkAddresses> {
    addresses
        .iter()
        .map(|(network, descriptors)| {
            let mut nics: Vec<Nic> = Vec::new();
            let decoded = descriptors
                .as_array()
                .map(|list| list.iter().filter_map(AddressDescriptor::decode).collect())
                .unwrap_or_else(Vec::new);

            for descriptor in decoded {
                match nics.iter_mut().find(|nic| nic.mac == descriptor.mac) {
                    Some(nic) => nic.fill(&descriptor),
                    None => {
                        let mut nic = Nic {
                            mac: descriptor.mac.clone(),
                            ..Nic::default()
                        };
                        nic.fill(&descriptor);
                        nics.push(nic);
                    }
                }
            }

            NetworkAddresses {
                network: network.clone(),
                nics,
            }
        })
        .collect()
}

/// The NIC whose addresses are copied onto the instance record: first NIC
/// of the first network.
pub fn primary_nic(networks: &[NetworkAddresses]) -> Option<&Nic> {
    networks.first().and_then(|network| network.nics.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addresses(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_version() {
        assert!(AddressDescriptor::decode(&json!({
            "version": 4, "addr": "10.0.0.1", "OS-EXT-IPS:type": "reserved"
        }))
        .is_none());
        assert!(AddressDescriptor::decode(&json!({
            "version": 5, "addr": "10.0.0.1", "OS-EXT-IPS:type": "fixed"
        }))
        .is_none());
        assert!(AddressDescriptor::decode(&json!({
            "version": 4, "OS-EXT-IPS:type": "fixed"
        }))
        .is_none());
        assert!(AddressDescriptor::decode(&json!("10.0.0.1")).is_none());
    }

    #[test]
    fn test_decode_accepts_string_version() {
        let d = AddressDescriptor::decode(&json!({
            "version": "6", "addr": "fd00::1", "OS-EXT-IPS:type": "fixed"
        }))
        .unwrap();
        assert_eq!(d.version, IpVersion::V6);
        assert_eq!(d.mac, None);
    }

    #[test]
    fn test_shared_mac_merges_into_one_nic() {
        let raw = addresses(json!({
            "net1": [
                {"version": 4, "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:bb"},
                {"version": 4, "addr": "203.0.113.7", "OS-EXT-IPS:type": "floating",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:bb"},
                {"version": 6, "addr": "fd00::5", "OS-EXT-IPS:type": "fixed",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:bb"}
            ]
        }));

        let networks = normalize(&raw);
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].nics.len(), 1);

        let nic = &networks[0].nics[0];
        assert_eq!(nic.fixed_v4.as_deref(), Some("10.0.0.5"));
        assert_eq!(nic.floating_v4.as_deref(), Some("203.0.113.7"));
        assert_eq!(nic.fixed_v6.as_deref(), Some("[fd00::5]"));
        assert_eq!(nic.floating_v6, None);
        assert_eq!(nic.mac.as_deref(), Some("aa:bb"));
    }

    #[test]
    fn test_first_write_wins() {
        let raw = addresses(json!({
            "net1": [
                {"version": 4, "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:bb"},
                {"version": 4, "addr": "10.0.0.6", "OS-EXT-IPS:type": "fixed",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:bb"}
            ]
        }));
        let networks = normalize(&raw);
        assert_eq!(networks[0].nics[0].fixed_v4.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_distinct_macs_and_network_order() {
        let raw = addresses(json!({
            "zeta": [
                {"version": 4, "addr": "10.1.0.1", "OS-EXT-IPS:type": "fixed",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:01"},
                {"version": 4, "addr": "10.1.0.2", "OS-EXT-IPS:type": "fixed",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:02"}
            ],
            "alpha": [
                {"version": 4, "addr": "10.2.0.1", "OS-EXT-IPS:type": "fixed"}
            ]
        }));

        let networks = normalize(&raw);
        let names: Vec<&str> = networks.iter().map(|n| n.network.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(networks[0].nics.len(), 2);
        assert_eq!(networks[1].nics[0].mac, None);

        let primary = primary_nic(&networks).unwrap();
        assert_eq!(primary.fixed_v4.as_deref(), Some("10.1.0.1"));
    }

    #[test]
    fn test_malformed_descriptor_leaves_slot_absent() {
        let raw = addresses(json!({
            "net1": [
                {"version": "four", "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:bb"},
                {"version": 4, "addr": "203.0.113.7", "OS-EXT-IPS:type": "floating",
                 "OS-EXT-IPS-MAC:mac_addr": "aa:bb"}
            ],
            "broken": "not a list"
        }));

        let networks = normalize(&raw);
        let nic = &networks[0].nics[0];
        assert_eq!(nic.fixed_v4, None);
        assert_eq!(nic.floating_v4.as_deref(), Some("203.0.113.7"));
        assert!(networks[1].nics.is_empty());
    }

    #[test]
    fn test_no_addresses() {
        assert!(primary_nic(&normalize(&Map::new())).is_none());
    }
}
