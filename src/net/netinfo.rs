//! Point-in-time snapshot of the host networking state: kernel devices from
//! sysfs plus the libvirt-registered network list. The device layer can be
//! re-captured mid-setup with `update_devices()` while the network table is
//! maintained incrementally.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Error};
use log::debug;
use serde_json::{json, Value};

use osutils::{dhclient, sysfs, virsh};
use vhostd_api::constants::LIBVIRT_NET_PREFIX;
use vhostd_api::error::{ErrorCode, NetError, NetResult};
use vhostd_api::request::BootProto;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkEntry {
    pub bridged: bool,
    /// Top interface of the network: the bridge, or the bare device for a
    /// bridgeless network.
    pub iface: String,
    /// Kernel ports of the bridge; empty for bridgeless networks.
    pub ports: Vec<String>,
    pub dhcpv4: bool,
    pub stp: bool,
    /// Whether the top interface is actually present in the kernel. A
    /// libvirt network whose device vanished is "broken".
    pub exists: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BondInfo {
    pub slaves: Vec<String>,
    pub options: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VlanEntry {
    pub link: String,
    pub tag: u16,
}

/// The devices below a network, as resolved from the kernel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkChain {
    pub nics: Vec<String>,
    pub vlan: Option<String>,
    pub vlan_id: Option<u16>,
    pub bonding: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct NetInfo {
    pub networks: BTreeMap<String, NetworkEntry>,
    pub nics: BTreeSet<String>,
    pub bondings: BTreeMap<String, BondInfo>,
    /// VLAN devices keyed by device name (`bond0.100`).
    pub vlans: BTreeMap<String, VlanEntry>,
    /// Bridge name to kernel port list.
    pub bridges: BTreeMap<String, Vec<String>>,
    pub mtus: BTreeMap<String, u32>,
    /// Interfaces with an active DHCPv4 client.
    pub dhcpv4: BTreeSet<String>,
    /// Snapshots captured from the host can re-read the device layer;
    /// hand-built ones (tests) cannot and keep what they were given.
    live: bool,
}

impl NetInfo {
    /// Captures kernel state and the libvirt network list.
    pub fn capture() -> Result<Self, Error> {
        let mut info = NetInfo {
            live: true,
            ..NetInfo::default()
        };
        info.update_devices()?;

        for libvirt_name in virsh::net_list()? {
            let Some(name) = libvirt_name.strip_prefix(LIBVIRT_NET_PREFIX) else {
                continue;
            };
            let xml = virsh::net_dumpxml(&libvirt_name)
                .with_context(|| format!("Failed to inspect libvirt network {libvirt_name}"))?;
            let entry = match (virsh::bridge_of(&xml), virsh::iface_of(&xml)) {
                (Some(bridge), _) => {
                    let exists = sysfs::iface_exists(&bridge);
                    NetworkEntry {
                        bridged: true,
                        ports: info.bridges.get(&bridge).cloned().unwrap_or_default(),
                        dhcpv4: info.dhcpv4.contains(&bridge),
                        stp: exists && sysfs::bridge_stp(&bridge).unwrap_or(false),
                        exists,
                        iface: bridge,
                    }
                }
                (None, Some(iface)) => NetworkEntry {
                    bridged: false,
                    ports: Vec::new(),
                    dhcpv4: info.dhcpv4.contains(&iface),
                    stp: false,
                    exists: sysfs::iface_exists(&iface),
                    iface,
                },
                (None, None) => {
                    debug!("Skipping unrecognized libvirt network {libvirt_name}");
                    continue;
                }
            };
            info.networks.insert(name.to_string(), entry);
        }
        Ok(info)
    }

    /// Re-captures the kernel device layer, keeping the network table.
    pub fn update_devices(&mut self) -> Result<(), Error> {
        if !self.live {
            return Ok(());
        }
        let root = Path::new(sysfs::NET_PATH);

        self.nics = sysfs::nics_at(root)?.into_iter().collect();
        self.vlans = sysfs::vlans()?
            .into_iter()
            .map(|(name, v)| {
                (
                    name,
                    VlanEntry {
                        link: v.link,
                        tag: v.tag,
                    },
                )
            })
            .collect();

        self.bondings.clear();
        for bond in sysfs::bond_masters()? {
            let slaves = sysfs::bond_slaves(&bond).unwrap_or_default();
            let options = sysfs::bond_opts_at(root, &bond)
                .map(|opts| {
                    opts.into_iter()
                        .filter(|(name, elements)| name == "mode" && elements.len() == 2)
                        .map(|(name, elements)| (name, elements[1].clone()))
                        .collect()
                })
                .unwrap_or_default();
            self.bondings.insert(bond, BondInfo { slaves, options });
        }

        self.bridges.clear();
        self.mtus.clear();
        self.dhcpv4.clear();
        for iface in sysfs::list_ifaces()? {
            if sysfs::is_bridge(&iface) {
                self.bridges
                    .insert(iface.clone(), sysfs::bridge_ports(&iface).unwrap_or_default());
            }
            if let Ok(mtu) = sysfs::mtu(&iface) {
                self.mtus.insert(iface.clone(), mtu);
            }
            if dhclient::is_active(&iface) {
                self.dhcpv4.insert(iface);
            }
        }

        // Ports of bridged networks may have changed under us.
        for entry in self.networks.values_mut() {
            if entry.bridged {
                entry.ports = self.bridges.get(&entry.iface).cloned().unwrap_or_default();
                entry.exists = self.bridges.contains_key(&entry.iface);
            }
        }
        Ok(())
    }

    pub fn del_network(&mut self, name: &str) {
        self.networks.remove(name);
    }

    pub fn del_bonding(&mut self, name: &str) {
        self.bondings.remove(name);
    }

    /// The bond a NIC is enslaved to, if any.
    pub fn bonding_for_nic(&self, nic: &str) -> Option<&str> {
        self.bondings
            .iter()
            .find(|(_, bond)| bond.slaves.iter().any(|s| s == nic))
            .map(|(name, _)| name.as_str())
    }

    /// Resolves the device chain below a network: which NICs, VLAN and bond
    /// realize it in the kernel.
    pub fn network_chain(&self, network: &str) -> NetResult<NetworkChain> {
        let entry = self.networks.get(network).ok_or_else(|| {
            NetError::new(ErrorCode::BadBridge, format!("unknown network {network}"))
        })?;

        let base = if entry.bridged {
            // The configured port is the one the model recognizes; taps and
            // other transient ports are not part of the chain.
            entry
                .ports
                .iter()
                .find(|p| {
                    self.vlans.contains_key(*p)
                        || self.bondings.contains_key(*p)
                        || self.nics.contains(*p)
                })
                .cloned()
        } else {
            Some(entry.iface.clone())
        };

        let mut chain = NetworkChain::default();
        let Some(base) = base else {
            return Ok(chain); // bridge with no ports
        };

        let lower = if let Some(vlan) = self.vlans.get(&base) {
            chain.vlan = Some(base.clone());
            chain.vlan_id = Some(vlan.tag);
            vlan.link.clone()
        } else {
            base
        };

        if let Some(bond) = self.bondings.get(&lower) {
            chain.nics = bond.slaves.clone();
            chain.bonding = Some(lower);
        } else {
            chain.nics = vec![lower];
        }
        Ok(chain)
    }

    /// `(network, vlan tag)` pairs whose chain bottoms out at `iface`.
    pub fn networks_and_vlans_for_iface(&self, iface: &str) -> Vec<(String, Option<u16>)> {
        let mut found = Vec::new();
        for name in self.networks.keys() {
            if let Ok(chain) = self.network_chain(name) {
                let bottoms_here = match &chain.bonding {
                    Some(bond) => bond == iface,
                    None => chain.nics.iter().any(|n| n == iface),
                };
                if bottoms_here {
                    found.push((name.clone(), chain.vlan_id));
                }
            }
        }
        found
    }

    /// Everything that uses `iface`: networks built on it, vlans riding it,
    /// bridges having it as a port.
    pub fn iface_users(&self, iface: &str) -> Vec<String> {
        let mut users = Vec::new();
        for (name, _) in self.networks_and_vlans_for_iface(iface) {
            users.push(format!("network {name}"));
        }
        for (vlan, entry) in &self.vlans {
            if entry.link == iface {
                users.push(format!("vlan {vlan}"));
            }
        }
        for (bridge, ports) in &self.bridges {
            if ports.iter().any(|p| p == iface) {
                users.push(format!("bridge {bridge}"));
            }
        }
        users.sort();
        users.dedup();
        users
    }

    /// The MTU other users of a shared lower device require: the largest MTU
    /// among VLAN devices riding it.
    pub fn max_user_mtu(&self, iface: &str) -> Option<u32> {
        self.vlans
            .iter()
            .filter(|(_, entry)| entry.link == iface)
            .filter_map(|(vlan, _)| self.mtus.get(vlan).copied())
            .max()
    }

    /// Bridge-level attributes of a network as the kernel reports them,
    /// shaped like request attributes for keep-bridge comparison.
    pub fn kernel_network_attrs(&self, network: &str) -> Option<BTreeMap<String, Value>> {
        let entry = self.networks.get(network)?;
        let mut attrs = BTreeMap::new();
        attrs.insert("bridged".to_string(), json!(entry.bridged));
        let bootproto = if entry.dhcpv4 {
            BootProto::Dhcp
        } else {
            BootProto::None
        };
        attrs.insert(
            "bootproto".to_string(),
            serde_json::to_value(bootproto).expect("bootproto serializes"),
        );
        if entry.bridged {
            attrs.insert("stp".to_string(), json!(entry.stp));
        }
        if entry.exists && !entry.dhcpv4 {
            if let Ok(Some((address, prefix))) = osutils::ip::addr_show_ipv4(&entry.iface) {
                attrs.insert("ipaddr".to_string(), json!(address));
                attrs.insert("prefix".to_string(), json!(prefix));
            }
        }
        Some(attrs)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::snapshot;
    use super::*;

    #[test]
    fn test_bonding_for_nic() {
        let ni = snapshot();
        assert_eq!(ni.bonding_for_nic("eth1"), Some("bond0"));
        assert_eq!(ni.bonding_for_nic("eth0"), None);
    }

    #[test]
    fn test_network_chain_bridged() {
        let ni = snapshot();
        let chain = ni.network_chain("ovirtmgmt").unwrap();
        assert_eq!(chain.nics, vec!["eth0"]);
        assert_eq!(chain.vlan, None);
        assert_eq!(chain.bonding, None);
    }

    #[test]
    fn test_network_chain_vlan_over_bond() {
        let ni = snapshot();
        let chain = ni.network_chain("vlan100").unwrap();
        assert_eq!(chain.nics, vec!["eth1", "eth2"]);
        assert_eq!(chain.vlan.as_deref(), Some("bond0.100"));
        assert_eq!(chain.vlan_id, Some(100));
        assert_eq!(chain.bonding.as_deref(), Some("bond0"));
    }

    #[test]
    fn test_network_chain_unknown() {
        let err = snapshot().network_chain("nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadBridge);
    }

    #[test]
    fn test_networks_and_vlans_for_iface() {
        let ni = snapshot();
        assert_eq!(
            ni.networks_and_vlans_for_iface("bond0"),
            vec![("vlan100".to_string(), Some(100))]
        );
        assert_eq!(
            ni.networks_and_vlans_for_iface("eth0"),
            vec![("ovirtmgmt".to_string(), None)]
        );
        assert!(ni.networks_and_vlans_for_iface("eth3").is_empty());
    }

    #[test]
    fn test_iface_users() {
        let ni = snapshot();
        let users = ni.iface_users("bond0");
        assert!(users.contains(&"network vlan100".to_string()));
        assert!(users.contains(&"vlan bond0.100".to_string()));
        assert!(ni.iface_users("eth3").is_empty());
    }

    #[test]
    fn test_max_user_mtu() {
        let mut ni = snapshot();
        assert_eq!(ni.max_user_mtu("bond0"), Some(1500));
        ni.mtus.insert("bond0.100".into(), 9000);
        assert_eq!(ni.max_user_mtu("bond0"), Some(9000));
        assert_eq!(ni.max_user_mtu("eth3"), None);
    }

    #[test]
    fn test_kernel_network_attrs() {
        let mut ni = snapshot();
        // Avoid querying live addresses for a dhcp network
        let attrs = ni.kernel_network_attrs("ovirtmgmt").unwrap();
        assert_eq!(attrs["bridged"], json!(true));
        assert_eq!(attrs["bootproto"], json!("dhcp"));
        assert_eq!(attrs["stp"], json!(false));

        ni.networks.get_mut("vlan100").unwrap().exists = false;
        let attrs = ni.kernel_network_attrs("vlan100").unwrap();
        assert_eq!(attrs["bridged"], json!(false));
        assert_eq!(attrs["bootproto"], json!("none"));
        assert!(!attrs.contains_key("stp"));
    }
}
