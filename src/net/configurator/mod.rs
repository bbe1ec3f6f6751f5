//! The configurator applies device-level operations through a pluggable
//! backend and tracks every applied operation in an undo log. The scope is
//! opened for one setup transaction: on success the running config is
//! committed, on failure the undo log is walked in reverse and the running
//! config snapshot is restored.

mod iproute2;

use std::collections::BTreeMap;

use anyhow::Error;
use log::{debug, info, warn};
use serde_json::Value;
use strum_macros::EnumString;

use vhostd_api::error::{ErrorCode, NetError};
use vhostd_api::request::{BondAttrs, NetworkAttrs};

use crate::net::bond_options;
use crate::net::models::{DeviceKind, Ipv4Config, Ipv6Config, NetDev};
use crate::net::running_config::{ConfigState, RunningConfig};

pub use iproute2::Iproute2;

/// Backend capability surface. Backends perform single device operations;
/// ordering, undo tracking and persistence live in the scope.
pub trait Backend: Send {
    fn add_bridge(&self, name: &str, stp: bool) -> Result<(), Error>;
    fn remove_bridge(&self, name: &str) -> Result<(), Error>;
    fn add_vlan(&self, link: &str, tag: u16) -> Result<(), Error>;
    fn remove_vlan(&self, name: &str) -> Result<(), Error>;
    fn add_bond(&self, name: &str) -> Result<(), Error>;
    fn remove_bond(&self, name: &str) -> Result<(), Error>;
    fn bond_exists(&self, name: &str) -> bool;
    fn bond_slaves(&self, name: &str) -> Vec<String>;
    fn set_bond_options(&self, bond: &str, options: &[(String, String)]) -> Result<(), Error>;
    fn enslave(&self, bond: &str, nic: &str) -> Result<(), Error>;
    fn release_slave(&self, bond: &str, nic: &str) -> Result<(), Error>;
    fn set_mtu(&self, iface: &str, mtu: u32) -> Result<(), Error>;
    fn current_mtu(&self, iface: &str) -> Option<u32>;
    fn link_up(&self, iface: &str) -> Result<(), Error>;
    fn set_master(&self, port: &str, master: &str) -> Result<(), Error>;
    fn nomaster(&self, port: &str) -> Result<(), Error>;
    fn flush_addresses(&self, iface: &str) -> Result<(), Error>;
    fn add_ip_config(&self, iface: &str, ipv4: &Ipv4Config, ipv6: &Ipv6Config)
        -> Result<(), Error>;
    fn start_dhcp(&self, iface: &str, duid_source: Option<&str>) -> Result<(), Error>;
    fn stop_dhcp(&self, iface: &str) -> Result<(), Error>;
    fn define_libvirt_network(&self, libvirt_name: &str, xml: &str) -> Result<(), Error>;
    fn remove_libvirt_network(&self, libvirt_name: &str) -> Result<(), Error>;
    fn libvirt_network_xml(&self, libvirt_name: &str) -> Option<String>;
    fn apply_qos(&self, iface: &str, qos: &Value) -> Result<(), Error>;
    fn clear_qos(&self, iface: &str) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Iproute2,
}

impl BackendKind {
    /// Resolves the configured backend key; unknown values fall back to the
    /// traditional backend.
    pub fn from_key(key: &str) -> Self {
        key.parse().unwrap_or_else(|_| {
            warn!("Invalid config for network configurator: {key}. Using iproute2 instead.");
            BackendKind::Iproute2
        })
    }

    pub fn create(self) -> Box<dyn Backend> {
        match self {
            BackendKind::Iproute2 => Box::new(Iproute2),
        }
    }
}

/// Inverse of one applied operation. The log is walked in reverse on
/// abnormal close.
#[derive(Debug)]
enum UndoOp {
    RemoveLibvirtNetwork { name: String },
    DefineLibvirtNetwork { name: String, xml: String },
    /// Undo of creating a bridge/vlan/bond level.
    DestroyDevice { dev: NetDev },
    /// Undo of removing a level: recreate it, re-link it to its port and
    /// restore its addressing.
    RecreateDevice { dev: NetDev },
    ReleaseSlave { bond: String, nic: String },
    Enslave { bond: String, nic: String },
    SetMtu { iface: String, mtu: u32 },
    Nomaster { port: String },
    SetMaster { port: String, master: String },
    StopDhcp { iface: String },
    StartDhcp { iface: String, duid_source: Option<String> },
    FlushAddresses { iface: String },
    RestoreIp { iface: String, ipv4: Ipv4Config, ipv6: Ipv6Config },
    SetBondOptions { bond: String, options: Vec<(String, String)> },
    ClearQos { iface: String },
    ApplyQos { iface: String, qos: Value },
}

pub struct ConfiguratorScope {
    backend: Box<dyn Backend>,
    undo: Vec<UndoOp>,
    in_rollback: bool,
    running_config: RunningConfig,
    rc_snapshot: ConfigState,
    finished: bool,
}

impl ConfiguratorScope {
    pub fn open(backend: Box<dyn Backend>, running_config: RunningConfig, in_rollback: bool) -> Self {
        let rc_snapshot = running_config.state();
        ConfiguratorScope {
            backend,
            undo: Vec::new(),
            in_rollback,
            running_config,
            rc_snapshot,
            finished: false,
        }
    }

    pub fn in_rollback(&self) -> bool {
        self.in_rollback
    }

    pub fn running_config(&self) -> &RunningConfig {
        &self.running_config
    }

    pub fn running_config_mut(&mut self) -> &mut RunningConfig {
        &mut self.running_config
    }

    /// Commits the scope: the in-memory running config becomes the persisted
    /// one and the undo log is discarded.
    pub fn commit(mut self) -> Result<(), Error> {
        self.finished = true;
        self.undo.clear();
        self.running_config.save()
    }

    /// Walks the undo log in reverse, restoring the state the scope was
    /// opened with. Individual reversal failures are logged, not raised.
    pub fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!("Rolling back {} applied operations", self.undo.len());
        while let Some(op) = self.undo.pop() {
            if let Err(e) = self.reverse(&op) {
                warn!("Failed to reverse {op:?}: {e:#}");
            }
        }
        self.running_config.restore(self.rc_snapshot.clone());
    }

    fn reverse(&self, op: &UndoOp) -> Result<(), Error> {
        debug!("Reversing {op:?}");
        match op {
            UndoOp::RemoveLibvirtNetwork { name } => self.backend.remove_libvirt_network(name),
            UndoOp::DefineLibvirtNetwork { name, xml } => {
                self.backend.define_libvirt_network(name, xml)
            }
            UndoOp::DestroyDevice { dev } => match &dev.kind {
                DeviceKind::Bridge { .. } => self.backend.remove_bridge(&dev.name),
                DeviceKind::Vlan { .. } => self.backend.remove_vlan(&dev.name),
                DeviceKind::Bond { .. } => self.backend.remove_bond(&dev.name),
                DeviceKind::Nic => Ok(()),
            },
            UndoOp::RecreateDevice { dev } => self.recreate_device(dev),
            UndoOp::ReleaseSlave { bond, nic } => self.backend.release_slave(bond, nic),
            UndoOp::Enslave { bond, nic } => self.backend.enslave(bond, nic),
            UndoOp::SetMtu { iface, mtu } => self.backend.set_mtu(iface, *mtu),
            UndoOp::Nomaster { port } => self.backend.nomaster(port),
            UndoOp::SetMaster { port, master } => self.backend.set_master(port, master),
            UndoOp::StopDhcp { iface } => self.backend.stop_dhcp(iface),
            UndoOp::StartDhcp { iface, duid_source } => {
                self.backend.start_dhcp(iface, duid_source.as_deref())
            }
            UndoOp::FlushAddresses { iface } => self.backend.flush_addresses(iface),
            UndoOp::RestoreIp { iface, ipv4, ipv6 } => {
                if ipv4.is_dhcp() {
                    self.backend.start_dhcp(iface, None)
                } else {
                    self.backend.add_ip_config(iface, ipv4, ipv6)
                }
            }
            UndoOp::SetBondOptions { bond, options } => {
                self.backend.set_bond_options(bond, options)
            }
            UndoOp::ClearQos { iface } => self.backend.clear_qos(iface),
            UndoOp::ApplyQos { iface, qos } => self.backend.apply_qos(iface, qos),
        }
    }

    /// Rebuilds one removed chain level. The undo log is ordered so lower
    /// levels are recreated before the levels riding them.
    fn recreate_device(&self, dev: &NetDev) -> Result<(), Error> {
        match &dev.kind {
            DeviceKind::Bridge { stp, .. } => {
                self.backend.add_bridge(&dev.name, *stp)?;
                if let Some(port) = &dev.port {
                    self.backend.set_master(&port.name, &dev.name)?;
                }
            }
            DeviceKind::Vlan { tag } => {
                if let Some(port) = &dev.port {
                    self.backend.add_vlan(&port.name, *tag)?;
                }
            }
            DeviceKind::Bond {
                slaves, options, ..
            } => {
                self.backend.add_bond(&dev.name)?;
                if !options.is_empty() {
                    self.backend
                        .set_bond_options(&dev.name, &bond_options::numeric_bond_options(options))?;
                }
                for slave in slaves {
                    self.backend.enslave(&dev.name, slave)?;
                }
            }
            DeviceKind::Nic => {}
        }
        if let Some(mtu) = dev.mtu {
            self.backend.set_mtu(&dev.name, mtu)?;
        }
        self.backend.link_up(&dev.name)?;
        if dev.ipv4.is_dhcp() {
            self.backend.start_dhcp(&dev.name, dev.duid_source())?;
        } else if !dev.ipv4.is_empty() || !dev.ipv6.is_empty() {
            self.backend.add_ip_config(&dev.name, &dev.ipv4, &dev.ipv6)?;
        }
        Ok(())
    }

    // Device-level operations, one chain level each. Chain ordering is the
    // model's responsibility.

    pub fn configure_device(&mut self, dev: &NetDev) -> Result<(), Error> {
        debug!("Configuring device {}", dev.name);
        match &dev.kind {
            DeviceKind::Nic => {}
            DeviceKind::Vlan { tag } => {
                let port = dev
                    .port
                    .as_ref()
                    .ok_or_else(|| NetError::new(ErrorCode::BadParams, "vlan without a port"))?;
                self.backend.add_vlan(&port.name, *tag)?;
                self.undo.push(UndoOp::DestroyDevice { dev: dev.clone() });
            }
            DeviceKind::Bond {
                slaves, options, ..
            } => {
                self.configure_bond_level(dev, slaves, options)?;
            }
            DeviceKind::Bridge { stp, .. } => {
                self.backend.add_bridge(&dev.name, *stp)?;
                self.undo.push(UndoOp::DestroyDevice { dev: dev.clone() });
                if let Some(port) = &dev.port {
                    self.backend.set_master(&port.name, &dev.name)?;
                    self.undo.push(UndoOp::Nomaster {
                        port: port.name.clone(),
                    });
                }
            }
        }
        if let Some(mtu) = dev.mtu {
            self.set_iface_mtu(&dev.name, mtu)?;
        }
        self.link_up(&dev.name)?;
        self.apply_ip(dev)?;
        Ok(())
    }

    fn configure_bond_level(
        &mut self,
        dev: &NetDev,
        slaves: &[String],
        options: &[(String, String)],
    ) -> Result<(), Error> {
        if self.backend.bond_exists(&dev.name) {
            // Pre-existing bond under a new network: only join missing
            // slaves; option changes go through the edit path.
            let current = self.backend.bond_slaves(&dev.name);
            for slave in slaves {
                if !current.contains(slave) {
                    self.enslave(&dev.name, slave)?;
                }
            }
        } else {
            self.backend.add_bond(&dev.name)?;
            self.undo.push(UndoOp::DestroyDevice { dev: dev.clone() });
            if !options.is_empty() {
                self.backend
                    .set_bond_options(&dev.name, &bond_options::numeric_bond_options(options))?;
            }
            for slave in slaves {
                self.enslave(&dev.name, slave)?;
            }
        }
        self.record_bonding(dev, slaves, options);
        Ok(())
    }

    /// Reconciles an existing bond to a new slave set and options. Slaves to
    /// drop have already been released by the caller.
    pub fn edit_bonding(
        &mut self,
        dev: &NetDev,
        prior_options: &[(String, String)],
    ) -> Result<(), Error> {
        let DeviceKind::Bond {
            slaves, options, ..
        } = &dev.kind
        else {
            return Err(NetError::new(ErrorCode::BadBonding, "not a bond").into());
        };
        debug!("Editing bond {} with options {:?}", dev.name, options);

        if options != prior_options {
            self.backend
                .set_bond_options(&dev.name, &bond_options::numeric_bond_options(options))?;
            self.undo.push(UndoOp::SetBondOptions {
                bond: dev.name.clone(),
                options: prior_options.to_vec(),
            });
        }
        let current = self.backend.bond_slaves(&dev.name);
        for slave in slaves {
            if !current.contains(slave) {
                self.enslave(&dev.name, slave)?;
            }
        }
        if let Some(mtu) = dev.mtu {
            self.set_iface_mtu(&dev.name, mtu)?;
        }
        self.link_up(&dev.name)?;
        self.record_bonding(dev, slaves, options);
        Ok(())
    }

    pub fn remove_device(&mut self, dev: &NetDev) -> Result<(), Error> {
        debug!("Removing device {}", dev.name);
        match &dev.kind {
            DeviceKind::Nic => {
                self.drop_ip(dev)?;
            }
            DeviceKind::Vlan { .. } => {
                self.drop_ip(dev)?;
                self.backend.remove_vlan(&dev.name)?;
                self.undo.push(UndoOp::RecreateDevice { dev: dev.clone() });
            }
            DeviceKind::Bond {
                destroy_on_master_removal,
                ..
            } => {
                if *destroy_on_master_removal {
                    self.drop_ip(dev)?;
                    self.backend.remove_bond(&dev.name)?;
                    self.undo.push(UndoOp::RecreateDevice { dev: dev.clone() });
                    self.running_config_mut().remove_bonding(&dev.name);
                }
            }
            DeviceKind::Bridge { .. } => {
                self.drop_ip(dev)?;
                self.backend.remove_bridge(&dev.name)?;
                self.undo.push(UndoOp::RecreateDevice { dev: dev.clone() });
            }
        }
        Ok(())
    }

    /// Detaches a port from its bridge so the device below can be removed
    /// while the bridge stays.
    pub fn disconnect_bridge_port(&mut self, bridge: &str, port: &str) -> Result<(), Error> {
        self.backend.nomaster(port)?;
        self.undo.push(UndoOp::SetMaster {
            port: port.to_string(),
            master: bridge.to_string(),
        });
        Ok(())
    }

    /// Forcibly releases a NIC from a bond (bond edit path).
    pub fn remove_slave(&mut self, bond: &str, nic: &str) -> Result<(), Error> {
        self.backend.release_slave(bond, nic)?;
        self.undo.push(UndoOp::Enslave {
            bond: bond.to_string(),
            nic: nic.to_string(),
        });
        Ok(())
    }

    pub fn set_iface_mtu(&mut self, iface: &str, mtu: u32) -> Result<(), Error> {
        let old = self.backend.current_mtu(iface);
        if old == Some(mtu) {
            return Ok(());
        }
        self.backend.set_mtu(iface, mtu)?;
        if let Some(old) = old {
            self.undo.push(UndoOp::SetMtu {
                iface: iface.to_string(),
                mtu: old,
            });
        }
        Ok(())
    }

    pub fn configure_libvirt_network(&mut self, network: &str, top: &NetDev) -> Result<(), Error> {
        let libvirt_name = libvirt_network_name(network);
        let xml = if top.is_bridge() {
            osutils::virsh::bridged_network_xml(&libvirt_name, &top.name)
        } else {
            osutils::virsh::passthrough_network_xml(&libvirt_name, &top.name)
        };
        self.backend.define_libvirt_network(&libvirt_name, &xml)?;
        self.undo
            .push(UndoOp::RemoveLibvirtNetwork { name: libvirt_name });
        Ok(())
    }

    pub fn remove_libvirt_network(&mut self, network: &str) -> Result<(), Error> {
        let libvirt_name = libvirt_network_name(network);
        let xml = self.backend.libvirt_network_xml(&libvirt_name);
        self.backend.remove_libvirt_network(&libvirt_name)?;
        if let Some(xml) = xml {
            self.undo.push(UndoOp::DefineLibvirtNetwork {
                name: libvirt_name,
                xml,
            });
        }
        Ok(())
    }

    pub fn configure_qos(&mut self, qos: &Value, dev: &NetDev) -> Result<(), Error> {
        let backing = dev.backing_device();
        self.backend.apply_qos(&backing.name, qos)?;
        self.undo.push(UndoOp::ClearQos {
            iface: backing.name.clone(),
        });
        Ok(())
    }

    /// QoS removal is last in the teardown order so nothing still marks it
    /// as used. `prior_qos` (from the running config) makes the removal
    /// reversible.
    pub fn remove_qos(&mut self, dev: &NetDev, prior_qos: Option<&Value>) -> Result<(), Error> {
        let backing = dev.backing_device();
        self.backend.clear_qos(&backing.name)?;
        if let Some(qos) = prior_qos {
            self.undo.push(UndoOp::ApplyQos {
                iface: backing.name.clone(),
                qos: qos.clone(),
            });
        }
        Ok(())
    }

    fn enslave(&mut self, bond: &str, nic: &str) -> Result<(), Error> {
        self.backend.enslave(bond, nic)?;
        self.undo.push(UndoOp::ReleaseSlave {
            bond: bond.to_string(),
            nic: nic.to_string(),
        });
        Ok(())
    }

    fn link_up(&mut self, iface: &str) -> Result<(), Error> {
        self.backend.link_up(iface).map_err(|e| {
            NetError::with_source(
                ErrorCode::FailedIfup,
                format!("Failed to bring up {iface}"),
                e,
            )
            .into()
        })
    }

    fn apply_ip(&mut self, dev: &NetDev) -> Result<(), Error> {
        if dev.ipv4.is_dhcp() {
            self.backend
                .start_dhcp(&dev.name, dev.duid_source())
                .map_err(|e| {
                    Error::from(NetError::with_source(
                        ErrorCode::FailedIfup,
                        format!("Failed to acquire a dhcp lease on {}", dev.name),
                        e,
                    ))
                })?;
            self.undo.push(UndoOp::StopDhcp {
                iface: dev.name.clone(),
            });
        } else if !dev.ipv4.is_empty() || !dev.ipv6.is_empty() {
            self.backend.add_ip_config(&dev.name, &dev.ipv4, &dev.ipv6)?;
            self.undo.push(UndoOp::FlushAddresses {
                iface: dev.name.clone(),
            });
        }
        Ok(())
    }

    /// Releases the addressing of a device about to be removed, recording
    /// enough to restore it on rollback.
    fn drop_ip(&mut self, dev: &NetDev) -> Result<(), Error> {
        if dev.ipv4.is_dhcp() {
            self.backend.stop_dhcp(&dev.name)?;
            self.undo.push(UndoOp::StartDhcp {
                iface: dev.name.clone(),
                duid_source: dev.duid_source().map(str::to_string),
            });
        } else if !dev.ipv4.is_empty() || !dev.ipv6.is_empty() {
            self.backend.flush_addresses(&dev.name)?;
            self.undo.push(UndoOp::RestoreIp {
                iface: dev.name.clone(),
                ipv4: dev.ipv4.clone(),
                ipv6: dev.ipv6.clone(),
            });
        }
        Ok(())
    }

    fn record_bonding(&mut self, dev: &NetDev, slaves: &[String], options: &[(String, String)]) {
        let attrs = BondAttrs {
            nics: slaves.to_vec(),
            options: if options.is_empty() {
                None
            } else {
                Some(
                    options
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(" "),
                )
            },
            remove: false,
        };
        self.running_config.set_bonding(&dev.name, attrs);
    }
}

impl Drop for ConfiguratorScope {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Configurator scope dropped without commit, rolling back");
            self.rollback();
        }
    }
}

pub fn libvirt_network_name(network: &str) -> String {
    format!("{}{network}", vhostd_api::constants::LIBVIRT_NET_PREFIX)
}

/// Requested network attrs reduced to the keys the kernel can corroborate,
/// for keep-bridge comparisons.
pub fn bridge_only_config(attrs: &NetworkAttrs) -> BTreeMap<String, Value> {
    let value = serde_json::to_value(attrs).expect("attrs are always serializable");
    let mut map: BTreeMap<String, Value> = serde_json::from_value(value).expect("attrs are a map");
    for ignored in ["bonding", "nic", "mtu", "vlan", "remove", "custom", "hostQos"] {
        map.remove(ignored);
    }
    map
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::net::models::{FlatNetwork, objectivize};
    use crate::net::netinfo::NetInfo;
    use vhostd_api::request::BootProto;

    fn bridged_dhcp_net() -> NetDev {
        let mut dev = objectivize(
            FlatNetwork {
                bridge: Some("ovirtmgmt"),
                nic: Some("eth0"),
                mtu: Some(1500),
                ..Default::default()
            },
            &NetInfo::default(),
        )
        .unwrap();
        dev.ipv4 = Ipv4Config {
            bootproto: BootProto::Dhcp,
            ..Default::default()
        };
        dev
    }

    #[test]
    fn test_configure_chain_order() {
        let (backend, _) = MockBackend::new();
        let (mut scope, log) = scope_with(backend);

        let dev = bridged_dhcp_net();
        dev.configure(&mut scope).unwrap();
        scope.commit().unwrap();

        let log = log.lock().unwrap();
        let bridge_pos = log.iter().position(|l| l.starts_with("add_bridge")).unwrap();
        let nic_up_pos = log.iter().position(|l| l == "link_up eth0").unwrap();
        assert!(nic_up_pos < bridge_pos, "nic must be up before the bridge: {log:?}");
        assert!(log.contains(&"set_master eth0 ovirtmgmt".to_string()));
        assert!(log.contains(&"start_dhcp ovirtmgmt duid=-".to_string()));
    }

    #[test]
    fn test_rollback_reverses_in_order() {
        let (backend, _) = MockBackend::new();
        let (mut scope, log) = scope_with(backend);

        let dev = bridged_dhcp_net();
        dev.configure(&mut scope).unwrap();
        scope.rollback();

        let log = log.lock().unwrap();
        let stop_dhcp = log.iter().position(|l| l.starts_with("stop_dhcp")).unwrap();
        let nomaster = log.iter().position(|l| l.starts_with("nomaster")).unwrap();
        let remove_bridge = log
            .iter()
            .position(|l| l.starts_with("remove_bridge"))
            .unwrap();
        assert!(
            stop_dhcp < nomaster && nomaster < remove_bridge,
            "undo must run in reverse apply order: {log:?}"
        );
    }

    #[test]
    fn test_removal_rollback_recreates_lower_levels_first() {
        let (backend, _) = MockBackend::new();
        let backend = backend.with_bond("bond0", &["eth1", "eth2"]);
        let (mut scope, log) = scope_with(backend);

        let mut ni = NetInfo::default();
        ni.bondings.insert(
            "bond0".into(),
            crate::net::netinfo::BondInfo {
                slaves: vec!["eth1".into(), "eth2".into()],
                options: vec![],
            },
        );
        let dev = objectivize(
            FlatNetwork {
                vlan_id: Some(100),
                bonding: Some("bond0"),
                implicit_bonding: true,
                ..Default::default()
            },
            &ni,
        )
        .unwrap();

        dev.remove(&mut scope).unwrap();
        scope.rollback();

        let log = log.lock().unwrap();
        let bond_back = log.iter().rposition(|l| l == "add_bond bond0").unwrap();
        let vlan_back = log.iter().rposition(|l| l == "add_vlan bond0 100").unwrap();
        assert!(
            bond_back < vlan_back,
            "bond must be recreated before its vlan: {log:?}"
        );
    }

    #[test]
    fn test_failed_ifup_carries_code() {
        let (backend, _) = MockBackend::new();
        let backend = backend.failing_on("start_dhcp");
        let (mut scope, _log) = scope_with(backend);

        let dev = bridged_dhcp_net();
        let err = dev.configure(&mut scope).unwrap_err();
        let net_err = err.downcast_ref::<NetError>().unwrap();
        assert_eq!(net_err.code(), ErrorCode::FailedIfup);
        scope.rollback();
    }

    #[test]
    fn test_libvirt_order_helpers() {
        assert_eq!(libvirt_network_name("ovirtmgmt"), "vdsm-ovirtmgmt");
    }

    #[test]
    fn test_bridge_only_config_strips_link_keys() {
        let attrs: NetworkAttrs = serde_json::from_str(
            r#"{"nic": "eth0", "mtu": 9000, "vlan": 100, "bridged": true, "bootproto": "dhcp"}"#,
        )
        .unwrap();
        let map = bridge_only_config(&attrs);
        assert!(map.contains_key("bridged"));
        assert!(map.contains_key("bootproto"));
        assert!(!map.contains_key("nic"));
        assert!(!map.contains_key("mtu"));
        assert!(!map.contains_key("vlan"));
    }

    #[test]
    fn test_backend_kind_fallback() {
        assert_eq!(BackendKind::from_key("iproute2"), BackendKind::Iproute2);
        assert_eq!(BackendKind::from_key("pyroute2"), BackendKind::Iproute2);
    }

    #[test]
    fn test_edit_bonding_records_prior_options() {
        let (backend, _) = MockBackend::new();
        let backend = backend.with_bond("bond0", &["eth1"]);
        let (mut scope, log) = scope_with(backend);

        let mut ni = NetInfo::default();
        ni.bondings.insert(
            "bond0".into(),
            crate::net::netinfo::BondInfo {
                slaves: vec!["eth1".into()],
                options: vec![("mode".into(), "1".into())],
            },
        );
        let dev = crate::net::models::objectivize_bond(
            "bond0",
            Some(&["eth1".to_string(), "eth2".to_string()]),
            Some("mode=4"),
            None,
            &ni,
            false,
        )
        .unwrap();

        scope
            .edit_bonding(&dev, &[("mode".to_string(), "1".to_string())])
            .unwrap();
        scope.rollback();

        let log = log.lock().unwrap();
        assert!(log.contains(&"set_bond_options bond0 mode=4".to_string()));
        assert!(log.contains(&"enslave bond0 eth2".to_string()));
        // rollback restored prior options and released the new slave
        assert!(log.contains(&"set_bond_options bond0 mode=1".to_string()));
        assert!(log.contains(&"release_slave bond0 eth2".to_string()));
    }
}
