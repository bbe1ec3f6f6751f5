//! The traditional backend: device operations through the `ip` tool, sysfs
//! bonding writes, dhclient, tc and virsh.

use std::fs;

use anyhow::{Context, Error};
use log::debug;
use serde_json::Value;

use osutils::{dhclient, ip, sysfs, tc, virsh};
use vhostd_api::error::{ErrorCode, NetError};

use crate::net::models::{netmask_to_prefix, Ipv4Config, Ipv6Config};

use super::Backend;

pub struct Iproute2;

impl Backend for Iproute2 {
    fn add_bridge(&self, name: &str, stp: bool) -> Result<(), Error> {
        ip::link_add_bridge(name)?;
        ip::bridge_set_stp(name, stp)
    }

    fn remove_bridge(&self, name: &str) -> Result<(), Error> {
        ip::link_down(name)?;
        ip::link_del(name)
    }

    fn add_vlan(&self, link: &str, tag: u16) -> Result<(), Error> {
        ip::link_add_vlan(link, tag)
    }

    fn remove_vlan(&self, name: &str) -> Result<(), Error> {
        ip::link_del(name)
    }

    fn add_bond(&self, name: &str) -> Result<(), Error> {
        sysfs::bond_create(name)
    }

    fn remove_bond(&self, name: &str) -> Result<(), Error> {
        ip::link_down(name)?;
        sysfs::bond_delete(name)
    }

    fn bond_exists(&self, name: &str) -> bool {
        sysfs::bond_exists(name)
    }

    fn bond_slaves(&self, name: &str) -> Vec<String> {
        sysfs::bond_slaves(name).unwrap_or_default()
    }

    fn set_bond_options(&self, bond: &str, options: &[(String, String)]) -> Result<(), Error> {
        // The kernel refuses a mode change on a running bond.
        ip::link_down(bond)?;
        if let Some((_, mode)) = options.iter().find(|(k, _)| k == "mode") {
            sysfs::bond_set_opt(bond, "mode", mode)?;
        }
        for (key, value) in options.iter().filter(|(k, _)| k != "mode") {
            sysfs::bond_set_opt(bond, key, value)?;
        }
        Ok(())
    }

    fn enslave(&self, bond: &str, nic: &str) -> Result<(), Error> {
        // A NIC joins a bond only while down.
        ip::link_down(nic)?;
        ip::set_master(nic, bond)
    }

    fn release_slave(&self, _bond: &str, nic: &str) -> Result<(), Error> {
        ip::nomaster(nic)
    }

    fn set_mtu(&self, iface: &str, mtu: u32) -> Result<(), Error> {
        ip::set_mtu(iface, mtu)
    }

    fn current_mtu(&self, iface: &str) -> Option<u32> {
        sysfs::mtu(iface).ok()
    }

    fn link_up(&self, iface: &str) -> Result<(), Error> {
        ip::link_up(iface)
    }

    fn set_master(&self, port: &str, master: &str) -> Result<(), Error> {
        ip::set_master(port, master)
    }

    fn nomaster(&self, port: &str) -> Result<(), Error> {
        ip::nomaster(port)
    }

    fn flush_addresses(&self, iface: &str) -> Result<(), Error> {
        dhclient::stop_v6(iface)?;
        ip::addr_flush(iface)
    }

    fn add_ip_config(
        &self,
        iface: &str,
        ipv4: &Ipv4Config,
        ipv6: &Ipv6Config,
    ) -> Result<(), Error> {
        if let Some(address) = &ipv4.address {
            let netmask = ipv4.netmask.as_deref().ok_or_else(|| {
                NetError::new(
                    ErrorCode::BadAddr,
                    format!("static address {address} without a netmask"),
                )
            })?;
            let prefix = netmask_to_prefix(netmask)?;
            ip::addr_add(iface, address, prefix, false)?;
            if let (Some(gateway), true) = (&ipv4.gateway, ipv4.default_route) {
                ip::route_add_default(gateway, iface, false)?;
            }
        }

        if let Some(address) = &ipv6.address {
            let (addr, prefix) = match address.split_once('/') {
                Some((addr, plen)) => (
                    addr,
                    plen.parse::<u8>().with_context(|| {
                        format!("Bad ipv6 prefix length in {address}")
                    })?,
                ),
                None => (address.as_str(), 64),
            };
            ip::addr_add(iface, addr, prefix, true)?;
            if let (Some(gateway), true) = (&ipv6.gateway, ipv6.default_route) {
                ip::route_add_default(gateway, iface, true)?;
            }
        }
        if !ipv6.is_empty() {
            set_ipv6_autoconf(iface, ipv6.autoconf)?;
        }
        if ipv6.dhcpv6 {
            dhclient::start_v6(iface)?;
        }
        Ok(())
    }

    fn start_dhcp(&self, iface: &str, duid_source: Option<&str>) -> Result<(), Error> {
        dhclient::start(iface, duid_source)
    }

    fn stop_dhcp(&self, iface: &str) -> Result<(), Error> {
        dhclient::stop(iface)
    }

    fn define_libvirt_network(&self, libvirt_name: &str, xml: &str) -> Result<(), Error> {
        virsh::net_create(xml, libvirt_name)
    }

    fn remove_libvirt_network(&self, libvirt_name: &str) -> Result<(), Error> {
        virsh::net_remove(libvirt_name)
    }

    fn libvirt_network_xml(&self, libvirt_name: &str) -> Option<String> {
        virsh::net_dumpxml(libvirt_name).ok()
    }

    fn apply_qos(&self, iface: &str, qos: &Value) -> Result<(), Error> {
        let Some(rate) = qos
            .get("out")
            .and_then(|out| out.get("ls"))
            .and_then(|ls| ls.get("m2"))
            .and_then(Value::as_u64)
        else {
            debug!("No outbound link-share rate in QoS spec for {iface}, skipping");
            return Ok(());
        };
        tc::apply_out_rate(iface, rate)
    }

    fn clear_qos(&self, iface: &str) -> Result<(), Error> {
        tc::clear(iface)
    }
}

fn set_ipv6_autoconf(iface: &str, autoconf: bool) -> Result<(), Error> {
    let path = format!("/proc/sys/net/ipv6/conf/{iface}/autoconf");
    fs::write(&path, if autoconf { "1" } else { "0" })
        .with_context(|| format!("Failed to set ipv6 autoconf on {iface}"))
}
