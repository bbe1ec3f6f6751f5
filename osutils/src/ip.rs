use anyhow::{Context, Error};

use crate::dependencies::Dependency;
use crate::exe::RunAndCheck;

/// Conventional name of a VLAN device over `link` with the given tag.
pub fn vlan_name(link: &str, tag: u16) -> String {
    format!("{link}.{tag}")
}

/// `ip link set dev <iface> <args..>`
pub fn link_set(iface: &str, args: &[&str]) -> Result<(), Error> {
    Dependency::Ip
        .cmd()
        .args(["link", "set", "dev", iface])
        .args(args)
        .run_and_check()
        .with_context(|| format!("Failed to set link attributes on {iface}"))
}

pub fn link_up(iface: &str) -> Result<(), Error> {
    link_set(iface, &["up"])
}

pub fn link_down(iface: &str) -> Result<(), Error> {
    link_set(iface, &["down"])
}

pub fn set_mtu(iface: &str, mtu: u32) -> Result<(), Error> {
    link_set(iface, &["mtu", &mtu.to_string()])
}

/// Enslaves `port` to a bridge or bond master.
pub fn set_master(port: &str, master: &str) -> Result<(), Error> {
    link_set(port, &["master", master])
}

/// Detaches `port` from whatever master it is enslaved to.
pub fn nomaster(port: &str) -> Result<(), Error> {
    link_set(port, &["nomaster"])
}

pub fn link_add_bridge(name: &str) -> Result<(), Error> {
    Dependency::Ip
        .cmd()
        .args(["link", "add", "name", name, "type", "bridge"])
        .run_and_check()
        .with_context(|| format!("Failed to create bridge {name}"))
}

pub fn bridge_set_stp(name: &str, stp: bool) -> Result<(), Error> {
    let state = if stp { "1" } else { "0" };
    Dependency::Ip
        .cmd()
        .args(["link", "set", "dev", name, "type", "bridge", "stp_state", state])
        .run_and_check()
        .with_context(|| format!("Failed to set stp on bridge {name}"))
}

pub fn link_add_vlan(link: &str, tag: u16) -> Result<(), Error> {
    let name = vlan_name(link, tag);
    let tag = tag.to_string();
    Dependency::Ip
        .cmd()
        .args([
            "link",
            "add",
            "link",
            link,
            "name",
            name.as_str(),
            "type",
            "vlan",
            "id",
            tag.as_str(),
        ])
        .run_and_check()
        .with_context(|| format!("Failed to create vlan {name}"))
}

pub fn link_del(name: &str) -> Result<(), Error> {
    Dependency::Ip
        .cmd()
        .args(["link", "del", "dev", name])
        .run_and_check()
        .with_context(|| format!("Failed to delete link {name}"))
}

/// Drops every global-scope address from the device.
pub fn addr_flush(iface: &str) -> Result<(), Error> {
    Dependency::Ip
        .cmd()
        .args(["addr", "flush", "dev", iface, "scope", "global"])
        .run_and_check()
        .with_context(|| format!("Failed to flush addresses on {iface}"))
}

/// Adds `address/prefix` to the device; `family6` selects IPv6.
pub fn addr_add(iface: &str, address: &str, prefix: u8, family6: bool) -> Result<(), Error> {
    let family = if family6 { "-6" } else { "-4" };
    let cidr = format!("{address}/{prefix}");
    Dependency::Ip
        .cmd()
        .args([family, "addr", "add", cidr.as_str(), "dev", iface])
        .run_and_check()
        .with_context(|| format!("Failed to add {cidr} to {iface}"))
}

/// First global IPv4 address configured on the device, as `(address, prefix)`.
pub fn addr_show_ipv4(iface: &str) -> Result<Option<(String, u8)>, Error> {
    let output = Dependency::Ip
        .cmd()
        .args(["-o", "-4", "addr", "show", "dev", iface, "scope", "global"])
        .output_and_check()
        .with_context(|| format!("Failed to query addresses of {iface}"))?;
    Ok(parse_addr_show_ipv4(&output))
}

/// Parses one-line `ip -o -4 addr show` output, e.g.
/// `2: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0\\       ...`
pub fn parse_addr_show_ipv4(output: &str) -> Option<(String, u8)> {
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "inet" {
                if let Some((addr, prefix)) = fields.next().and_then(|a| a.split_once('/')) {
                    if let Ok(prefix) = prefix.parse() {
                        return Some((addr.to_string(), prefix));
                    }
                }
            }
        }
    }
    None
}

pub fn route_add_default(gateway: &str, iface: &str, family6: bool) -> Result<(), Error> {
    let family = if family6 { "-6" } else { "-4" };
    Dependency::Ip
        .cmd()
        .arg(family)
        .args(["route", "replace", "default", "via", gateway, "dev", iface])
        .run_and_check()
        .with_context(|| format!("Failed to add default route via {gateway} on {iface}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_name() {
        assert_eq!(vlan_name("bond0", 100), "bond0.100");
        assert_eq!(vlan_name("eth1", 4094), "eth1.4094");
    }

    #[test]
    fn test_parse_addr_show_ipv4() {
        let output =
            "2: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global noprefixroute eth0\n";
        assert_eq!(
            parse_addr_show_ipv4(output),
            Some(("10.0.0.5".to_string(), 24))
        );
        assert_eq!(parse_addr_show_ipv4(""), None);
        assert_eq!(parse_addr_show_ipv4("garbage line\n"), None);
    }
}
