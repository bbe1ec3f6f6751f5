//! Typed network device entities. A configured network is a rooted chain
//! from a physical NIC (or a bond of NICs) upward through an optional VLAN
//! and an optional bridge; addressing is attached to the top device.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use vhostd_api::error::{ErrorCode, NetError, NetResult, ReportNetError};
use vhostd_api::request::BootProto;

use crate::net::configurator::ConfiguratorScope;
use crate::net::netinfo::NetInfo;

pub const MAX_VLAN_TAG: u16 = 4094;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ipv4Config {
    pub address: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub default_route: bool,
    pub bootproto: BootProto,
}

impl Ipv4Config {
    pub fn is_dhcp(&self) -> bool {
        self.bootproto == BootProto::Dhcp
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_none() && !self.is_dhcp()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ipv6Config {
    /// `address[/prefixlen]`.
    pub address: Option<String>,
    pub gateway: Option<String>,
    pub default_route: bool,
    pub autoconf: bool,
    pub dhcpv6: bool,
}

impl Ipv6Config {
    pub fn is_empty(&self) -> bool {
        self.address.is_none() && !self.autoconf && !self.dhcpv6
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceKind {
    Nic,
    Vlan {
        tag: u16,
    },
    Bond {
        slaves: Vec<String>,
        options: Vec<(String, String)>,
        /// Implicit bonds live and die with the network defined on top of
        /// them; explicit bonds survive network removal.
        destroy_on_master_removal: bool,
    },
    Bridge {
        stp: bool,
        /// Interface whose DHCP lease provides the DHCP unique identifier,
        /// keeping the address stable when a leased port is wrapped in a
        /// bridge.
        duid_source: Option<String>,
    },
}

/// One level of a configured network chain. `port` links a VLAN or bridge to
/// the device beneath it; a bridge has at most one configured port even
/// though the kernel may attach more.
#[derive(Clone, Debug, PartialEq)]
pub struct NetDev {
    pub name: String,
    pub kind: DeviceKind,
    pub mtu: Option<u32>,
    pub ipv4: Ipv4Config,
    pub ipv6: Ipv6Config,
    pub port: Option<Box<NetDev>>,
}

impl NetDev {
    fn bare(name: impl Into<String>, kind: DeviceKind) -> Self {
        NetDev {
            name: name.into(),
            kind,
            mtu: None,
            ipv4: Ipv4Config::default(),
            ipv6: Ipv6Config::default(),
            port: None,
        }
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, DeviceKind::Bridge { .. })
    }

    /// The bottom-most device of the chain, carrying the traffic: a NIC or a
    /// bond. QoS attaches here.
    pub fn backing_device(&self) -> &NetDev {
        let mut dev = self;
        while let Some(port) = &dev.port {
            dev = port;
        }
        dev
    }

    /// The VLAN tag of the chain, if any level carries one.
    pub fn vlan_tag(&self) -> Option<u16> {
        let mut dev = Some(self);
        while let Some(d) = dev {
            if let DeviceKind::Vlan { tag } = d.kind {
                return Some(tag);
            }
            dev = d.port.as_deref();
        }
        None
    }

    pub fn duid_source(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::Bridge { duid_source, .. } => duid_source.as_deref(),
            _ => None,
        }
    }

    /// Realizes the chain in the kernel, children before parents.
    pub fn configure(&self, scope: &mut ConfiguratorScope) -> Result<(), anyhow::Error> {
        if let Some(port) = &self.port {
            port.configure(scope)?;
        }
        scope.configure_device(self)
    }

    /// Tears the chain down, parents before children.
    pub fn remove(&self, scope: &mut ConfiguratorScope) -> Result<(), anyhow::Error> {
        scope.remove_device(self)?;
        if let Some(port) = &self.port {
            port.remove(scope)?;
        }
        Ok(())
    }
}

/// A bare NIC device, for paths that reference one outside a full chain.
pub fn nic_device(name: &str) -> NetDev {
    NetDev::bare(name, DeviceKind::Nic)
}

pub fn validate_vlan_tag(tag: u16) -> NetResult<()> {
    if tag > MAX_VLAN_TAG {
        return Err(NetError::new(
            ErrorCode::BadParams,
            format!("vlan id out of range: {tag}, must be 0..{MAX_VLAN_TAG}"),
        ));
    }
    Ok(())
}

pub fn validate_bond_name(name: &str) -> NetResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^bond\d+$").unwrap());
    if !re.is_match(name) {
        return Err(NetError::new(
            ErrorCode::BadBonding,
            format!("bad bond name: {name}"),
        ));
    }
    Ok(())
}

/// Parses `"mode=4 miimon=100"` into key/value pairs.
pub fn parse_bond_options(options: &str) -> NetResult<Vec<(String, String)>> {
    let mut parsed = Vec::new();
    for pair in options.split_whitespace() {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                parsed.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(NetError::new(
                    ErrorCode::BadBonding,
                    format!("malformed bonding option: {pair}"),
                ));
            }
        }
    }
    Ok(parsed)
}

/// Converts a dotted-quad netmask to a prefix length. Non-contiguous masks
/// are rejected.
pub fn netmask_to_prefix(netmask: &str) -> NetResult<u8> {
    let octets: Vec<u32> = netmask
        .split('.')
        .map(|o| o.parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| NetError::new(ErrorCode::BadAddr, format!("bad netmask: {netmask}")))?;
    if octets.len() != 4 || octets.iter().any(|o| *o > 255) {
        return Err(NetError::new(
            ErrorCode::BadAddr,
            format!("bad netmask: {netmask}"),
        ));
    }
    let mask = (octets[0] << 24) | (octets[1] << 16) | (octets[2] << 8) | octets[3];
    let prefix = mask.leading_ones();
    if mask.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(NetError::new(
            ErrorCode::BadAddr,
            format!("non-contiguous netmask: {netmask}"),
        ));
    }
    Ok(prefix as u8)
}

/// Converts a prefix length to a dotted-quad netmask.
pub fn prefix_to_netmask(prefix: u32) -> NetResult<String> {
    if prefix > 32 {
        return Err(NetError::new(
            ErrorCode::BadAddr,
            format!("bad prefix: {prefix}"),
        ));
    }
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Ok(format!(
        "{}.{}.{}.{}",
        mask >> 24,
        (mask >> 16) & 0xff,
        (mask >> 8) & 0xff,
        mask & 0xff
    ))
}

/// Flat description of a requested network, ready for objectivization.
#[derive(Debug, Default)]
pub struct FlatNetwork<'a> {
    pub bridge: Option<&'a str>,
    pub vlan_name: Option<&'a str>,
    pub vlan_id: Option<u16>,
    pub bonding: Option<&'a str>,
    pub nic: Option<&'a str>,
    pub mtu: Option<u32>,
    pub ipv4: Ipv4Config,
    pub ipv6: Ipv6Config,
    pub stp: bool,
    /// Whether a bond built here is tied to its master's lifetime.
    pub implicit_bonding: bool,
    pub bond_nics: Option<&'a [String]>,
    pub bond_options: Option<&'a str>,
}

/// Builds the device chain that realizes a flat network request
/// (objectivization). Fails without touching the system.
pub fn objectivize(flat: FlatNetwork<'_>, netinfo: &NetInfo) -> NetResult<NetDev> {
    let mut top: Option<NetDev> = None;

    if let Some(bonding) = flat.bonding {
        top = Some(objectivize_bond(
            bonding,
            flat.bond_nics,
            flat.bond_options,
            flat.mtu,
            netinfo,
            flat.implicit_bonding,
        )?);
    } else if let Some(nic) = flat.nic {
        if let Some(bond) = netinfo.bonding_for_nic(nic) {
            return Err(NetError::new(
                ErrorCode::UsedNic,
                format!("nic {nic} already enslaved to {bond}"),
            ));
        }
        let mut dev = NetDev::bare(nic, DeviceKind::Nic);
        dev.mtu = lower_device_mtu(flat.mtu, nic, netinfo);
        top = Some(dev);
    }

    if flat.vlan_name.is_some() || flat.vlan_id.is_some() {
        let below = top.take().structured(
            ErrorCode::BadParams,
            "vlan requested without an underlying device",
        )?;
        let tag = match flat.vlan_id {
            Some(tag) => tag,
            None => {
                let name = flat.vlan_name.unwrap();
                netinfo
                    .vlans
                    .get(name)
                    .map(|v| v.tag)
                    .structured(ErrorCode::BadParams, format!("unknown vlan device {name}"))?
            }
        };
        validate_vlan_tag(tag)?;
        let name = flat
            .vlan_name
            .map(str::to_string)
            .unwrap_or_else(|| osutils::ip::vlan_name(&below.name, tag));
        let mut vlan = NetDev::bare(name, DeviceKind::Vlan { tag });
        vlan.mtu = flat.mtu;
        vlan.port = Some(Box::new(below));
        top = Some(vlan);
    }

    if let Some(bridge) = flat.bridge {
        let mut dev = NetDev::bare(
            bridge,
            DeviceKind::Bridge {
                stp: flat.stp,
                duid_source: None,
            },
        );
        dev.mtu = flat.mtu;
        dev.port = top.take().map(Box::new);
        top = Some(dev);
    }

    let mut top = top.structured(ErrorCode::BadParams, "Network defined without devices")?;

    top.ipv4 = flat.ipv4;
    top.ipv6 = flat.ipv6;

    // Reuse the DHCP unique identifier of a port that already holds a lease,
    // so wrapping it in a bridge does not change the address.
    if top.is_bridge() && top.ipv4.is_dhcp() {
        inherit_dhcp_unique_identifier(&mut top, netinfo);
    }

    Ok(top)
}

/// Builds a bond device. Slaves and options fall back to the kernel snapshot
/// when not requested, which covers pre-existing bonds.
pub fn objectivize_bond(
    name: &str,
    nics: Option<&[String]>,
    options: Option<&str>,
    mtu: Option<u32>,
    netinfo: &NetInfo,
    destroy_on_master_removal: bool,
) -> NetResult<NetDev> {
    validate_bond_name(name)?;

    let slaves: Vec<String> = match nics {
        Some(nics) if !nics.is_empty() => nics.to_vec(),
        _ => netinfo
            .bondings
            .get(name)
            .map(|b| b.slaves.clone())
            .structured(
                ErrorCode::BadParams,
                format!("Missing required nics on a bonding {name} that is unknown to the kernel"),
            )?,
    };

    for slave in &slaves {
        if let Some(other) = netinfo.bonding_for_nic(slave) {
            if other != name {
                return Err(NetError::new(
                    ErrorCode::UsedNic,
                    format!("nic {slave} already enslaved to {other}"),
                ));
            }
        }
    }

    let options = match options {
        Some(options) => parse_bond_options(options)?,
        None => netinfo
            .bondings
            .get(name)
            .map(|b| b.options.clone())
            .unwrap_or_default(),
    };

    let mut bond = NetDev::bare(
        name,
        DeviceKind::Bond {
            slaves,
            options,
            destroy_on_master_removal,
        },
    );
    bond.mtu = lower_device_mtu(mtu, name, netinfo);
    Ok(bond)
}

/// A shared lower device must keep an MTU large enough for every VLAN riding
/// it; never shrink it below what other users need.
fn lower_device_mtu(requested: Option<u32>, iface: &str, netinfo: &NetInfo) -> Option<u32> {
    let needed = netinfo.max_user_mtu(iface);
    match (requested, needed) {
        (Some(req), Some(needed)) => Some(req.max(needed)),
        (Some(req), None) => Some(req),
        (None, _) => None,
    }
}

fn inherit_dhcp_unique_identifier(bridge: &mut NetDev, netinfo: &NetInfo) {
    if !osutils::dhclient::supports_duid_file() {
        return;
    }
    let Some(port) = &bridge.port else {
        return;
    };
    let known = netinfo.nics.contains(&port.name)
        || netinfo.bondings.contains_key(&port.name)
        || netinfo.vlans.contains_key(&port.name);
    if known && netinfo.dhcpv4.contains(&port.name) {
        let source = port.name.clone();
        if let DeviceKind::Bridge { duid_source, .. } = &mut bridge.kind {
            *duid_source = Some(source);
        }
    }
}

/// Extracts `stp` from backend passthrough options, accepting booleans and
/// their usual string spellings.
pub fn stp_from_opts(opts: &std::collections::BTreeMap<String, Value>) -> bool {
    match opts.get("stp") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "yes" | "on" | "true" | "1"),
        _ => false,
    }
}
