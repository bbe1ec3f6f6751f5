//! The setup reconciler: diffs requested networks and bondings against the
//! host snapshot and drives the configurator through the strict order
//! remove-networks, bondings (remove/edit/add), add-networks, connectivity
//! check. Any failure rolls the whole transaction back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Error};
use log::{debug, error, info, warn};
use serde_json::Value;

use osutils::sysfs;
use vhostd_api::config::AgentConfig;
use vhostd_api::constants::{CLIENT_LOG_PATH, CONF_DIR};
use vhostd_api::error::{ErrorCode, NetError, NetResult};
use vhostd_api::request::{BondAttrs, BootProto, NetworkAttrs, SetupOptions, SetupRequest};

use crate::net::canonicalize::canonicalize_networks;
use crate::net::configurator::{
    bridge_only_config, BackendKind, ConfiguratorScope,
};
use crate::net::hooks;
use crate::net::models::{
    self, objectivize, objectivize_bond, prefix_to_netmask, stp_from_opts, DeviceKind,
    FlatNetwork, Ipv4Config, Ipv6Config, NetDev,
};
use crate::net::netinfo::{NetInfo, NetworkChain};
use crate::net::running_config::{PersistenceMode, RunningConfig};

/// Add/Edit/Remove configuration for networks and bondings.
///
/// Networks not named in the request are left untouched. A network attached
/// to a bonding need not re-specify the bonding, and vice versa.
#[tracing::instrument(skip_all)]
pub fn setup_networks(request: SetupRequest, config: &AgentConfig) -> Result<(), Error> {
    let SetupRequest {
        mut networks,
        bondings,
        options,
    } = request;
    debug!(
        "Setting up network according to configuration: networks:{networks:?}, \
         bondings:{bondings:?}, options:{options:?}"
    );

    canonicalize_networks(&mut networks);

    debug!("Validating configuration");
    let current_nics: BTreeSet<String> = sysfs::nics_at(Path::new(sysfs::NET_PATH))
        .context("Failed to enumerate host nics")?
        .into_iter()
        .collect();
    validate_network_setup(&networks, &bondings, &current_nics)?;

    // Hook scripts may mutate the request.
    let mut request = SetupRequest {
        networks,
        bondings,
        options,
    };
    hooks::before_network_setup(&mut request)?;
    let SetupRequest {
        networks,
        bondings,
        options,
    } = &request;

    let mut netinfo = NetInfo::capture().context("Failed to capture host network state")?;

    debug!("Applying...");
    let running_config = RunningConfig::load(
        CONF_DIR,
        PersistenceMode::from_key(&config.net_persistence),
    )?;
    let backend = BackendKind::from_key(&config.net_configurator).create();
    let mut scope = ConfiguratorScope::open(backend, running_config, options.in_rollback);

    match apply(&mut scope, networks, bondings, options, &mut netinfo) {
        Ok(()) => scope.commit()?,
        Err(e) => {
            scope.rollback();
            return Err(e);
        }
    }

    hooks::after_network_setup(&request)?;
    Ok(())
}

fn apply(
    scope: &mut ConfiguratorScope,
    networks: &BTreeMap<String, NetworkAttrs>,
    bondings: &BTreeMap<String, BondAttrs>,
    options: &SetupOptions,
    netinfo: &mut NetInfo,
) -> Result<(), Error> {
    let skip = unchanged_networks(networks, scope.running_config(), netinfo);
    for name in &skip {
        debug!("Network {name} already matches the running config, skipping");
    }

    remove_networks(scope, networks, netinfo, &skip)?;
    bonds_setup(scope, bondings, netinfo)?;
    add_missing_networks(scope, networks, bondings, netinfo, &skip)?;
    check_connectivity(options)
}

/// Networks whose request equals the persisted running config while present
/// and healthy in the kernel: reapplying the current config must not touch
/// the kernel at all.
fn unchanged_networks(
    networks: &BTreeMap<String, NetworkAttrs>,
    running_config: &RunningConfig,
    netinfo: &NetInfo,
) -> BTreeSet<String> {
    networks
        .iter()
        .filter(|(name, attrs)| {
            !attrs.remove
                && running_config.networks().get(*name) == Some(*attrs)
                && netinfo
                    .networks
                    .get(*name)
                    .map(|entry| entry.exists)
                    .unwrap_or(false)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

// Phase (a): network removal.

fn remove_networks(
    scope: &mut ConfiguratorScope,
    networks: &BTreeMap<String, NetworkAttrs>,
    netinfo: &mut NetInfo,
    skip: &BTreeSet<String>,
) -> Result<(), Error> {
    for (name, attrs) in networks {
        if skip.contains(name) {
            continue;
        }
        match netinfo.networks.get(name) {
            Some(entry) if entry.exists => {
                debug!("Removing network {name}");
                let keep_bridge =
                    should_keep_bridge(attrs, entry.bridged, netinfo.kernel_network_attrs(name));
                del_network(scope, netinfo, name, keep_bridge, false)?;
                netinfo.del_network(name);
                netinfo.update_devices()?;
            }
            Some(_) => {
                debug!("Removing broken network {name}");
                del_broken_network(scope, netinfo, name)?;
                netinfo.del_network(name);
                netinfo.update_devices()?;
            }
            None if attrs.remove => {
                return Err(NetError::new(
                    ErrorCode::BadBridge,
                    format!("Cannot delete network {name}: It doesn't exist in the system"),
                )
                .into());
            }
            None => {}
        }
    }
    Ok(())
}

/// The keys of a network request the kernel snapshot can corroborate.
const KEEP_BRIDGE_KEYS: [&str; 5] = ["bridged", "bootproto", "stp", "ipaddr", "prefix"];

/// A bridge survives network reconfiguration only when nothing at the bridge
/// level changes; link-layer attributes (bonding, nic, mtu, vlan) are
/// rewired below it. MTU is special-cased since the kernel tracks a running
/// bridge MTU automatically.
fn should_keep_bridge(
    attrs: &NetworkAttrs,
    currently_bridged: bool,
    kernel_attrs: Option<BTreeMap<String, Value>>,
) -> bool {
    if attrs.remove {
        return false;
    }
    let should_be_bridged = attrs.bridged.unwrap_or(true);
    if currently_bridged && !should_be_bridged {
        return false;
    }
    if !currently_bridged {
        return true;
    }

    let Some(kernel) = kernel_attrs else {
        return false;
    };
    let mut requested = bridge_only_config(attrs);
    if let Some(netmask) = requested.remove("netmask") {
        if let Some(prefix) = netmask
            .as_str()
            .and_then(|m| models::netmask_to_prefix(m).ok())
        {
            requested.insert("prefix".to_string(), Value::from(prefix));
        }
    }
    for key in KEEP_BRIDGE_KEYS {
        if requested.get(key) != kernel.get(key) {
            debug!("the bridge is being reconfigured ({key} differs)");
            return false;
        }
    }
    true
}

fn del_network(
    scope: &mut ConfiguratorScope,
    netinfo: &NetInfo,
    name: &str,
    keep_bridge: bool,
    bypass_validation: bool,
) -> Result<(), Error> {
    let chain = netinfo.network_chain(name)?;
    let entry = netinfo
        .networks
        .get(name)
        .ok_or_else(|| NetError::new(ErrorCode::BadBridge, format!("unknown network {name}")))?
        .clone();

    info!(
        "Removing network {name} with vlan={:?}, bonding={:?}, nics={:?}, keep_bridge={keep_bridge}",
        chain.vlan, chain.bonding, chain.nics
    );

    if !bypass_validation {
        validate_del_network(name, &chain, entry.bridged && !keep_bridge, netinfo)?;
    }

    let prior_qos = scope
        .running_config()
        .networks()
        .get(name)
        .and_then(|attrs| attrs.host_qos.clone());
    scope.running_config_mut().remove_network(name);

    let mut net_ent = objectivize(
        FlatNetwork {
            bridge: entry.bridged.then_some(name),
            vlan_name: chain.vlan.as_deref(),
            vlan_id: chain.vlan_id,
            bonding: chain.bonding.as_deref(),
            nic: if chain.bonding.is_none() {
                chain.nics.first().map(String::as_str)
            } else {
                None
            },
            implicit_bonding: false,
            ..Default::default()
        },
        netinfo,
    )?;
    net_ent.ipv4.bootproto = if entry.dhcpv4 {
        BootProto::Dhcp
    } else {
        BootProto::None
    };

    let net_ent_to_remove = if entry.bridged && keep_bridge {
        // The bridge stays; everything underneath goes. The configurator
        // refuses to remove an enslaved device, so detach it first.
        if let Some(port) = &net_ent.port {
            scope.disconnect_bridge_port(&net_ent.name, &port.name)?;
        }
        net_ent.port.as_deref()
    } else {
        Some(&net_ent)
    };

    // The libvirt network must be deregistered before the device is
    // destroyed, or the kernel refuses to remove a device believed in use.
    scope.remove_libvirt_network(name)?;
    if let Some(dev) = net_ent_to_remove {
        info!("Removing network entity {}", dev.name);
        dev.remove(scope)?;
    }

    // QoS goes last so no device nor network still marks it as used.
    let backing = net_ent.backing_device();
    if device_in_snapshot(netinfo, &backing.name) {
        scope.remove_qos(&net_ent, prior_qos.as_ref())?;
    }
    Ok(())
}

fn device_in_snapshot(netinfo: &NetInfo, iface: &str) -> bool {
    netinfo.nics.contains(iface)
        || netinfo.bondings.contains_key(iface)
        || netinfo.mtus.contains_key(iface)
}

fn validate_del_network(
    network: &str,
    chain: &NetworkChain,
    bridge_should_be_clean: bool,
    netinfo: &NetInfo,
) -> NetResult<()> {
    if let Some(bonding) = &chain.bonding {
        let kernel_slaves: BTreeSet<&String> = netinfo
            .bondings
            .get(bonding)
            .map(|b| b.slaves.iter().collect())
            .unwrap_or_default();
        let chain_nics: BTreeSet<&String> = chain.nics.iter().collect();
        if chain_nics != kernel_slaves {
            return Err(NetError::new(
                ErrorCode::BadNic,
                format!("delete network: {:?} are not all nics enslaved to {bonding}", chain.nics),
            ));
        }
    }
    if bridge_should_be_clean {
        assert_bridge_clean(network, chain, netinfo)?;
    }
    Ok(())
}

/// A bridge about to be destroyed must carry exactly the ifaces the network
/// owns; anything else connected means the bridge is still in use.
fn assert_bridge_clean(bridge: &str, chain: &NetworkChain, netinfo: &NetInfo) -> NetResult<()> {
    let ports: BTreeSet<String> = netinfo
        .bridges
        .get(bridge)
        .map(|ports| ports.iter().cloned().collect())
        .unwrap_or_default();
    let mut ifaces: BTreeSet<String> = chain.nics.iter().cloned().collect();
    if let Some(vlan) = &chain.vlan {
        ifaces.insert(vlan.clone());
    } else if let Some(bonding) = &chain.bonding {
        ifaces.insert(bonding.clone());
    }

    let brifs: Vec<&String> = ports.difference(&ifaces).collect();
    if !brifs.is_empty() {
        return Err(NetError::new(
            ErrorCode::UsedBridge,
            format!("bridge {bridge} has interfaces {brifs:?} connected"),
        ));
    }
    Ok(())
}

/// A network still registered with libvirt whose backing device vanished
/// from the kernel. There is nothing left to tear down below it.
fn del_broken_network(
    scope: &mut ConfiguratorScope,
    netinfo: &NetInfo,
    name: &str,
) -> Result<(), Error> {
    let entry = netinfo
        .networks
        .get(name)
        .ok_or_else(|| NetError::new(ErrorCode::BadBridge, format!("unknown network {name}")))?;
    if !entry.exists {
        scope.remove_libvirt_network(name)?;
        scope.running_config_mut().remove_network(name);
        return Ok(());
    }
    del_network(scope, netinfo, name, false, true)
}

// Phase (b): bondings.

fn bonds_setup(
    scope: &mut ConfiguratorScope,
    bondings: &BTreeMap<String, BondAttrs>,
    netinfo: &mut NetInfo,
) -> Result<(), Error> {
    debug!(
        "Starting bondings setup. bonds={bondings:?}, in_rollback={}",
        scope.in_rollback()
    );
    netinfo.update_devices()?;
    let (remove, edit, add) = bonds_classification(bondings, netinfo);
    bonds_remove(scope, &remove, netinfo)?;
    bonds_edit(scope, &edit, netinfo)?;
    bonds_add(scope, &add, netinfo)?;
    Ok(())
}

type BondPartition<'a> = (
    Vec<&'a String>,
    BTreeMap<&'a String, &'a BondAttrs>,
    BTreeMap<&'a String, &'a BondAttrs>,
);

/// Divides bondings according to whether they are to be removed, edited or
/// added.
fn bonds_classification<'a>(
    bondings: &'a BTreeMap<String, BondAttrs>,
    netinfo: &NetInfo,
) -> BondPartition<'a> {
    let mut remove = Vec::new();
    let mut edit = BTreeMap::new();
    let mut add = BTreeMap::new();
    for (name, attrs) in bondings {
        if attrs.remove {
            remove.push(name);
        } else if netinfo.bondings.contains_key(name) {
            edit.insert(name, attrs);
        } else {
            add.insert(name, attrs);
        }
    }
    (remove, edit, add)
}

fn bonds_remove(
    scope: &mut ConfiguratorScope,
    bonds: &[&String],
    netinfo: &mut NetInfo,
) -> Result<(), Error> {
    for name in bonds {
        if !bond_valid_for_removal(scope, name, netinfo)? {
            continue;
        }
        let bond = objectivize_bond(name, None, None, None, netinfo, true)?;
        debug!("Removing bond {name}");
        bond.remove(scope)?;
        netinfo.del_bonding(name);
    }
    Ok(())
}

fn bond_valid_for_removal(
    scope: &ConfiguratorScope,
    bond: &str,
    netinfo: &NetInfo,
) -> Result<bool, Error> {
    if !netinfo.bondings.contains_key(bond) {
        if scope.in_rollback() {
            error!("Cannot remove bonding {bond} during rollback: does not exist");
            return Ok(false);
        }
        return Err(NetError::new(
            ErrorCode::BadBonding,
            format!("Cannot remove bonding {bond}: does not exist"),
        )
        .into());
    }

    // Network removal precedes bond handling, so every assigned network is
    // already gone; anything left is a real user.
    let users = netinfo.iface_users(bond);
    if !users.is_empty() {
        return Err(NetError::new(
            ErrorCode::UsedBond,
            format!("Cannot remove bonding {bond}: used by another interfaces {users:?}"),
        )
        .into());
    }
    Ok(true)
}

fn bonds_edit(
    scope: &mut ConfiguratorScope,
    bonds: &BTreeMap<&String, &BondAttrs>,
    netinfo: &mut NetInfo,
) -> Result<(), Error> {
    for (name, attrs) in bonds {
        if bonding_unchanged(scope.running_config(), netinfo, name, attrs) {
            debug!("Bonding {name} already matches the running config, skipping");
            continue;
        }
        let current: BTreeSet<String> = netinfo
            .bondings
            .get(*name)
            .map(|b| b.slaves.iter().cloned().collect())
            .unwrap_or_default();
        let requested: BTreeSet<&String> = attrs.nics.iter().collect();
        let slaves_to_remove: Vec<&String> =
            current.iter().filter(|s| !requested.contains(s)).collect();
        debug!("Editing bond {name}, removing slaves {slaves_to_remove:?}");
        for slave in slaves_to_remove {
            scope.remove_slave(name, slave)?;
        }
    }

    // The freed nics must be visible before re-objectivizing the bonds.
    netinfo.update_devices()?;

    for (name, attrs) in bonds {
        if bonding_unchanged(scope.running_config(), netinfo, name, attrs) {
            continue;
        }
        let prior_options = netinfo
            .bondings
            .get(*name)
            .map(|b| b.options.clone())
            .unwrap_or_default();
        let bond = objectivize_bond(
            name,
            Some(&attrs.nics),
            attrs.options.as_deref(),
            None,
            netinfo,
            false,
        )?;
        debug!("Editing bond {name} with options {:?}", attrs.options);
        scope.edit_bonding(&bond, &prior_options)?;
    }
    Ok(())
}

fn bonding_unchanged(
    running_config: &RunningConfig,
    netinfo: &NetInfo,
    name: &str,
    attrs: &BondAttrs,
) -> bool {
    if running_config.bonds().get(name) != Some(attrs) {
        return false;
    }
    let kernel_slaves: BTreeSet<&String> = netinfo
        .bondings
        .get(name)
        .map(|b| b.slaves.iter().collect())
        .unwrap_or_default();
    let requested: BTreeSet<&String> = attrs.nics.iter().collect();
    kernel_slaves == requested
}

fn bonds_add(
    scope: &mut ConfiguratorScope,
    bonds: &BTreeMap<&String, &BondAttrs>,
    netinfo: &NetInfo,
) -> Result<(), Error> {
    for (name, attrs) in bonds {
        let bond = objectivize_bond(
            name,
            Some(&attrs.nics),
            attrs.options.as_deref(),
            None,
            netinfo,
            false,
        )?;
        debug!("Creating bond {name} with options {:?}", attrs.options);
        bond.configure(scope)?;
    }
    Ok(())
}

// Phase (c): adding networks.

fn add_missing_networks(
    scope: &mut ConfiguratorScope,
    networks: &BTreeMap<String, NetworkAttrs>,
    bondings: &BTreeMap<String, BondAttrs>,
    netinfo: &mut NetInfo,
    skip: &BTreeSet<String>,
) -> Result<(), Error> {
    netinfo.update_devices()?;

    for (name, attrs) in networks {
        if attrs.remove || skip.contains(name) {
            continue;
        }
        if let Some(bond) = &attrs.bonding {
            check_bonding_availability(bond, bondings, netinfo)?;
        }

        debug!("Adding network {name}");
        if let Err(e) = add_network(scope, netinfo, name, attrs) {
            if is_failed_ifup(&e) {
                debug!("Adding network {name} failed. Running orphan-devices cleanup");
                if let Err(cleanup_err) = emergency_network_cleanup(scope, name, attrs) {
                    warn!("Emergency cleanup of {name} failed: {cleanup_err:#}");
                }
            }
            return Err(e);
        }

        // Things like a bond mtu can change.
        netinfo.update_devices()?;
    }
    Ok(())
}

fn is_failed_ifup(e: &Error) -> bool {
    e.downcast_ref::<NetError>()
        .map(|net| net.code() == ErrorCode::FailedIfup)
        .unwrap_or(false)
}

/// A network's bond must be newly built in this request or already exist.
fn check_bonding_availability(
    bond: &str,
    bondings: &BTreeMap<String, BondAttrs>,
    netinfo: &NetInfo,
) -> NetResult<()> {
    let newly_built = bondings.get(bond).map(|b| !b.remove).unwrap_or(false);
    if !newly_built && !netinfo.bondings.contains_key(bond) {
        return Err(NetError::new(
            ErrorCode::BadParams,
            format!("Bond {bond} does not exist"),
        ));
    }
    Ok(())
}

fn add_network(
    scope: &mut ConfiguratorScope,
    netinfo: &NetInfo,
    name: &str,
    attrs: &NetworkAttrs,
) -> Result<(), Error> {
    if name.is_empty() {
        return Err(NetError::new(
            ErrorCode::BadBridge,
            "Empty network names are not valid",
        )
        .into());
    }

    let mut netmask = attrs.netmask.clone();
    if let Some(prefix) = attrs.prefix {
        if netmask.is_some() {
            return Err(NetError::new(
                ErrorCode::BadParams,
                "Both PREFIX and NETMASK supplied",
            )
            .into());
        }
        netmask = Some(prefix_to_netmask(prefix)?);
    }

    debug!("validating network...");
    if netinfo
        .networks
        .get(name)
        .map(|entry| entry.exists)
        .unwrap_or(false)
    {
        return Err(NetError::new(
            ErrorCode::UsedBridge,
            format!("Network already exists ({name})"),
        )
        .into());
    }
    if let Some(bonding) = &attrs.bonding {
        validate_inter_network_compatibility(netinfo, attrs.vlan, bonding)?;
    } else if let Some(nic) = &attrs.nic {
        validate_inter_network_compatibility(netinfo, attrs.vlan, nic)?;
    }

    info!(
        "Adding network {name} with vlan={:?}, bonding={:?}, nic={:?}, mtu={:?}, bridged={:?}, \
         defaultRoute={:?}",
        attrs.vlan, attrs.bonding, attrs.nic, attrs.mtu, attrs.bridged, attrs.default_route
    );

    // Record the declared state up front; the scope snapshot reverts it if
    // the transaction fails.
    scope.running_config_mut().set_network(name, attrs.clone());

    let bridged = attrs.bridged.unwrap_or(true);
    let net_ent = objectivize(
        FlatNetwork {
            bridge: bridged.then_some(name),
            vlan_id: attrs.vlan,
            bonding: attrs.bonding.as_deref(),
            nic: attrs.nic.as_deref(),
            mtu: attrs.mtu,
            ipv4: Ipv4Config {
                address: attrs.ipaddr.clone(),
                netmask,
                gateway: attrs.gateway.clone(),
                default_route: attrs.default_route.unwrap_or(false),
                bootproto: attrs.bootproto.unwrap_or_default(),
            },
            ipv6: Ipv6Config {
                address: attrs.ipv6addr.clone(),
                gateway: attrs.ipv6gateway.clone(),
                default_route: attrs.default_route.unwrap_or(false),
                autoconf: attrs.ipv6autoconf.unwrap_or(false),
                dhcpv6: attrs.dhcpv6.unwrap_or(false),
            },
            stp: attrs.stp.unwrap_or(false) || stp_from_opts(&attrs.opts),
            implicit_bonding: true,
            ..Default::default()
        },
        netinfo,
    )?;

    if bridged && netinfo.bridges.contains_key(name) {
        // The bridge already exists: configure one level below it and push
        // the MTU to the bridge and all its ports (the kernel updates the
        // bridge's own running MTU from its ports).
        info!("Bridge {name} already exists.");
        update_mtu_for_existing_bridge(scope, netinfo, name, attrs.mtu)?;
        if let Some(port) = &net_ent.port {
            info!("Configuring device {}", port.name);
            port.configure(scope)?;
        }
    } else {
        info!("Configuring device {}", net_ent.name);
        net_ent.configure(scope)?;
    }

    scope.configure_libvirt_network(name, &net_ent)?;
    if let Some(qos) = &attrs.host_qos {
        scope.configure_qos(qos, &net_ent)?;
    }
    Ok(())
}

fn update_mtu_for_existing_bridge(
    scope: &mut ConfiguratorScope,
    netinfo: &NetInfo,
    bridge: &str,
    mtu: Option<u32>,
) -> Result<(), Error> {
    let Some(mtu) = mtu else {
        return Ok(());
    };
    if netinfo.mtus.get(bridge) == Some(&mtu) {
        return Ok(());
    }
    scope.set_iface_mtu(bridge, mtu)?;
    for port in netinfo.bridges.get(bridge).into_iter().flatten() {
        scope.set_iface_mtu(port, mtu)?;
    }
    Ok(())
}

fn validate_inter_network_compatibility(
    netinfo: &NetInfo,
    vlan: Option<u16>,
    iface: &str,
) -> NetResult<()> {
    for (network, tag) in netinfo.networks_and_vlans_for_iface(iface) {
        if tag == vlan {
            return Err(NetError::new(
                ErrorCode::BadParams,
                format!(
                    "interface {iface} cannot be defined with this network since it is already \
                     defined with network {network}"
                ),
            ));
        }
    }
    Ok(())
}

/// Removes all leftovers after a failed network addition, based on what the
/// kernel actually reports now.
fn emergency_network_cleanup(
    scope: &mut ConfiguratorScope,
    network: &str,
    attrs: &NetworkAttrs,
) -> Result<(), Error> {
    let netinfo = NetInfo::capture()?;

    let mut top: Option<NetDev> = None;
    if let Some(bonding) = &attrs.bonding {
        if netinfo.bondings.contains_key(bonding) {
            top = Some(objectivize_bond(bonding, None, None, None, &netinfo, true)?);
        }
    } else if let Some(nic) = &attrs.nic {
        if netinfo.nics.contains(nic) {
            top = Some(models::nic_device(nic));
        }
    }
    if let (Some(tag), Some(below)) = (attrs.vlan, top.take()) {
        let vlan_name = osutils::ip::vlan_name(&below.name, tag);
        if netinfo.vlans.contains_key(&vlan_name) {
            top = Some(NetDev {
                name: vlan_name,
                kind: DeviceKind::Vlan { tag },
                mtu: None,
                ipv4: Ipv4Config::default(),
                ipv6: Ipv6Config::default(),
                port: Some(Box::new(below)),
            });
        } else {
            top = Some(below);
        }
    }
    if attrs.bridged.unwrap_or(true) && netinfo.bridges.contains_key(network) {
        top = Some(NetDev {
            name: network.to_string(),
            kind: DeviceKind::Bridge {
                stp: false,
                duid_source: None,
            },
            mtu: None,
            ipv4: Ipv4Config::default(),
            ipv6: Ipv6Config::default(),
            port: top.map(Box::new),
        });
    }

    if let Some(dev) = top {
        dev.remove(scope)?;
    }
    Ok(())
}

// Phase (d): connectivity check.

fn check_connectivity(options: &SetupOptions) -> Result<(), Error> {
    if !options.connectivity_check {
        return Ok(());
    }
    debug!("Checking connectivity...");
    if !client_seen(
        Path::new(CLIENT_LOG_PATH),
        Duration::from_secs(options.connectivity_timeout),
    ) {
        info!("Connectivity check failed, rolling back");
        return Err(NetError::new(ErrorCode::LostConnection, "connectivity check failed").into());
    }
    Ok(())
}

/// Waits for the client liveness marker's mtime to advance past the start of
/// the check. An absent marker simply has not been written yet.
fn client_seen(marker: &Path, timeout: Duration) -> bool {
    let start = SystemTime::now();
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(mtime) = std::fs::metadata(marker).and_then(|m| m.modified()) {
            if mtime > start {
                return true;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(Duration::from_secs(1).min(deadline - now));
    }
}

// Validation of the canonicalized request, before any mutation.

fn validate_network_setup(
    networks: &BTreeMap<String, NetworkAttrs>,
    bondings: &BTreeMap<String, BondAttrs>,
    current_nics: &BTreeSet<String>,
) -> NetResult<()> {
    for (network, attrs) in networks {
        if attrs.remove {
            validate_network_remove(network, attrs)?;
        } else if let Some(vlan) = attrs.vlan {
            models::validate_vlan_tag(vlan)?;
        }
    }

    for (bonding, attrs) in bondings {
        models::validate_bond_name(bonding)?;
        if let Some(options) = &attrs.options {
            models::parse_bond_options(options)?;
        }
        if attrs.remove {
            continue;
        }
        if attrs.nics.is_empty() {
            return Err(NetError::new(
                ErrorCode::BadParams,
                format!("Must specify nics for bonding {bonding}"),
            ));
        }
        let unknown: Vec<&String> = attrs
            .nics
            .iter()
            .filter(|nic| !current_nics.contains(*nic))
            .collect();
        if !unknown.is_empty() {
            return Err(NetError::new(
                ErrorCode::BadNic,
                format!("Unknown nics in: {:?}", attrs.nics),
            ));
        }
    }
    Ok(())
}

fn validate_network_remove(network: &str, attrs: &NetworkAttrs) -> NetResult<()> {
    if attrs.has_non_removal_attrs() {
        return Err(NetError::new(
            ErrorCode::BadParams,
            format!(
                "Cannot specify any attribute when removing network {network} (other than custom \
                 properties)"
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use serde_json::json;

    use crate::net::configurator::testutil::{scope_with, scope_with_opts, MockBackend};
    use crate::net::netinfo::testutil::snapshot;

    fn code_of(e: &Error) -> ErrorCode {
        e.downcast_ref::<NetError>()
            .unwrap_or_else(|| panic!("not a NetError: {e:#}"))
            .code()
    }

    fn removal_attrs() -> NetworkAttrs {
        NetworkAttrs {
            remove: true,
            ..Default::default()
        }
    }

    fn dhcp_bridged_attrs(nic: &str) -> NetworkAttrs {
        let mut networks = btreemap! {
            "net".to_string() => NetworkAttrs {
                nic: Some(nic.to_string()),
                bootproto: Some(BootProto::Dhcp),
                ..Default::default()
            },
        };
        canonicalize_networks(&mut networks);
        networks.remove("net").unwrap()
    }

    #[test]
    fn test_validate_remove_rejects_other_attrs() {
        let attrs = NetworkAttrs {
            remove: true,
            nic: Some("eth0".into()),
            ..Default::default()
        };
        let err = validate_network_remove("net", &attrs).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadParams);

        let mut custom_only = removal_attrs();
        custom_only.custom = Some(btreemap! {"a".to_string() => "b".to_string()});
        validate_network_remove("net", &custom_only).unwrap();
    }

    #[test]
    fn test_validate_network_setup() {
        let nics: BTreeSet<String> = ["eth1".to_string(), "eth2".to_string()].into();

        // vlan out of range
        let networks = btreemap! {
            "net".to_string() => NetworkAttrs { vlan: Some(4095), nic: Some("eth1".into()), ..Default::default() },
        };
        let err = validate_network_setup(&networks, &BTreeMap::new(), &nics).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadParams);

        // bond without nics
        let bondings = btreemap! {
            "bond0".to_string() => BondAttrs::default(),
        };
        let err = validate_network_setup(&BTreeMap::new(), &bondings, &nics).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadParams);

        // bond with unknown nic
        let bondings = btreemap! {
            "bond0".to_string() => BondAttrs { nics: vec!["eth9".into()], ..Default::default() },
        };
        let err = validate_network_setup(&BTreeMap::new(), &bondings, &nics).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadNic);

        // bad bond options
        let bondings = btreemap! {
            "bond0".to_string() => BondAttrs {
                nics: vec!["eth1".into()],
                options: Some("mode".into()),
                ..Default::default()
            },
        };
        let err = validate_network_setup(&BTreeMap::new(), &bondings, &nics).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadBonding);

        // a removal needs no nics
        let bondings = btreemap! {
            "bond0".to_string() => BondAttrs { remove: true, ..Default::default() },
        };
        validate_network_setup(&BTreeMap::new(), &bondings, &nics).unwrap();
    }

    #[test]
    fn test_should_keep_bridge() {
        let kernel = || {
            Some(btreemap! {
                "bridged".to_string() => json!(true),
                "bootproto".to_string() => json!("dhcp"),
                "stp".to_string() => json!(false),
            })
        };

        let attrs = dhcp_bridged_attrs("eth0");
        assert!(should_keep_bridge(&attrs, true, kernel()));

        // marked for removal
        assert!(!should_keep_bridge(&removal_attrs(), true, kernel()));

        // requested bridgeless
        let mut bridgeless = attrs.clone();
        bridgeless.bridged = Some(false);
        assert!(!should_keep_bridge(&bridgeless, true, kernel()));

        // bridge-level attr changed
        let mut static_net = attrs.clone();
        static_net.bootproto = Some(BootProto::None);
        assert!(!should_keep_bridge(&static_net, true, kernel()));

        // not currently bridged: nothing to keep, trivially true
        assert!(should_keep_bridge(&attrs, false, None));
    }

    #[test]
    fn test_del_network_ordering() {
        let ni = snapshot();
        let (backend, _) = MockBackend::new();
        let (mut scope, log) = scope_with(backend);

        del_network(&mut scope, &ni, "ovirtmgmt", false, false).unwrap();
        scope.commit().unwrap();

        let log = log.lock().unwrap();
        let libvirt = log
            .iter()
            .position(|l| l == "remove_libvirt_network vdsm-ovirtmgmt")
            .expect("libvirt network must be deregistered");
        let bridge = log
            .iter()
            .position(|l| l == "remove_bridge ovirtmgmt")
            .expect("bridge must be removed");
        let qos = log
            .iter()
            .position(|l| l == "clear_qos eth0")
            .expect("qos must be cleared from the backing device");
        assert!(
            libvirt < bridge && bridge < qos,
            "teardown order violated: {log:?}"
        );
        // the dhcp client on the bridge dies with it
        assert!(log.contains(&"stop_dhcp ovirtmgmt".to_string()));
    }

    #[test]
    fn test_del_network_keep_bridge() {
        let ni = snapshot();
        let (backend, _) = MockBackend::new();
        let (mut scope, log) = scope_with(backend);

        del_network(&mut scope, &ni, "ovirtmgmt", true, false).unwrap();
        scope.commit().unwrap();

        let log = log.lock().unwrap();
        assert!(log.contains(&"nomaster eth0".to_string()));
        assert!(
            !log.iter().any(|l| l.starts_with("remove_bridge")),
            "bridge must survive keep_bridge removal: {log:?}"
        );
    }

    #[test]
    fn test_del_network_unclean_bridge() {
        let mut ni = snapshot();
        ni.bridges
            .get_mut("ovirtmgmt")
            .unwrap()
            .push("vnet7".to_string());
        ni.networks.get_mut("ovirtmgmt").unwrap().ports = vec!["eth0".into(), "vnet7".into()];

        let (backend, _) = MockBackend::new();
        let (mut scope, _log) = scope_with(backend);

        let err = del_network(&mut scope, &ni, "ovirtmgmt", false, false).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::UsedBridge);

        // keep_bridge skips the bridge-clean assertion
        del_network(&mut scope, &ni, "ovirtmgmt", true, false).unwrap();
        scope.commit().unwrap();
    }

    #[test]
    fn test_remove_nonexistent_network() {
        let mut ni = NetInfo::default();
        let (backend, _) = MockBackend::new();
        let (mut scope, _log) = scope_with(backend);

        let networks = btreemap! {"ghost".to_string() => removal_attrs()};
        let err =
            remove_networks(&mut scope, &networks, &mut ni, &BTreeSet::new()).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::BadBridge);
        scope.rollback();
    }

    #[test]
    fn test_del_broken_network() {
        let mut ni = snapshot();
        ni.networks.get_mut("vlan100").unwrap().exists = false;
        let (backend, _) = MockBackend::new();
        let (mut scope, log) = scope_with(backend);

        del_broken_network(&mut scope, &ni, "vlan100").unwrap();
        scope.commit().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.as_slice(), ["remove_libvirt_network vdsm-vlan100"]);
    }

    #[test]
    fn test_bonds_classification() {
        let ni = snapshot();
        let bondings = btreemap! {
            "bond0".to_string() => BondAttrs { nics: vec!["eth1".into()], ..Default::default() },
            "bond1".to_string() => BondAttrs { nics: vec!["eth3".into()], ..Default::default() },
            "bond2".to_string() => BondAttrs { remove: true, ..Default::default() },
        };
        let (remove, edit, add) = bonds_classification(&bondings, &ni);
        assert_eq!(remove, vec![&"bond2".to_string()]);
        assert!(edit.contains_key(&"bond0".to_string()));
        assert!(add.contains_key(&"bond1".to_string()));
    }

    #[test]
    fn test_bond_removal_validation() {
        let ni = snapshot();
        let (backend, _) = MockBackend::new();
        let (scope, _log) = scope_with(backend);

        // bond0 still carries vlan100
        let err = bond_valid_for_removal(&scope, "bond0", &ni).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::UsedBond);

        // unknown bond fails outside rollback
        let err = bond_valid_for_removal(&scope, "bond7", &ni).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::BadBonding);

        // and is skipped during rollback
        let (backend, _) = MockBackend::new();
        let (scope, _log) = scope_with_opts(backend, true);
        assert!(!bond_valid_for_removal(&scope, "bond7", &ni).unwrap());
    }

    #[test]
    fn test_bonds_remove_tears_down_free_bond() {
        let mut ni = snapshot();
        // detach the network from bond0 so it becomes removable
        ni.del_network("vlan100");
        ni.vlans.clear();
        let (backend, _) = MockBackend::new();
        let backend = backend.with_bond("bond0", &["eth1", "eth2"]);
        let (mut scope, log) = scope_with(backend);

        let bond0 = "bond0".to_string();
        bonds_remove(&mut scope, &[&bond0], &mut ni).unwrap();
        scope.commit().unwrap();

        assert!(log.lock().unwrap().contains(&"remove_bond bond0".to_string()));
        assert!(!ni.bondings.contains_key("bond0"));
    }

    #[test]
    fn test_bond_edit_reconciles_slaves() {
        let mut ni = snapshot();
        let (backend, _) = MockBackend::new();
        let backend = backend.with_bond("bond0", &["eth1", "eth2"]);
        let (mut scope, log) = scope_with(backend);

        let name = "bond0".to_string();
        let attrs = BondAttrs {
            nics: vec!["eth2".into(), "eth3".into()],
            ..Default::default()
        };
        let edit = btreemap! {&name => &attrs};
        bonds_edit(&mut scope, &edit, &mut ni).unwrap();
        scope.commit().unwrap();

        let log = log.lock().unwrap();
        assert!(log.contains(&"release_slave bond0 eth1".to_string()));
        assert!(log.contains(&"enslave bond0 eth3".to_string()));
    }

    #[test]
    fn test_add_network_validation() {
        let ni = snapshot();
        let (backend, _) = MockBackend::new();
        let (mut scope, _log) = scope_with(backend);

        let err = add_network(&mut scope, &ni, "", &dhcp_bridged_attrs("eth3")).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::BadBridge);

        let mut both = dhcp_bridged_attrs("eth3");
        both.prefix = Some(24);
        both.netmask = Some("255.255.255.0".into());
        let err = add_network(&mut scope, &ni, "newnet", &both).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::BadParams);

        let err =
            add_network(&mut scope, &ni, "ovirtmgmt", &dhcp_bridged_attrs("eth3")).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::UsedBridge);

        // same vlan on the same lower device as an existing network
        let mut conflicting = dhcp_bridged_attrs("eth3");
        conflicting.nic = None;
        conflicting.bonding = Some("bond0".into());
        conflicting.vlan = Some(100);
        let err = add_network(&mut scope, &ni, "newnet", &conflicting).unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::BadParams);

        scope.rollback();
    }

    #[test]
    fn test_add_network_ordering() {
        let ni = snapshot();
        let (backend, _) = MockBackend::new();
        let (mut scope, log) = scope_with(backend);

        let mut attrs = dhcp_bridged_attrs("eth3");
        attrs.host_qos = Some(json!({"out": {"ls": {"m2": 10_000_000}}}));
        add_network(&mut scope, &ni, "newnet", &attrs).unwrap();

        assert!(scope.running_config().networks().contains_key("newnet"));
        scope.commit().unwrap();

        let log = log.lock().unwrap();
        let nic_up = log.iter().position(|l| l == "link_up eth3").unwrap();
        let bridge = log
            .iter()
            .position(|l| l == "add_bridge newnet stp=false")
            .unwrap();
        let libvirt = log
            .iter()
            .position(|l| l == "define_libvirt_network vdsm-newnet")
            .unwrap();
        let qos = log.iter().position(|l| l == "apply_qos eth3").unwrap();
        assert!(
            nic_up < bridge && bridge < libvirt && libvirt < qos,
            "add order violated: {log:?}"
        );
    }

    #[test]
    fn test_add_network_over_existing_bridge() {
        let mut ni = snapshot();
        // the removal phase has dropped the network but kept the bridge
        ni.del_network("ovirtmgmt");
        let (backend, _) = MockBackend::new();
        let (mut scope, log) = scope_with(backend);

        let mut attrs = dhcp_bridged_attrs("eth0");
        attrs.mtu = Some(9000);
        add_network(&mut scope, &ni, "ovirtmgmt", &attrs).unwrap();
        scope.commit().unwrap();

        let log = log.lock().unwrap();
        assert!(
            !log.iter().any(|l| l.starts_with("add_bridge")),
            "existing bridge must not be recreated: {log:?}"
        );
        // mtu pushed to the bridge and its ports
        assert!(log.contains(&"set_mtu ovirtmgmt 9000".to_string()));
        assert!(log.contains(&"set_mtu eth0 9000".to_string()));
    }

    #[test]
    fn test_check_bonding_availability() {
        let ni = snapshot();
        check_bonding_availability("bond0", &BTreeMap::new(), &ni).unwrap();

        let requested = btreemap! {
            "bond1".to_string() => BondAttrs { nics: vec!["eth3".into()], ..Default::default() },
        };
        check_bonding_availability("bond1", &requested, &ni).unwrap();

        let err = check_bonding_availability("bond9", &BTreeMap::new(), &ni).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadParams);

        let removed = btreemap! {
            "bond0".to_string() => BondAttrs { remove: true, ..Default::default() },
        };
        // still exists in the kernel snapshot, so it remains referencable
        check_bonding_availability("bond0", &removed, &ni).unwrap();
    }

    #[test]
    fn test_unchanged_networks_skip() {
        let ni = snapshot();
        let dir = tempfile::tempdir().unwrap();
        let mut rc = RunningConfig::load(dir.path(), PersistenceMode::Unified).unwrap();

        let attrs = dhcp_bridged_attrs("eth0");
        rc.set_network("ovirtmgmt", attrs.clone());

        let networks = btreemap! {"ovirtmgmt".to_string() => attrs.clone()};
        assert_eq!(
            unchanged_networks(&networks, &rc, &ni),
            BTreeSet::from(["ovirtmgmt".to_string()])
        );

        // a differing request is not skipped
        let mut changed = attrs;
        changed.mtu = Some(9000);
        let networks = btreemap! {"ovirtmgmt".to_string() => changed};
        assert!(unchanged_networks(&networks, &rc, &ni).is_empty());
    }

    #[test]
    fn test_client_seen() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("client.log");

        assert!(!client_seen(&marker, Duration::from_secs(0)));

        let marker_clone = marker.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            std::fs::write(&marker_clone, b"ping").unwrap();
        });
        assert!(client_seen(&marker, Duration::from_secs(5)));
        writer.join().unwrap();
    }

    #[test]
    fn test_connectivity_check_disabled() {
        let options = SetupOptions {
            connectivity_check: false,
            ..Default::default()
        };
        check_connectivity(&options).unwrap();
    }
}
