//! Libvirt network registration. The agent owns a libvirt network per host
//! network; it must be deregistered before the backing device is destroyed,
//! otherwise the kernel considers the device in use.

use std::{io::Write, sync::OnceLock};

use anyhow::{Context, Error};
use regex::Regex;

use crate::dependencies::Dependency;
use crate::exe::RunAndCheck;

/// Renders the definition of a bridged libvirt network.
pub fn bridged_network_xml(libvirt_name: &str, bridge: &str) -> String {
    format!(
        "<network>\n  <name>{libvirt_name}</name>\n  <forward mode='bridge'/>\n  \
         <bridge name='{bridge}'/>\n</network>\n"
    )
}

/// Renders the definition of a bridgeless (passthrough) libvirt network.
pub fn passthrough_network_xml(libvirt_name: &str, iface: &str) -> String {
    format!(
        "<network>\n  <name>{libvirt_name}</name>\n  <forward mode='passthrough'>\n    \
         <interface dev='{iface}'/>\n  </forward>\n</network>\n"
    )
}

/// Pulls the bridge name out of a network definition, if it is bridged.
pub fn bridge_of(xml: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<bridge name='([^']+)'").unwrap())
        .captures(xml)
        .map(|c| c[1].to_string())
}

/// Pulls the passthrough interface out of a network definition, if any.
pub fn iface_of(xml: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<interface dev='([^']+)'").unwrap())
        .captures(xml)
        .map(|c| c[1].to_string())
}

/// All defined libvirt networks, active or not.
pub fn net_list() -> Result<Vec<String>, Error> {
    let output = Dependency::Virsh
        .cmd()
        .args(["net-list", "--all", "--name"])
        .output_and_check()
        .context("Failed to list libvirt networks")?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn net_dumpxml(name: &str) -> Result<String, Error> {
    Dependency::Virsh
        .cmd()
        .args(["net-dumpxml", name])
        .output_and_check()
        .with_context(|| format!("Failed to dump libvirt network {name}"))
}

/// Defines, starts and autostarts a network from its XML definition.
pub fn net_create(xml: &str, name: &str) -> Result<(), Error> {
    let mut file = tempfile::NamedTempFile::new()
        .context("Failed to create temporary network definition")?;
    file.write_all(xml.as_bytes())
        .context("Failed to write network definition")?;

    Dependency::Virsh
        .cmd()
        .arg("net-define")
        .arg(file.path())
        .run_and_check()
        .with_context(|| format!("Failed to define libvirt network {name}"))?;
    Dependency::Virsh
        .cmd()
        .args(["net-autostart", name])
        .run_and_check()
        .with_context(|| format!("Failed to autostart libvirt network {name}"))?;
    Dependency::Virsh
        .cmd()
        .args(["net-start", name])
        .run_and_check()
        .with_context(|| format!("Failed to start libvirt network {name}"))
}

/// Stops and undefines a network. Destroy failures are tolerated since the
/// network may already be inactive.
pub fn net_remove(name: &str) -> Result<(), Error> {
    let _ = Dependency::Virsh
        .cmd()
        .args(["net-destroy", name])
        .run_and_check();
    Dependency::Virsh
        .cmd()
        .args(["net-undefine", name])
        .run_and_check()
        .with_context(|| format!("Failed to undefine libvirt network {name}"))
}
