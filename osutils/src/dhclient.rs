use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::dependencies::Dependency;
use crate::exe::RunAndCheck;

pub const LEASE_DIR: &str = "/var/lib/vhostd/dhclient";
const PID_DIR: &str = "/run/vhostd";

pub fn lease_file(iface: &str) -> PathBuf {
    Path::new(LEASE_DIR).join(format!("dhclient--{iface}.lease"))
}

pub fn pid_file(iface: &str) -> PathBuf {
    Path::new(PID_DIR).join(format!("dhclient-{iface}.pid"))
}

/// Whether a dhclient instance is managing the interface.
pub fn is_active(iface: &str) -> bool {
    pid_file(iface).exists()
}

/// Whether the installed dhclient understands `-df` (read the DHCP unique
/// identifier from another interface's lease file). Older releases do not,
/// in which case DUID inheritance is silently skipped.
pub fn supports_duid_file() -> bool {
    // dhclient prints usage to stderr and exits nonzero on --help; the exit
    // status carries no signal here, only the usage text does.
    Dependency::Dhclient
        .cmd()
        .arg("--help")
        .output()
        .map(|output| {
            let usage = [output.stdout, output.stderr].concat();
            String::from_utf8_lossy(&usage).contains("-df")
        })
        .unwrap_or(false)
}

/// Starts dhclient on the interface. `duid_source` names another interface
/// whose lease provides the DUID, keeping the address stable across
/// reconfiguration.
pub fn start(iface: &str, duid_source: Option<&str>) -> Result<(), Error> {
    let mut cmd = Dependency::Dhclient.cmd();
    cmd.arg("-pf")
        .arg(pid_file(iface))
        .arg("-lf")
        .arg(lease_file(iface));
    if let Some(source) = duid_source {
        if supports_duid_file() {
            cmd.arg("-df").arg(lease_file(source));
        }
    }
    cmd.arg(iface)
        .run_and_check()
        .with_context(|| format!("Failed to start dhclient on {iface}"))
}

/// Stops the dhclient instance managing the interface, if any.
pub fn stop(iface: &str) -> Result<(), Error> {
    if !is_active(iface) {
        return Ok(());
    }
    let _ = Dependency::Dhclient
        .cmd()
        .arg("-x")
        .arg("-pf")
        .arg(pid_file(iface))
        .arg(iface)
        .run_and_check();
    Ok(())
}

pub fn pid_file_v6(iface: &str) -> PathBuf {
    Path::new(PID_DIR).join(format!("dhclient6-{iface}.pid"))
}

/// Starts a DHCPv6 client on the interface.
pub fn start_v6(iface: &str) -> Result<(), Error> {
    Dependency::Dhclient
        .cmd()
        .arg("-6")
        .arg("-pf")
        .arg(pid_file_v6(iface))
        .arg("-lf")
        .arg(Path::new(LEASE_DIR).join(format!("dhclient6--{iface}.lease")))
        .arg(iface)
        .run_and_check()
        .with_context(|| format!("Failed to start dhclient -6 on {iface}"))
}

pub fn stop_v6(iface: &str) -> Result<(), Error> {
    if !pid_file_v6(iface).exists() {
        return Ok(());
    }
    let _ = Dependency::Dhclient
        .cmd()
        .args(["-6", "-x", "-pf"])
        .arg(pid_file_v6(iface))
        .arg(iface)
        .run_and_check();
    Ok(())
}
