//! Readers and writers for the kernel network device tree under
//! `/sys/class/net`, plus the 802.1q registry in `/proc/net/vlan/config`.
//!
//! Read helpers take an explicit tree root so the callers' logic can be
//! exercised against a faked tree; the `_at`-less wrappers operate on the
//! live kernel.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

use crate::files::read_file_trim;

pub const NET_PATH: &str = "/sys/class/net";
pub const BONDING_MASTERS: &str = "/sys/class/net/bonding_masters";
pub const VLAN_PROC_CONF: &str = "/proc/net/vlan/config";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VlanInfo {
    /// Device the VLAN rides on.
    pub link: String,
    pub tag: u16,
}

pub fn iface_exists(iface: &str) -> bool {
    Path::new(NET_PATH).join(iface).exists()
}

pub fn list_ifaces() -> Result<Vec<String>, Error> {
    list_ifaces_at(Path::new(NET_PATH))
}

pub fn list_ifaces_at(root: &Path) -> Result<Vec<String>, Error> {
    let mut ifaces = Vec::new();
    for entry in fs::read_dir(root)
        .with_context(|| format!("Could not list network devices in {}", root.display()))?
    {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name != "bonding_masters" {
            ifaces.push(name);
        }
    }
    ifaces.sort();
    Ok(ifaces)
}

pub fn mtu(iface: &str) -> Result<u32, Error> {
    mtu_at(Path::new(NET_PATH), iface)
}

pub fn mtu_at(root: &Path, iface: &str) -> Result<u32, Error> {
    read_file_trim(&root.join(iface).join("mtu"))?
        .parse()
        .with_context(|| format!("Bad mtu value for {iface}"))
}

/// Physical devices: entries backed by a PCI (or other bus) device.
pub fn nics_at(root: &Path) -> Result<Vec<String>, Error> {
    Ok(list_ifaces_at(root)?
        .into_iter()
        .filter(|name| root.join(name).join("device").exists())
        .collect())
}

pub fn is_bridge(iface: &str) -> bool {
    is_bridge_at(Path::new(NET_PATH), iface)
}

pub fn is_bridge_at(root: &Path, iface: &str) -> bool {
    root.join(iface).join("bridge").exists()
}

pub fn bridge_ports(bridge: &str) -> Result<Vec<String>, Error> {
    bridge_ports_at(Path::new(NET_PATH), bridge)
}

pub fn bridge_ports_at(root: &Path, bridge: &str) -> Result<Vec<String>, Error> {
    let brif = root.join(bridge).join("brif");
    let mut ports = Vec::new();
    for entry in fs::read_dir(&brif)
        .with_context(|| format!("Could not list ports of bridge {bridge}"))?
    {
        ports.push(entry?.file_name().to_string_lossy().into_owned());
    }
    ports.sort();
    Ok(ports)
}

pub fn bridge_stp(bridge: &str) -> Result<bool, Error> {
    bridge_stp_at(Path::new(NET_PATH), bridge)
}

pub fn bridge_stp_at(root: &Path, bridge: &str) -> Result<bool, Error> {
    let state = read_file_trim(&root.join(bridge).join("bridge/stp_state"))?;
    Ok(state != "0")
}

/// Bond devices registered with the bonding driver. An absent
/// `bonding_masters` file means the module is not loaded: no bonds.
pub fn bond_masters() -> Result<Vec<String>, Error> {
    bond_masters_at(Path::new(NET_PATH))
}

pub fn bond_masters_at(root: &Path) -> Result<Vec<String>, Error> {
    let path = root.join("bonding_masters");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut masters: Vec<String> = read_file_trim(&path)?
        .split_whitespace()
        .map(str::to_string)
        .collect();
    masters.sort();
    Ok(masters)
}

pub fn bond_exists(name: &str) -> bool {
    Path::new(NET_PATH).join(name).join("bonding").exists()
}

pub fn bond_slaves(bond: &str) -> Result<Vec<String>, Error> {
    bond_slaves_at(Path::new(NET_PATH), bond)
}

pub fn bond_slaves_at(root: &Path, bond: &str) -> Result<Vec<String>, Error> {
    let mut slaves: Vec<String> = read_file_trim(&root.join(bond).join("bonding/slaves"))?
        .split_whitespace()
        .map(str::to_string)
        .collect();
    slaves.sort();
    Ok(slaves)
}

/// Registers a new bond with the bonding driver.
pub fn bond_create(name: &str) -> Result<(), Error> {
    fs::write(BONDING_MASTERS, format!("+{name}"))
        .with_context(|| format!("Failed to create bond {name}"))
}

pub fn bond_delete(name: &str) -> Result<(), Error> {
    fs::write(BONDING_MASTERS, format!("-{name}"))
        .with_context(|| format!("Failed to delete bond {name}"))
}

pub fn bond_opt_path(bond: &str, opt: &str) -> PathBuf {
    Path::new(NET_PATH).join(bond).join("bonding").join(opt)
}

pub fn bond_set_opt(bond: &str, opt: &str, value: &str) -> Result<(), Error> {
    fs::write(bond_opt_path(bond, opt), value)
        .with_context(|| format!("Failed to set bonding option {opt}={value} on {bond}"))
}

/// Splits a bonding option file into its whitespace-separated elements,
/// e.g. `"balance-rr 0"` into `["balance-rr", "0"]`.
pub fn bond_opt_elements(content: &str) -> Vec<String> {
    content.split_whitespace().map(str::to_string).collect()
}

pub fn bond_opt_read_elements(path: &Path) -> Result<Vec<String>, Error> {
    Ok(bond_opt_elements(&read_file_trim(path)?))
}

/// Reads every option file of a bond's `bonding/` directory into raw
/// element lists, keyed by option name.
pub fn bond_opts_at(root: &Path, bond: &str) -> Result<BTreeMap<String, Vec<String>>, Error> {
    let dir = root.join(bond).join("bonding");
    let mut opts = BTreeMap::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("Could not list bonding options of {bond}"))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Some bonding attributes are write-only or not readable in every
        // mode; skip what cannot be read.
        if let Ok(content) = fs::read_to_string(entry.path()) {
            opts.insert(name, bond_opt_elements(&content));
        }
    }
    Ok(opts)
}

pub fn vlans() -> Result<BTreeMap<String, VlanInfo>, Error> {
    let path = Path::new(VLAN_PROC_CONF);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    Ok(parse_vlan_config(&fs::read_to_string(path).with_context(
        || format!("Could not read {VLAN_PROC_CONF}"),
    )?))
}

/// Parses `/proc/net/vlan/config`. The first two lines are headers; data
/// lines read `name | tag | link`.
pub fn parse_vlan_config(content: &str) -> BTreeMap<String, VlanInfo> {
    let mut vlans = BTreeMap::new();
    for line in content.lines().skip(2) {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() != 3 {
            continue;
        }
        let Ok(tag) = fields[1].parse::<u16>() else {
            continue;
        };
        vlans.insert(
            fields[0].to_string(),
            VlanInfo {
                link: fields[2].to_string(),
                tag,
            },
        );
    }
    vlans
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn fake_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for iface in ["eth0", "eth1", "bond0", "br0"] {
            fs::create_dir_all(root.join(iface)).unwrap();
        }
        fs::write(root.join("eth0/mtu"), "1500\n").unwrap();
        fs::create_dir_all(root.join("eth0/device")).unwrap();
        fs::create_dir_all(root.join("eth1/device")).unwrap();
        fs::create_dir_all(root.join("bond0/bonding")).unwrap();
        fs::write(root.join("bond0/bonding/slaves"), "eth1 eth0\n").unwrap();
        fs::write(root.join("bond0/bonding/mode"), "802.3ad 4\n").unwrap();
        fs::write(root.join("bond0/bonding/miimon"), "100\n").unwrap();
        fs::create_dir_all(root.join("br0/bridge")).unwrap();
        fs::write(root.join("br0/bridge/stp_state"), "0\n").unwrap();
        fs::create_dir_all(root.join("br0/brif/bond0")).unwrap();
        fs::write(root.join("bonding_masters"), "bond0\n").unwrap();
        dir
    }

    #[test]
    fn test_list_ifaces_excludes_bonding_masters() {
        let dir = fake_tree();
        assert_eq!(
            list_ifaces_at(dir.path()).unwrap(),
            vec!["bond0", "br0", "eth0", "eth1"]
        );
    }

    #[test]
    fn test_nics_are_bus_backed() {
        let dir = fake_tree();
        assert_eq!(nics_at(dir.path()).unwrap(), vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_bond_inspection() {
        let dir = fake_tree();
        assert_eq!(bond_masters_at(dir.path()).unwrap(), vec!["bond0"]);
        assert_eq!(
            bond_slaves_at(dir.path(), "bond0").unwrap(),
            vec!["eth0", "eth1"]
        );
        let opts = bond_opts_at(dir.path(), "bond0").unwrap();
        assert_eq!(opts["mode"], vec!["802.3ad", "4"]);
        assert_eq!(opts["miimon"], vec!["100"]);
    }

    #[test]
    fn test_bond_masters_without_module() {
        let dir = tempfile::tempdir().unwrap();
        assert!(bond_masters_at(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_bridge_ports() {
        let dir = fake_tree();
        assert!(is_bridge_at(dir.path(), "br0"));
        assert!(!is_bridge_at(dir.path(), "eth0"));
        assert_eq!(bridge_ports_at(dir.path(), "br0").unwrap(), vec!["bond0"]);
        assert!(!bridge_stp_at(dir.path(), "br0").unwrap());
    }

    #[test]
    fn test_mtu() {
        let dir = fake_tree();
        assert_eq!(mtu_at(dir.path(), "eth0").unwrap(), 1500);
    }

    #[test]
    fn test_parse_vlan_config() {
        let content = indoc! {"
            VLAN Dev name    | VLAN ID
            Name-Type: VLAN_NAME_TYPE_RAW_PLUS_VID_NO_PAD
            bond0.100      | 100  | bond0
            eth0.4         | 4  | eth0
        "};
        let vlans = parse_vlan_config(content);
        assert_eq!(vlans.len(), 2);
        assert_eq!(
            vlans["bond0.100"],
            VlanInfo {
                link: "bond0".into(),
                tag: 100
            }
        );
        assert_eq!(vlans["eth0.4"].tag, 4);
    }

    #[test]
    fn test_parse_vlan_config_empty() {
        assert!(parse_vlan_config("").is_empty());
    }
}
