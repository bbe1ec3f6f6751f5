// Configuration constants

use const_format::concatcp;

/// Root of the agent's persisted state.
pub const P_VHOSTD: &str = "/var/lib/vhostd/";

/// Directory holding the declarative running network configuration.
pub const CONF_DIR: &str = concatcp!(P_VHOSTD, "netconf/");

/// Directory holding the last configuration declared safe.
pub const CONF_SAFE_DIR: &str = concatcp!(P_VHOSTD, "netconf.safe/");

/// Volatile runtime configuration (cleared on reboot).
pub const CONF_RUN_DIR: &str = "/run/vhostd/netconf/";

/// Per-mode bonding option defaults, produced by `dump-bonding-options`.
pub const BONDING_DEFAULTS_PATH: &str = concatcp!(P_VHOSTD, "bonding-defaults.json");

/// Per-mode bonding option name-to-numeric tables, produced by
/// `dump-bonding-options`.
pub const BONDING_NAME2NUMERIC_PATH: &str = concatcp!(P_VHOSTD, "bonding-name2numeric.json");

/// Client liveness marker; its mtime advances whenever a management client
/// talks to the agent. The connectivity check observes it.
pub const CLIENT_LOG_PATH: &str = "/var/log/vhostd/client.log";

/// Hook scripts live in `<HOOKS_DIR>/<hook-point>/`.
pub const HOOKS_DIR: &str = "/usr/libexec/vhostd/hooks";

/// Default agent configuration file.
pub const CONFIG_PATH: &str = "/etc/vhostd/vhostd.conf";

/// Kernel network device tree.
pub const NET_SYSFS: &str = "/sys/class/net";

/// Write `+<name>`/`-<name>` here to create/delete a bond.
pub const BONDING_MASTERS: &str = "/sys/class/net/bonding_masters";

/// 802.1q registry maintained by the kernel.
pub const VLAN_PROC_CONF: &str = "/proc/net/vlan/config";

/// Libvirt networks owned by the agent carry this prefix.
pub const LIBVIRT_NET_PREFIX: &str = "vdsm-";

/// Default MTU assigned to networks that do not request one.
pub const DEFAULT_MTU: u32 = 1500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        assert_eq!(CONF_DIR, "/var/lib/vhostd/netconf/");
        assert_eq!(BONDING_DEFAULTS_PATH, "/var/lib/vhostd/bonding-defaults.json");
        assert!(BONDING_NAME2NUMERIC_PATH.starts_with(P_VHOSTD));
    }
}
