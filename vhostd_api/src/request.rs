use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::is_default;

/// A `setupNetworks` request: desired networks and bondings plus call
/// options. Names absent from the request are left untouched on the host.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SetupRequest {
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkAttrs>,
    #[serde(default)]
    pub bondings: BTreeMap<String, BondAttrs>,
    #[serde(default)]
    pub options: SetupOptions,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootProto {
    #[default]
    None,
    Dhcp,
    Static,
}

/// Requested attributes of a single network.
///
/// `bonding` and `nic` are mutually exclusive; `netmask` and `prefix` are
/// mutually exclusive. `remove: true` must not be combined with anything but
/// `custom`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NetworkAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootproto: Option<BootProto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6autoconf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcpv6: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridged: Option<bool>,
    #[serde(
        default,
        rename = "defaultRoute",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_route: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stp: Option<bool>,
    #[serde(default, rename = "hostQos", skip_serializing_if = "Option::is_none")]
    pub host_qos: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub remove: bool,
    /// Backend-specific options passed through as-is.
    #[serde(flatten)]
    pub opts: BTreeMap<String, Value>,
}

impl NetworkAttrs {
    /// The set of requested attribute keys, as they appear on the wire.
    /// `remove` and unset options are not included.
    pub fn requested_keys(&self) -> Vec<String> {
        let mut value = serde_json::to_value(self).expect("attrs are always serializable");
        let map = value.as_object_mut().expect("attrs serialize to a map");
        map.remove("remove");
        map.keys().cloned().collect()
    }

    /// True if any attribute other than `remove` and `custom` is set.
    pub fn has_non_removal_attrs(&self) -> bool {
        self.requested_keys().iter().any(|k| k != "custom")
    }
}

/// Requested attributes of a single bonding.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BondAttrs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<String>,
    /// Space-separated `key=value` pairs, e.g. `"mode=4 miimon=100"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub remove: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SetupOptions {
    #[serde(default = "default_true", rename = "connectivityCheck")]
    pub connectivity_check: bool,
    #[serde(
        default = "default_connectivity_timeout",
        rename = "connectivityTimeout"
    )]
    pub connectivity_timeout: u64,
    #[serde(default, rename = "_inRollback")]
    pub in_rollback: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        SetupOptions {
            connectivity_check: true,
            connectivity_timeout: default_connectivity_timeout(),
            in_rollback: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connectivity_timeout() -> u64 {
    4
}
