//! Request canonicalization: fills in the documented defaults so the rest of
//! the engine (and the persisted running config) always sees explicit
//! values.

use std::collections::BTreeMap;

use vhostd_api::constants::DEFAULT_MTU;
use vhostd_api::request::{BootProto, NetworkAttrs};

pub fn canonicalize_networks(networks: &mut BTreeMap<String, NetworkAttrs>) {
    for attrs in networks.values_mut() {
        if attrs.remove {
            continue;
        }
        attrs.bridged.get_or_insert(true);
        attrs.bootproto.get_or_insert(BootProto::None);
        attrs.default_route.get_or_insert(false);
        attrs.ipv6autoconf.get_or_insert(false);
        attrs.dhcpv6.get_or_insert(false);
        attrs.mtu.get_or_insert(DEFAULT_MTU);
        if attrs.bridged == Some(true) {
            attrs.stp.get_or_insert(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn test_defaults_applied() {
        let mut networks = btreemap! {
            "net".to_string() => NetworkAttrs {
                nic: Some("eth0".into()),
                ..Default::default()
            },
        };
        canonicalize_networks(&mut networks);

        let attrs = &networks["net"];
        assert_eq!(attrs.bridged, Some(true));
        assert_eq!(attrs.bootproto, Some(BootProto::None));
        assert_eq!(attrs.default_route, Some(false));
        assert_eq!(attrs.ipv6autoconf, Some(false));
        assert_eq!(attrs.dhcpv6, Some(false));
        assert_eq!(attrs.mtu, Some(DEFAULT_MTU));
        assert_eq!(attrs.stp, Some(false));
    }

    #[test]
    fn test_explicit_values_kept() {
        let mut networks = btreemap! {
            "net".to_string() => NetworkAttrs {
                nic: Some("eth0".into()),
                bridged: Some(false),
                bootproto: Some(BootProto::Dhcp),
                mtu: Some(9000),
                ..Default::default()
            },
        };
        canonicalize_networks(&mut networks);

        let attrs = &networks["net"];
        assert_eq!(attrs.bridged, Some(false));
        assert_eq!(attrs.bootproto, Some(BootProto::Dhcp));
        assert_eq!(attrs.mtu, Some(9000));
        // stp is a bridge-level option; bridgeless networks get none
        assert_eq!(attrs.stp, None);
    }

    #[test]
    fn test_removal_untouched() {
        let mut networks = btreemap! {
            "net".to_string() => NetworkAttrs {
                remove: true,
                ..Default::default()
            },
        };
        canonicalize_networks(&mut networks);
        let attrs = &networks["net"];
        assert_eq!(attrs.bridged, None);
        assert_eq!(attrs.mtu, None);
    }
}
