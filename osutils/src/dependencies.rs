use std::{path::PathBuf, process::Command};

use strum_macros::IntoStaticStr;

/// External tools the agent shells out to.
#[derive(Clone, Copy, Debug, Eq, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Dhclient,
    Ip,
    Tc,
    Udevadm,
    Virsh,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Gets the path for a dependency not in $PATH.
    fn path_override(&self) -> Option<PathBuf> {
        Some(PathBuf::from(match self {
            Self::Dhclient => "/usr/sbin/dhclient",
            Self::Tc => "/usr/sbin/tc",
            _ => return None,
        }))
    }

    /// Resolve the binary, preferring $PATH over the override location.
    pub fn resolve(&self) -> PathBuf {
        which::which(self.name())
            .ok()
            .or_else(|| self.path_override().filter(|p| p.exists()))
            .unwrap_or_else(|| PathBuf::from(self.name()))
    }

    pub fn exists(&self) -> bool {
        which::which(self.name()).is_ok()
            || self.path_override().map(|p| p.exists()).unwrap_or(false)
    }

    /// Builds a `Command` for the dependency.
    pub fn cmd(&self) -> Command {
        Command::new(self.resolve())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(Dependency::Ip.name(), "ip");
        assert_eq!(Dependency::Udevadm.name(), "udevadm");
        assert_eq!(Dependency::Virsh.to_string(), "virsh");
    }

    #[test]
    fn test_resolve_falls_back_to_bare_name() {
        // Whatever the host has installed, resolution never panics and
        // produces a non-empty program path.
        let path = Dependency::Virsh.resolve();
        assert!(!path.as_os_str().is_empty());
    }
}
