use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Error};
use configparser::ini::Ini;
use log::warn;

/// Agent configuration, read from an INI file (see
/// [`crate::constants::CONFIG_PATH`]). Every key has a default so a missing
/// file yields a usable configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    /// `vars.net_configurator` — which backend applies device operations.
    pub net_configurator: String,
    /// `vars.net_persistence` — `unified` (agent-owned JSON) or `legacy`
    /// (backend-owned).
    pub net_persistence: String,
    /// `irs.sd_health_check_delay` — seconds between domain probes.
    pub sd_health_check_delay: Duration,
    /// `irs.repo_stats_cache_refresh_timeout` — seconds after which a cached
    /// domain handle is dropped and re-produced.
    pub repo_stats_cache_refresh_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            net_configurator: "iproute2".to_string(),
            net_persistence: "unified".to_string(),
            sd_health_check_delay: Duration::from_secs(10),
            repo_stats_cache_refresh_timeout: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from `path`, falling back to defaults for missing
    /// keys. A missing file is not an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(AgentConfig::default());
        }

        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        let defaults = AgentConfig::default();
        Ok(AgentConfig {
            net_configurator: ini
                .get("vars", "net_configurator")
                .unwrap_or(defaults.net_configurator),
            net_persistence: ini
                .get("vars", "net_persistence")
                .unwrap_or(defaults.net_persistence),
            sd_health_check_delay: get_seconds(&ini, "irs", "sd_health_check_delay")?
                .unwrap_or(defaults.sd_health_check_delay),
            repo_stats_cache_refresh_timeout: get_seconds(
                &ini,
                "irs",
                "repo_stats_cache_refresh_timeout",
            )?
            .unwrap_or(defaults.repo_stats_cache_refresh_timeout),
        })
    }
}

fn get_seconds(ini: &Ini, section: &str, key: &str) -> Result<Option<Duration>, Error> {
    ini.getint(section, key)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Bad integer for {section}.{key}"))?
        .map(|secs| {
            u64::try_from(secs)
                .map(Duration::from_secs)
                .with_context(|| format!("Negative value for {section}.{key}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::fs;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = AgentConfig::load("/nonexistent/vhostd.conf").unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vhostd.conf");
        fs::write(
            &path,
            indoc! {"
                [vars]
                net_configurator = pyroute2
                [irs]
                sd_health_check_delay = 2
                repo_stats_cache_refresh_timeout = 60
            "},
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.net_configurator, "pyroute2");
        assert_eq!(config.net_persistence, "unified");
        assert_eq!(config.sd_health_check_delay, Duration::from_secs(2));
        assert_eq!(
            config.repo_stats_cache_refresh_timeout,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_bad_integer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vhostd.conf");
        fs::write(&path, "[irs]\nsd_health_check_delay = soon\n").unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }
}
