//! Persisted declarative record of the currently desired networks and
//! bondings. One JSON file per entity; rewritten atomically when a setup
//! action commits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::warn;

use osutils::files;
use vhostd_api::request::{BondAttrs, NetworkAttrs};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PersistenceMode {
    /// The agent owns canonical JSON of the declared state.
    Unified,
    /// The backend owns persistence; the agent records nothing.
    Legacy,
}

impl PersistenceMode {
    pub fn from_key(key: &str) -> Self {
        match key {
            "unified" => PersistenceMode::Unified,
            "legacy" => PersistenceMode::Legacy,
            other => {
                warn!("Invalid config for net_persistence: {other}. Using unified instead.");
                PersistenceMode::Unified
            }
        }
    }
}

/// In-memory image of the running config, snapshotted and restored as a
/// whole during rollback.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigState {
    pub networks: BTreeMap<String, NetworkAttrs>,
    pub bonds: BTreeMap<String, BondAttrs>,
}

#[derive(Debug)]
pub struct RunningConfig {
    dir: PathBuf,
    mode: PersistenceMode,
    state: ConfigState,
}

impl RunningConfig {
    /// Loads the store from `dir`. A missing directory is an empty config.
    pub fn load(dir: impl Into<PathBuf>, mode: PersistenceMode) -> Result<Self, Error> {
        let dir = dir.into();
        let state = ConfigState {
            networks: read_entries(&dir.join("networks"))?,
            bonds: read_entries(&dir.join("bondings"))?,
        };
        Ok(RunningConfig { dir, mode, state })
    }

    pub fn networks(&self) -> &BTreeMap<String, NetworkAttrs> {
        &self.state.networks
    }

    pub fn bonds(&self) -> &BTreeMap<String, BondAttrs> {
        &self.state.bonds
    }

    pub fn set_network(&mut self, name: &str, attrs: NetworkAttrs) {
        if self.mode == PersistenceMode::Unified {
            self.state.networks.insert(name.to_string(), attrs);
        }
    }

    pub fn remove_network(&mut self, name: &str) {
        if self.mode == PersistenceMode::Unified {
            self.state.networks.remove(name);
        }
    }

    pub fn set_bonding(&mut self, name: &str, attrs: BondAttrs) {
        if self.mode == PersistenceMode::Unified {
            self.state.bonds.insert(name.to_string(), attrs);
        }
    }

    pub fn remove_bonding(&mut self, name: &str) {
        if self.mode == PersistenceMode::Unified {
            self.state.bonds.remove(name);
        }
    }

    pub fn state(&self) -> ConfigState {
        self.state.clone()
    }

    pub fn restore(&mut self, state: ConfigState) {
        self.state = state;
    }

    /// Persists the in-memory state to disk, dropping files for entities no
    /// longer present.
    pub fn save(&self) -> Result<(), Error> {
        if self.mode == PersistenceMode::Legacy {
            return Ok(());
        }
        self.save_to(&self.dir)
    }

    /// Promotes the current state to the given directory; used both for the
    /// regular store and for declaring a configuration safe.
    pub fn save_to(&self, dir: &Path) -> Result<(), Error> {
        write_entries(&dir.join("networks"), &self.state.networks)?;
        write_entries(&dir.join("bondings"), &self.state.bonds)?;
        Ok(())
    }
}

fn read_entries<T: serde::de::DeserializeOwned>(
    dir: &Path,
) -> Result<BTreeMap<String, T>, Error> {
    let mut entries = BTreeMap::new();
    if !dir.exists() {
        return Ok(entries);
    }
    for entry in
        fs::read_dir(dir).with_context(|| format!("Could not list {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let content = fs::read_to_string(entry.path())
            .with_context(|| format!("Could not read {}", entry.path().display()))?;
        let attrs = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt running config entry {}", entry.path().display()))?;
        entries.insert(name, attrs);
    }
    Ok(entries)
}

fn write_entries<T: serde::Serialize>(
    dir: &Path,
    entries: &BTreeMap<String, T>,
) -> Result<(), Error> {
    files::create_dirs(dir)?;
    for (name, attrs) in entries {
        let content = serde_json::to_vec_pretty(attrs).context("Failed to render entry")?;
        files::write_atomic(dir.join(name), &content)?;
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entries.contains_key(&name) {
            fs::remove_file(entry.path())
                .with_context(|| format!("Could not drop stale entry {name}"))?;
        }
    }
    Ok(())
}
