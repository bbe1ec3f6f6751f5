//! Probes the kernel's per-mode bonding option defaults and the
//! name-to-numeric value tables, dumped as JSON artifacts and used at
//! runtime to translate user-specified option values into the numeric form
//! the bonding driver accepts.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Error};
use lazy_static::lazy_static;
use log::{debug, warn};
use maplit::{hashmap, hashset};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use osutils::{files, sysfs};
use vhostd_api::constants::{BONDING_DEFAULTS_PATH, BONDING_NAME2NUMERIC_PATH};

const MAX_BONDING_MODES: u32 = 6;

lazy_static! {
    /// Bonding sysfs entries that describe state, not tunable options.
    static ref EXCLUDED_BONDING_ENTRIES: HashSet<&'static str> = hashset! {
        "slaves",
        "active_slave",
        "mii_status",
        "queue_id",
        "ad_aggregator",
        "ad_num_ports",
        "ad_actor_key",
        "ad_partner_key",
        "ad_partner_mac",
    };

    static ref BONDING_MODE_NAME_TO_NUMBER: std::collections::HashMap<&'static str, &'static str> = hashmap! {
        "balance-rr" => "0",
        "active-backup" => "1",
        "balance-xor" => "2",
        "broadcast" => "3",
        "802.3ad" => "4",
        "balance-tlb" => "5",
        "balance-alb" => "6",
    };
}

type ModeOptions = BTreeMap<String, Value>;
type Name2NumericTable = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

/// Produces both JSON artifacts. All keys are strings; output is sorted and
/// byte-stable across runs on the same kernel.
pub fn dump_bonding_options() -> Result<(), Error> {
    let root = Path::new(sysfs::NET_PATH);
    let defaults = default_bonding_options(root)?;
    write_json_atomic(Path::new(BONDING_DEFAULTS_PATH), &defaults)?;

    let name2numeric = bonding_options_name2numeric(root)?;
    write_json_atomic(Path::new(BONDING_NAME2NUMERIC_PATH), &name2numeric)?;
    Ok(())
}

/// A scratch bond that exists only while being probed. The bond is created
/// anew for every mode: flipping the mode of a configured bond intermittently
/// returns EBUSY.
struct ScanBond {
    name: String,
}

impl ScanBond {
    fn create(name: &str, mode: Option<u32>) -> Result<Self, Error> {
        sysfs::bond_create(name)?;
        let bond = ScanBond { name: name.to_string() };
        if let Some(mode) = mode {
            sysfs::bond_set_opt(name, "mode", &mode.to_string())?;
        }
        Ok(bond)
    }
}

impl Drop for ScanBond {
    fn drop(&mut self) {
        if let Err(e) = sysfs::bond_delete(&self.name) {
            warn!("Failed to remove scratch bond {}: {e:#}", self.name);
        }
    }
}

fn random_iface_name(prefix: &str) -> String {
    // Interface names are capped at 15 characters.
    let entropy = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &entropy[..15 - prefix.len()])
}

fn default_bonding_options(root: &Path) -> Result<BTreeMap<String, ModeOptions>, Error> {
    let bond_name = random_iface_name("bondscan-");

    let default_mode = {
        let _bond = ScanBond::create(&bond_name, None)?;
        sysfs::bond_opts_at(root, &bond_name)?
            .remove("mode")
            .map(value_repr)
    };

    let mut opts = BTreeMap::new();
    for mode in 0..=MAX_BONDING_MODES {
        let _bond = ScanBond::create(&bond_name, Some(mode))?;
        let mut mode_opts: ModeOptions = sysfs::bond_opts_at(root, &bond_name)?
            .into_iter()
            .filter(|(name, _)| !EXCLUDED_BONDING_ENTRIES.contains(name.as_str()))
            .map(|(name, elements)| (name, value_repr(elements)))
            .collect();
        if let Some(default_mode) = &default_mode {
            mode_opts.insert("mode".to_string(), default_mode.clone());
        }
        opts.insert(mode.to_string(), mode_opts);
    }
    Ok(opts)
}

fn bonding_options_name2numeric(root: &Path) -> Result<Name2NumericTable, Error> {
    let bond_name = random_iface_name("bondscan-");
    let mut opts = BTreeMap::new();
    for mode in 0..=MAX_BONDING_MODES {
        let _bond = ScanBond::create(&bond_name, Some(mode))?;
        opts.insert(mode.to_string(), bond_opts_name2numeric(root, &bond_name)?);
    }
    Ok(opts)
}

/// Maps each two-element option of a bond to its `{name: numeric}` table by
/// probing every numeric value the kernel accepts.
fn bond_opts_name2numeric(
    root: &Path,
    bond: &str,
) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
    let dir = root.join(bond).join("bonding");
    let mut opts = BTreeMap::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("Could not list bonding options of {bond}"))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "mode" || EXCLUDED_BONDING_ENTRIES.contains(name.as_str()) {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        if sysfs::bond_opt_elements(&content).len() == 2 {
            opts.insert(name, scan_opt_values(&entry.path())?);
        }
    }
    Ok(opts)
}

/// Writes 0..31 into the option file; every accepted write reveals one
/// `(name, numeric)` pair. EINVAL/EPERM/EACCES ends the scan for the option.
fn scan_opt_values(opt_path: &Path) -> Result<BTreeMap<String, String>, Error> {
    let mut values = BTreeMap::new();
    let mut opt_file = OpenOptions::new()
        .write(true)
        .open(opt_path)
        .with_context(|| format!("Could not open {} for scanning", opt_path.display()))?;

    for numeric in 0..32 {
        if let Err(e) = opt_file.write_all(numeric.to_string().as_bytes()) {
            match e.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::EPERM) | Some(libc::EACCES) => break,
                _ => {
                    return Err(Error::from(e).context(format!(
                        "opt[{}], numeric_val[{numeric}]",
                        opt_path.display()
                    )))
                }
            }
        }
        let elements = sysfs::bond_opt_read_elements(opt_path)?;
        if let [name, numeric] = &elements[..] {
            values.insert(name.clone(), numeric.clone());
        }
    }
    Ok(values)
}

fn value_repr(elements: Vec<String>) -> Value {
    match elements.len() {
        0 => Value::String(String::new()),
        1 => Value::String(elements.into_iter().next().unwrap()),
        _ => Value::Array(elements.into_iter().map(Value::String).collect()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .with_context(|| format!("Failed to render {}", path.display()))?;
    buf.push(b'\n');
    files::write_atomic(path, &buf)
}

/// Translates user-specified bond options into the numeric form the kernel
/// accepts, using the dumped name2numeric table. Unknown values pass through
/// untouched; a missing table disables translation.
pub fn numeric_bond_options(options: &[(String, String)]) -> Vec<(String, String)> {
    let table = match load_name2numeric(Path::new(BONDING_NAME2NUMERIC_PATH)) {
        Ok(table) => table,
        Err(e) => {
            debug!("Bonding option translation unavailable: {e:#}");
            return options.to_vec();
        }
    };
    translate_options(&table, options)
}

/// The numeric value of a named option value in a given mode, per the dumped
/// table.
pub fn get_bonding_option_numeric_val(
    mode: &str,
    option: &str,
    value_name: &str,
) -> Option<String> {
    let table = load_name2numeric(Path::new(BONDING_NAME2NUMERIC_PATH)).ok()?;
    table.get(mode)?.get(option)?.get(value_name).cloned()
}

fn load_name2numeric(path: &Path) -> Result<Name2NumericTable, Error> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Corrupt table {}", path.display()))
}

fn normalize_mode(mode: &str) -> String {
    BONDING_MODE_NAME_TO_NUMBER
        .get(mode)
        .map(|m| m.to_string())
        .unwrap_or_else(|| mode.to_string())
}

fn translate_options(
    table: &Name2NumericTable,
    options: &[(String, String)],
) -> Vec<(String, String)> {
    let mode = options
        .iter()
        .find(|(k, _)| k == "mode")
        .map(|(_, v)| normalize_mode(v))
        .unwrap_or_else(|| "0".to_string());

    options
        .iter()
        .map(|(key, value)| {
            if key == "mode" {
                return (key.clone(), mode.clone());
            }
            let translated = table
                .get(&mode)
                .and_then(|mode_opts| mode_opts.get(key))
                .and_then(|values| values.get(value))
                .cloned();
            (key.clone(), translated.unwrap_or_else(|| value.clone()))
        })
        .collect()
}
