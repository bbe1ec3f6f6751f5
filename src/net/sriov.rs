//! SR-IOV virtual function control through the `sriov_numvfs` sysfs knob.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Error};
use log::info;

use osutils::{files, ip, udevadm};
use vhostd_api::constants::CONF_RUN_DIR;

const UDEV_SETTLE_TIMEOUT: u64 = 10;

fn numvfs_path(pci_path: &str) -> PathBuf {
    PathBuf::from(format!("/sys/bus/pci/devices/{pci_path}/sriov_numvfs"))
}

/// Changes the number of virtual functions of a physical function and
/// persists the count so it survives reboots.
///
/// `pci_path` is a PCI address such as `0000:00:19.0`; `net_name` is the net
/// device of the physical function, brought back up afterwards.
pub fn change_numvfs(pci_path: &str, numvfs: u32, net_name: &str) -> Result<(), Error> {
    info!("Changing number of vfs on device {pci_path} -> {numvfs}");
    update_numvfs(&numvfs_path(pci_path), numvfs)?;
    wait_for_udev_events()?;
    info!("Changing number of vfs on device {pci_path} -> {numvfs} succeeded");

    persist_numvfs(Path::new(CONF_RUN_DIR), net_name, numvfs)?;
    ip::link_up(net_name)
}

fn update_numvfs(path: &Path, numvfs: u32) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Could not open {}", path.display()))?;
    // Zero must be written first to drop previous VFs; writing a nonzero
    // count while any exist returns EBUSY.
    file.write_all(b"0")
        .with_context(|| format!("Could not clear vfs via {}", path.display()))?;
    file.write_all(numvfs.to_string().as_bytes())
        .with_context(|| format!("Could not set {numvfs} vfs via {}", path.display()))?;
    Ok(())
}

/// `udevadm settle` only waits for events already queued; the sleep gives
/// the kernel time to enqueue them, so the new VF netdevs are named before
/// anyone lists them.
fn wait_for_udev_events() -> Result<(), Error> {
    thread::sleep(Duration::from_millis(500));
    udevadm::settle(UDEV_SETTLE_TIMEOUT)
}

fn persist_numvfs(run_dir: &Path, device_name: &str, numvfs: u32) -> Result<(), Error> {
    files::write_atomic(
        run_dir.join("virtual_functions").join(device_name),
        numvfs.to_string().as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_update_numvfs_writes_zero_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sriov_numvfs");
        fs::write(&path, "7").unwrap();

        update_numvfs(&path, 4).unwrap();

        // On a regular file the two discrete writes land back to back; the
        // leading zero is the proof that clearing preceded the new count.
        assert_eq!(fs::read_to_string(&path).unwrap(), "04");
    }

    #[test]
    fn test_update_numvfs_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        update_numvfs(&dir.path().join("sriov_numvfs"), 4).unwrap_err();
    }

    #[test]
    fn test_persist_numvfs() {
        let dir = tempfile::tempdir().unwrap();
        persist_numvfs(dir.path(), "eth0", 4).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("virtual_functions/eth0")).unwrap(),
            "4"
        );
    }
}
