//! Access to shared storage domains. The concrete domain implementations
//! (NFS, iSCSI, ...) and the handle cache live outside this crate; the
//! monitor consumes them through these traits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use uuid::Uuid;

/// Space statistics of a domain.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DomainStats {
    pub disk_total: Option<u64>,
    pub disk_free: Option<u64>,
    /// VG metadata area size and free bytes (block domains).
    pub mda_size: u64,
    pub mda_free: u64,
    pub mda_valid: bool,
    pub mda_below_threshold: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MasterStats {
    pub valid: bool,
    pub mounted: bool,
}

/// A produced storage domain handle.
pub trait StorageDomain: Send + Sync {
    /// Internal consistency check. May take a long time on loaded hosts.
    fn selftest(&self) -> Result<(), Error>;

    /// Time spent reading the domain metadata. Blocks while the storage
    /// server is unreachable.
    fn read_delay(&self) -> Result<Duration, Error>;

    fn stats(&self) -> Result<DomainStats, Error>;

    fn validate_master(&self) -> Result<MasterStats, Error>;

    fn version(&self) -> Result<i32, Error>;

    fn is_iso(&self) -> Result<bool, Error>;

    /// Images directory of an ISO domain.
    fn iso_images_dir(&self) -> Result<String, Error>;

    fn has_host_id(&self, host_id: u32) -> Result<bool, Error>;

    /// Requests the host-id lease. The request is asynchronous on the
    /// lease manager side; completion is observed through `has_host_id`.
    fn acquire_host_id(&self, host_id: u32) -> Result<(), Error>;

    fn release_host_id(&self, host_id: u32) -> Result<(), Error>;
}

/// Produces domain handles, caching them between calls.
pub trait DomainCache: Send + Sync {
    fn produce(&self, sd_uuid: Uuid) -> Result<Arc<dyn StorageDomain>, Error>;

    /// Drops a cached handle so the next `produce` re-reads the domain
    /// (it may have been upgraded).
    fn invalidate(&self, sd_uuid: Uuid);
}
