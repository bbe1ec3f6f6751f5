use serde::{Deserialize, Serialize};

/// A single storage-domain probe result, as reported to management clients.
///
/// A fresh status is optimistic (`valid: true`); the first probe replaces it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DomainMonitorStatus {
    /// Description of the last probe failure, if any.
    pub error: Option<String>,
    /// Seconds since the epoch at which the probe completed.
    #[serde(rename = "checkTime")]
    pub check_time: f64,
    pub valid: bool,
    /// Seconds spent reading the domain metadata.
    #[serde(rename = "readDelay")]
    pub read_delay: f64,
    /// `(total, free)` bytes of the domain's data area.
    #[serde(rename = "diskUtilization")]
    pub disk_utilization: (Option<u64>, Option<u64>),
    #[serde(rename = "masterMounted")]
    pub master_mounted: bool,
    #[serde(rename = "masterValid")]
    pub master_valid: bool,
    /// `(size, free)` bytes of the VG metadata area.
    #[serde(rename = "vgMdUtilization")]
    pub vg_md_utilization: (u64, u64),
    #[serde(rename = "vgMdHasEnoughFreeSpace")]
    pub vg_md_has_enough_free_space: bool,
    #[serde(rename = "vgMdFreeBelowThreshold")]
    pub vg_md_free_below_threshold: bool,
    #[serde(rename = "hasHostId")]
    pub has_host_id: bool,
    /// Images directory of an ISO domain. Discovered asynchronously; never
    /// blocks a synchronous status query.
    #[serde(rename = "isoPrefix")]
    pub iso_prefix: Option<String>,
    pub version: i32,
}

impl DomainMonitorStatus {
    pub fn new(check_time: f64) -> Self {
        DomainMonitorStatus {
            error: None,
            check_time,
            valid: true,
            read_delay: 0.0,
            disk_utilization: (None, None),
            master_mounted: false,
            master_valid: false,
            vg_md_utilization: (0, 0),
            vg_md_has_enough_free_space: true,
            vg_md_free_below_threshold: true,
            has_host_id: false,
            iso_prefix: None,
            version: -1,
        }
    }
}
