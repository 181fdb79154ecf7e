//! Candidate device path computation.
//!
//! udev names FC LUNs under `/dev/disk/by-path` as
//! `pci-<bus id>-fc-0x<target wwpn>-lun-<lun>`. Zoning decides which of the
//! HBA x target combinations actually show up, so we compute the whole matrix
//! and let the caller check which paths exist.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{FcError, Result};
use crate::fc::hba::HbaInfo;
use crate::host::Host;
use crate::types::Target;

/// Directory holding the stable by-path device links
pub const BY_PATH_DIR: &str = "/dev/disk/by-path";

/// Matches FC by-path entries, capturing any platform prefix in front of
/// `pci-` (e.g. `platform-40000000.pcie-controller-` on some arm64 boards).
static FC_BY_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(.*)pci-[a-z0-9]{4}:[a-z0-9]{2}:[a-z0-9]{2}\.[a-z0-9]+-fc-0x[a-z0-9]{16}-lun-[a-z0-9]+",
    )
    .expect("valid by-path regex")
});

/// One cell of the HBA x target matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    /// PCI bus id of the HBA, e.g. `0000:05:00.2`
    pub pci_id: String,
    /// Target WWPN in `0x`-prefixed lower-case hex
    pub target_wwn: String,
    pub lun: String,
}

/// Bus-level id of an HBA.
///
/// Device paths look like (FC and FCoE respectively):
///
/// ```text
/// /sys/devices/pci0000:00/0000:00:03.0/0000:05:00.3/host2/fc_host/host2
/// /sys/devices/pci0000:20/0000:20:03.0/0000:21:00.2/net/ens2f2/ctlr_2/host3/fc_host/host3
/// ```
///
/// The id is the segment right before the first `host*` or `net*` segment.
pub fn get_pci_num(hba: &HbaInfo) -> Option<&str> {
    let segments: Vec<&str> = hba.device_path.split('/').collect();
    let idx = segments
        .iter()
        .position(|s| s.starts_with("net") || s.starts_with("host"))?;
    if idx == 0 {
        return None;
    }
    Some(segments[idx - 1]).filter(|s| !s.is_empty())
}

/// Cross every HBA with every target.
pub fn get_possible_devices(hbas: &[HbaInfo], targets: &[Target]) -> Vec<CandidateDevice> {
    let mut devices = Vec::new();
    for hba in hbas {
        let Some(pci_id) = get_pci_num(hba) else {
            debug!(host = %hba.host_device, path = %hba.device_path, "No PCI id for HBA");
            continue;
        };
        for target in targets {
            devices.push(CandidateDevice {
                pci_id: pci_id.to_string(),
                target_wwn: format!("0x{}", target.wwpn.to_lowercase()),
                lun: target.lun.clone(),
            });
        }
    }
    devices
}

/// Format a LUN the way the kernel names it in by-path links.
///
/// LUNs below 256 are used as-is. Larger LUNs use the SAM-2 flat addressing
/// form, `0x%04x%04x00000000` of the low and next 16 bits.
pub fn format_lun_id(lun: &str) -> Result<String> {
    let id: u64 = lun
        .trim()
        .parse()
        .map_err(|_| FcError::InvalidLun(lun.to_string()))?;
    if id < 256 {
        Ok(id.to_string())
    } else {
        Ok(format!(
            "0x{:04x}{:04x}00000000",
            id & 0xffff,
            (id >> 16) & 0xffff
        ))
    }
}

/// [`format_lun_id`] over a list.
pub fn process_lun_ids<S: AsRef<str>>(luns: &[S]) -> Result<Vec<String>> {
    luns.iter().map(|l| format_lun_id(l.as_ref())).collect()
}

fn by_path(prefix: &str, dev: &CandidateDevice, lun_id: &str) -> String {
    format!(
        "{}/{}pci-{}-fc-{}-lun-{}",
        BY_PATH_DIR, prefix, dev.pci_id, dev.target_wwn, lun_id
    )
}

/// Look for any FC entry under `/dev/disk/by-path` and return the prefix
/// in front of its `pci-` component.
pub fn get_possible_host_path_prefix<H: Host>(host: &H) -> Result<String> {
    let names = host
        .read_dir_names(Path::new(BY_PATH_DIR))
        .map_err(|e| FcError::io(BY_PATH_DIR, e))?;
    for name in &names {
        if let Some(caps) = FC_BY_PATH_RE.captures(name) {
            debug!(entry = %name, "Found FC by-path entry");
            return Ok(caps[1].to_string());
        }
    }
    Err(FcError::DeviceNotFound(format!("no FC entries under {}", BY_PATH_DIR)))
}

/// Compute the by-path device paths for the candidate devices.
///
/// Paths are built with no prefix first. If a path doesn't resolve, the
/// by-path directory is probed once for the prefix this platform uses and
/// the remaining candidates are built with it. When the probe finds nothing
/// the unprefixed path is kept, since the device may appear after a rescan.
pub fn get_host_devices<H: Host>(host: &H, possible: &[CandidateDevice]) -> Result<Vec<String>> {
    let mut prefix = String::new();
    let mut probed = false;
    let mut host_devices = Vec::with_capacity(possible.len());

    for dev in possible {
        let lun_id = format_lun_id(&dev.lun)
            .map_err(|e| e.context(format!("target {}", dev.target_wwn)))?;
        let mut path = by_path(&prefix, dev, &lun_id);

        let resolves = host
            .real_path(Path::new(&path))
            .map(|real| host.path_exists(&real))
            .unwrap_or(false);
        if !resolves && !probed {
            probed = true;
            match get_possible_host_path_prefix(host) {
                Ok(found) => {
                    if found != prefix {
                        debug!(prefix = %found, "Using by-path prefix");
                        prefix = found;
                        path = by_path(&prefix, dev, &lun_id);
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "No FC by-path entries yet, keeping default path");
                }
            }
        }
        host_devices.push(path);
    }
    Ok(host_devices)
}

/// All by-path locations the volume could show up at.
pub fn get_possible_volume_paths<H: Host>(
    host: &H,
    targets: &[Target],
    hbas: &[HbaInfo],
) -> Result<Vec<String>> {
    let possible = get_possible_devices(hbas, targets);
    get_host_devices(host, &possible)
}
