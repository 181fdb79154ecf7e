//! SCSI host rescans scoped to a volume's target ports.
//!
//! Most arrays get their target ports detected by the FC initiator and sysfs
//! gets populated under `/sys/class/fc_transport`, so we can do a narrow scan
//! with the channel, target id and LUN. For arrays that don't, we fall back to
//! a wildcard scan of the LUN. If all paths to an array of the first kind were
//! down at boot it would look like the second kind, and a broad scan could pull
//! unrelated volumes into the host; `enable_wildcard_scan = false` in the
//! descriptor disables the fallback for drivers that know sysfs is always
//! populated.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::fc::hba::HbaInfo;
use crate::host::Host;
use crate::metrics;
use crate::types::{NormalizedProperties, Target};

/// FC transport class root; one `target<host>:<channel>:<id>` entry per
/// remote port the initiator has seen
pub const FC_TRANSPORT_SYSFS_PATH: &str = "/sys/class/fc_transport";

/// SCSI host class root; each host has a `scan` control file
pub const SCSI_HOST_SYSFS_PATH: &str = "/sys/class/scsi_host";

/// One `<channel> <target> <lun>` scan request. Wildcards are `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTriple {
    pub channel: String,
    pub target: String,
    pub lun: String,
}

impl ScanTriple {
    pub fn wildcard(lun: &str) -> Self {
        Self {
            channel: "-".into(),
            target: "-".into(),
            lun: lun.into(),
        }
    }

    fn scan_value(&self) -> String {
        format!("{} {} {}", self.channel, self.target, self.lun)
    }
}

/// Find the channel and SCSI target id of every target port this HBA sees.
///
/// Targets come from the initiator -> target/LUN map when the descriptor had
/// one with an entry for this HBA, else from the full target list. Returns
/// the triples found plus the LUNs of the targets whose port wasn't found.
pub fn get_hba_channel_scsi_target_lun<H: Host>(
    host: &H,
    hba: &HbaInfo,
    props: &NormalizedProperties,
) -> (Vec<ScanTriple>, BTreeSet<String>) {
    let targets: &[Target] = props
        .initiator_target_lun_map
        .as_ref()
        .and_then(|map| map.get(&hba.port_name.to_lowercase()))
        .map(Vec::as_slice)
        .unwrap_or(props.targets.as_slice());

    // Leave only the number from the host_device field (ie: host6)
    let host_number = hba
        .host_device
        .strip_prefix("host")
        .unwrap_or(&hba.host_device);
    let entry_prefix = format!("target{}:", host_number);

    let entries: Vec<String> = match host.read_dir_names(Path::new(FC_TRANSPORT_SYSFS_PATH)) {
        Ok(names) => names
            .into_iter()
            .filter(|name| name.starts_with(&entry_prefix))
            .collect(),
        Err(e) => {
            debug!(error = %e, "Cannot list {}", FC_TRANSPORT_SYSFS_PATH);
            Vec::new()
        }
    };

    let mut ctls = Vec::new();
    let mut luns_not_found = BTreeSet::new();

    for target in targets {
        let wwpn = target.wwpn.to_lowercase();
        let mut found = false;
        for entry in &entries {
            let port_file = Path::new(FC_TRANSPORT_SYSFS_PATH)
                .join(entry)
                .join("port_name");
            let Ok(port_name) = host.read_to_string(&port_file) else {
                continue;
            };
            if !port_name.to_lowercase().contains(&wwpn) {
                continue;
            }
            // target6:0:1 -> channel 0, target id 1
            let mut parts = entry.split(':').skip(1);
            if let (Some(channel), Some(id), None) = (parts.next(), parts.next(), parts.next()) {
                found = true;
                ctls.push(ScanTriple {
                    channel: channel.to_string(),
                    target: id.to_string(),
                    lun: target.lun.clone(),
                });
            }
        }
        if !found {
            debug!(host = %hba.host_device, wwpn = %wwpn, "Target port not found for HBA");
            luns_not_found.insert(target.lun.clone());
        }
    }
    (ctls, luns_not_found)
}

/// Decide which HBAs to scan and with which triples.
///
/// HBAs that found target ports get narrow scans. When none did and wildcard
/// scanning is allowed, every HBA gets a wildcard scan of each LUN whose port
/// it couldn't find.
pub fn plan_rescan<H: Host>(
    host: &H,
    hbas: &[HbaInfo],
    props: &NormalizedProperties,
) -> Vec<(HbaInfo, Vec<ScanTriple>)> {
    // The initiator map, when present, also tells us which HBAs to use
    let hbas: Vec<&HbaInfo> = match &props.initiator_target_lun_map {
        Some(map) => {
            let filtered: Vec<&HbaInfo> = hbas
                .iter()
                .filter(|hba| map.contains_key(&hba.port_name.to_lowercase()))
                .collect();
            debug!(count = filtered.len(), "Using initiator target map to exclude HBAs");
            filtered
        }
        None => hbas.iter().collect(),
    };

    let mut process = Vec::new();
    let mut skipped = Vec::new();

    for hba in hbas {
        let (ctls, luns_wildcards) = get_hba_channel_scsi_target_lun(host, hba, props);
        if !ctls.is_empty() {
            process.push((hba.clone(), ctls));
        } else if !props.enable_wildcard_scan {
            debug!(
                node_name = %hba.node_name,
                "Skipping HBA, nothing to scan, target port not connected to initiator"
            );
        } else if !process.is_empty() {
            debug!(
                node_name = %hba.node_name,
                "Skipping HBA, target port found on another HBA"
            );
        } else {
            let wildcards = luns_wildcards
                .iter()
                .map(|lun| ScanTriple::wildcard(lun))
                .collect();
            skipped.push((hba.clone(), wildcards));
        }
    }

    if process.is_empty() { skipped } else { process }
}

/// Trigger SCSI scans on the HBAs that should see the volume.
///
/// Scan write failures are logged and otherwise ignored; the caller keeps
/// polling for the device either way.
#[instrument(skip_all)]
pub fn rescan_hosts<H: Host>(host: &H, hbas: &[HbaInfo], props: &NormalizedProperties) {
    metrics::record_rescan();
    let plan = plan_rescan(host, hbas, props);
    if plan.is_empty() {
        info!("No HBAs to rescan");
        return;
    }

    for (hba, ctls) in plan {
        let scan_path = Path::new(SCSI_HOST_SYSFS_PATH)
            .join(&hba.host_device)
            .join("scan");
        for ctl in ctls {
            info!(
                host = %hba.host_device,
                wwnn = %hba.node_name,
                channel = %ctl.channel,
                target = %ctl.target,
                lun = %ctl.lun,
                "Scanning SCSI host"
            );
            if let Err(e) = host.write_sysfs(&scan_path, &ctl.scan_value()) {
                warn!(path = %scan_path.display(), error = %e, "Failed to scan SCSI host");
            }
        }
    }
}
