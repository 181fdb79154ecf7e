//! Fibre Channel HBA discovery.
//!
//! Modern kernels expose FC host adapters under `/sys/class/fc_host`;
//! `systool -c fc_host -v` renders them as blocks of `key = "value"` lines,
//! one block per adapter, separated by two blank lines.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{FcError, Result};
use crate::host::Host;

/// Root of the FC host class in sysfs
pub const FC_HOST_SYSFS_PATH: &str = "/sys/class/fc_host";

/// An adapter as reported by systool, identifiers in raw `0x` form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hba {
    /// WWPN, e.g. `0x10000090fa1b2c3d`
    pub port_name: String,
    /// WWNN
    pub node_name: String,
    /// Kernel host id, e.g. `host6`
    pub host_device: String,
    /// Sysfs class device path
    pub device_path: String,
    /// `Online`, `Offline`, `Linkdown`, ...
    pub port_state: Option<String>,
    /// Remaining attributes, kept for diagnostics
    pub attributes: BTreeMap<String, String>,
}

impl Hba {
    fn from_record(mut record: BTreeMap<String, String>) -> Self {
        Self {
            port_name: record.remove("port_name").unwrap_or_default(),
            node_name: record.remove("node_name").unwrap_or_default(),
            host_device: record.remove("ClassDevice").unwrap_or_default(),
            device_path: record.remove("ClassDevicepath").unwrap_or_default(),
            port_state: record.remove("port_state"),
            attributes: record,
        }
    }

    pub fn is_online(&self) -> bool {
        self.port_state.as_deref() == Some("Online")
    }
}

/// Caller-facing adapter summary with `0x` prefixes stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HbaInfo {
    pub port_name: String,
    pub node_name: String,
    pub host_device: String,
    pub device_path: String,
}

impl From<&Hba> for HbaInfo {
    fn from(hba: &Hba) -> Self {
        Self {
            port_name: strip_hex_prefix(&hba.port_name).to_lowercase(),
            node_name: strip_hex_prefix(&hba.node_name).to_lowercase(),
            host_device: hba.host_device.clone(),
            device_path: hba.device_path.clone(),
        }
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Parse `systool -c fc_host -v` output into raw attribute records.
///
/// The first two lines (the `Class = "fc_host"` header and the blank line
/// after it) are skipped. A record ends at two consecutive blank lines; a
/// single blank line inside a record (between the class device and device
/// sections) does not end it.
pub fn parse_systool_records(output: &str) -> Vec<BTreeMap<String, String>> {
    let mut records = Vec::new();
    let mut current = BTreeMap::new();
    let mut last_line = "";

    for raw in output.split('\n').skip(2) {
        let line = raw.trim();
        if line.is_empty() && last_line.is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
        } else {
            let parts: Vec<&str> = line.split('=').collect();
            if parts.len() == 2 {
                let key = parts[0].trim().replace(' ', "");
                let value = parts[1].trim().replace('"', "");
                current.insert(key, value);
            }
        }
        last_line = line;
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

/// Whether the kernel has FC host support loaded.
pub fn has_fc_support<H: Host>(host: &H) -> bool {
    host.path_exists(Path::new(FC_HOST_SYSFS_PATH))
}

/// Discover FC HBAs.
#[instrument(skip(host))]
pub async fn get_fc_hbas<H: Host>(host: &H) -> Result<Vec<Hba>> {
    if !has_fc_support(host) {
        // No FC support in the running kernel, no point running systool
        debug!("No {} on this host", FC_HOST_SYSFS_PATH);
        return Err(FcError::NotSupported);
    }

    let out = host.execute("systool", &["-c", "fc_host", "-v"]).await?;
    if out.is_empty() {
        return Ok(Vec::new());
    }

    let hbas: Vec<Hba> = parse_systool_records(&out)
        .into_iter()
        .map(Hba::from_record)
        .collect();
    info!(count = hbas.len(), "Discovered FC HBAs");
    Ok(hbas)
}

/// Discover FC HBAs in caller-facing form.
pub async fn get_fc_hbas_info<H: Host>(host: &H) -> Result<Vec<HbaInfo>> {
    let hbas = get_fc_hbas(host).await?;
    Ok(hbas.iter().map(HbaInfo::from).collect())
}

/// WWPNs of the online HBAs, without `0x` prefix.
pub async fn get_fc_wwpns<H: Host>(host: &H) -> Result<Vec<String>> {
    let hbas = get_fc_hbas(host).await?;
    Ok(hbas
        .iter()
        .filter(|hba| hba.is_online() && !hba.port_name.is_empty())
        .map(|hba| strip_hex_prefix(&hba.port_name).to_string())
        .collect())
}

/// WWNNs of the online HBAs, without `0x` prefix.
pub async fn get_fc_wwnns<H: Host>(host: &H) -> Result<Vec<String>> {
    let hbas = get_fc_hbas(host).await?;
    Ok(hbas
        .iter()
        .filter(|hba| hba.is_online() && !hba.node_name.is_empty())
        .map(|hba| strip_hex_prefix(&hba.node_name).to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTOOL_OUTPUT: &str = r#"Class = "fc_host"

  Class Device = "host6"
  Class Device path = "/sys/devices/pci0000:00/0000:00:03.0/0000:05:00.2/host6/fc_host/host6"
    dev_loss_tmo        = "30"
    fabric_name         = "0x10000005339ba8b2"
    node_name           = "0x20000090fa1b2c3c"
    port_id             = "0x010200"
    port_name           = "0x10000090fa1b2c3c"
    port_state          = "Online"
    speed               = "8 Gbit"

    Device = "host6"
    Device path = "/sys/devices/pci0000:00/0000:00:03.0/0000:05:00.2/host6"
      uevent              = "DEVTYPE=scsi_host"


  Class Device = "host7"
  Class Device path = "/sys/devices/pci0000:00/0000:00:03.0/0000:05:00.3/host7/fc_host/host7"
    node_name           = "0x20000090fa1b2c3d"
    port_name           = "0x10000090fa1b2c3d"
    port_state          = "Linkdown"

    Device = "host7"
    Device path = "/sys/devices/pci0000:00/0000:00:03.0/0000:05:00.3/host7"


"#;

    #[test]
    fn test_parse_systool_records() {
        let records = parse_systool_records(SYSTOOL_OUTPUT);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["ClassDevice"], "host6");
        assert_eq!(records[0]["port_name"], "0x10000090fa1b2c3c");
        assert_eq!(records[0]["speed"], "8 Gbit");
        // The single blank line before the Device section didn't split the record
        assert_eq!(records[0]["Device"], "host6");
        // Values containing '=' are not split into attributes
        assert!(!records[0].contains_key("uevent"));
        assert_eq!(records[1]["port_state"], "Linkdown");
    }

    #[test]
    fn test_parse_systool_records_is_stable() {
        let first = parse_systool_records(SYSTOOL_OUTPUT);
        let second = parse_systool_records(SYSTOOL_OUTPUT);
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_without_trailing_blank_lines() {
        let out = "Class = \"fc_host\"\n\n  Class Device = \"host3\"\n    port_name = \"0x1\"\n";
        let records = parse_systool_records(out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["port_name"], "0x1");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_systool_records("").is_empty());
        assert!(parse_systool_records("Class = \"fc_host\"\n\n").is_empty());
    }

    #[test]
    fn test_hba_from_record() {
        let records = parse_systool_records(SYSTOOL_OUTPUT);
        let hba = Hba::from_record(records[0].clone());
        assert_eq!(hba.host_device, "host6");
        assert!(hba.device_path.ends_with("/0000:05:00.2/host6/fc_host/host6"));
        assert!(hba.is_online());
        assert_eq!(hba.attributes["fabric_name"], "0x10000005339ba8b2");

        let info = HbaInfo::from(&hba);
        assert_eq!(info.port_name, "10000090fa1b2c3c");
        assert_eq!(info.node_name, "20000090fa1b2c3c");
    }
}
