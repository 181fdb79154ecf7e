//! Multipath device resolution.
//!
//! A multipathed volume shows up in several places depending on whether
//! multipath friendly names are enabled:
//!
//! ```text
//! friendly names on:   /dev/disk/by-id/dm-uuid-mpath-<WWN>
//!                      /dev/disk/by-id/dm-name-mpath<N>
//!                      /dev/mapper/mpath<N>
//! friendly names off:  /dev/disk/by-id/dm-uuid-mpath-<WWN>
//!                      /dev/mapper/<WWN>
//! ```

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FcError, Result};
use crate::host::Host;
use crate::retry::{run_with_retry, wait_for_path};

/// Device mapper name directory
pub const MAPPER_DIR: &str = "/dev/mapper";

/// Prefix of the canonical by-id link for a multipath map
pub const DM_UUID_MPATH_PREFIX: &str = "/dev/disk/by-id/dm-uuid-mpath-";

/// Page 0x83 identifier query tool shipped with udev
pub const SCSI_ID_TOOL: &str = "/lib/udev/scsi_id";

/// multipath(8) prefixes its log noise with a syslog style timestamp
static MULTIPATH_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\w{3} \d+ \d\d:\d\d:\d\d \|.*$").expect("valid multipath error regex")
});

static MULTIPATH_WWID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((?P<wwid>.+)\)").expect("valid multipath wwid regex"));

/// A member path line carries an `H:C:T:L` address
static MULTIPATH_PATH_CHECK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+\d+:\d+:\d+:\d+\s+").expect("valid multipath path regex")
});

/// Words multipath puts in front of the map name when it just acted on it.
const MULTIPATH_DEVICE_ACTIONS: &[&str] = &[
    "unchanged:",
    "reject:",
    "reload:",
    "switchpg:",
    "rename:",
    "create:",
    "resize:",
];

/// One SCSI path under a multipath map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathLeg {
    /// Leaf device, e.g. `/dev/sdb`
    pub device: String,
    pub host: String,
    pub channel: String,
    pub id: String,
    pub lun: String,
}

/// A multipath map and its member paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathDevice {
    /// Mapper device, e.g. `/dev/mapper/mpatha`
    pub device: String,
    /// WWID of the map, or the map name when multipath didn't print one
    pub id: String,
    pub name: String,
    pub legs: Vec<MultipathLeg>,
}

/// Parse `multipath -l <dev>` output.
///
/// Returns `None` when the output holds no map. The `/dev/mapper` device is
/// not checked here.
pub fn parse_multipath_output(output: &str) -> Option<MultipathDevice> {
    let lines: Vec<&str> = output
        .trim()
        .lines()
        .filter(|l| !l.is_empty() && !MULTIPATH_ERROR_RE.is_match(l))
        .collect();
    let (header, rest) = lines.split_first()?;

    let mut words = header.split_whitespace();
    let mut name = words.next()?;
    if MULTIPATH_DEVICE_ACTIONS.contains(&name) {
        name = words.next()?;
    }

    let id = MULTIPATH_WWID_RE
        .captures(header)
        .map(|caps| caps["wwid"].to_string())
        .unwrap_or_else(|| name.to_string());

    let mut legs = Vec::new();
    for line in rest {
        if line.contains("policy") || !MULTIPATH_PATH_CHECK_RE.is_match(line) {
            continue;
        }
        let leg_line = line.trim_start_matches([' ', '|', '-', '`']);
        let mut fields = leg_line.split_whitespace();
        let (Some(address), Some(dev)) = (fields.next(), fields.next()) else {
            continue;
        };
        let address: Vec<&str> = address.split(':').collect();
        if address.len() != 4 {
            debug!(line = %line, "Skipping malformed multipath path line");
            continue;
        }
        legs.push(MultipathLeg {
            device: format!("/dev/{}", dev),
            host: address[0].to_string(),
            channel: address[1].to_string(),
            id: address[2].to_string(),
            lun: address[3].to_string(),
        });
    }

    Some(MultipathDevice {
        device: format!("{}/{}", MAPPER_DIR, name),
        id,
        name: name.to_string(),
        legs,
    })
}

/// Read the page 0x83 WWN of a SCSI device.
///
/// `scsi_id` exits cleanly with no output for devices it doesn't handle;
/// that is an error, an empty WWN would match every map.
pub async fn get_scsi_wwn<H: Host>(host: &H, path: &str) -> Result<String> {
    let out = host
        .execute(SCSI_ID_TOOL, &["--page", "0x83", "--whitelisted", path])
        .await?;
    let wwn = out.trim();
    if wwn.is_empty() {
        return Err(FcError::Parse {
            what: "SCSI WWN",
            text: path.to_string(),
        });
    }
    Ok(wwn.to_string())
}

/// Wait for the device file of the multipath map of `wwn`.
///
/// The `dm-uuid-mpath` link is tried first, then `/dev/mapper/<wwn>`, each
/// with its own bounded wait.
pub async fn find_multipath_device_path<H: Host>(
    host: &H,
    wwn: &str,
    attempts: u32,
    interval: Duration,
) -> Result<String> {
    let by_id = format!("{}{}", DM_UUID_MPATH_PREFIX, wwn);
    if wait_for_path(host, Path::new(&by_id), attempts, interval).await {
        return Ok(by_id);
    }

    // For some reason the common path wasn't found, try the mapper name
    let mapper = format!("{}/{}", MAPPER_DIR, wwn);
    if wait_for_path(host, Path::new(&mapper), attempts, interval).await {
        return Ok(mapper);
    }
    Err(FcError::MultipathNotFound(wwn.to_string()))
}

/// Discover the multipath map a SCSI device belongs to.
///
/// Uses the slow `multipath -l` command and screen scrapes its output.
/// `device_name` must be a real device path, not a symlink. Returns
/// `Ok(None)` when the device is not part of a map.
pub async fn find_multipath_device<H: Host>(
    host: &H,
    device_name: &str,
) -> Result<Option<MultipathDevice>> {
    let out = match host.execute("multipath", &["-l", device_name]).await {
        Ok(out) => out,
        Err(FcError::CommandFailed { output, .. }) => {
            debug!(device = %device_name, output = %output.trim(), "multipath -l found no map");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let Some(mpath) = parse_multipath_output(&out) else {
        return Ok(None);
    };
    if !host.path_exists(Path::new(&mpath.device)) {
        return Err(FcError::MultipathNotFound(mpath.device));
    }
    debug!(device = %mpath.device, id = %mpath.id, legs = mpath.legs.len(), "Found multipath map");
    Ok(Some(mpath))
}

/// Check that the block device of `wwn` is writable.
///
/// Multipath maps sometimes come up read-only and need a `multipath -r`
/// to pick up the new state. When the map is read-only the reload is
/// issued and its result returned; callers retry until it goes through.
pub async fn wait_for_rw<H: Host>(host: &H, wwn: &str, device_path: &str) -> Result<()> {
    debug!(device = %device_path, "Checking whether device is read-only");
    let out = host.execute("lsblk", &["-o", "NAME,RO", "-l", "-n"]).await?;

    // Rows look like:
    //   3624a93709a738ed78583fd120013902b (dm-1)  1
    //   sdd                                       0
    for line in out.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (Some(name), Some(ro)) = (parts.first(), parts.last()) else {
            continue;
        };
        let ro: u8 = ro.parse().map_err(|_| FcError::Parse {
            what: "lsblk RO column",
            text: line.to_string(),
        })?;
        if name.contains(wwn) && ro == 1 {
            info!(device = %device_path, "Block device is read-only, reloading multipath");
            host.execute("multipath", &["-r"]).await?;
            return Ok(());
        }
    }
    debug!(device = %device_path, "Block device is not read-only");
    Ok(())
}

/// Flush a multipath map, giving up quietly after the retries.
///
/// Flushes can hang with high connection error rates, so each attempt runs
/// under `timeout`.
pub async fn flush_multipath_device<H: Host>(
    host: &H,
    path: &str,
    attempts: u32,
    interval: Duration,
    timeout: Duration,
) -> bool {
    info!(device = %path, "Flushing multipath device");
    let flushed = run_with_retry("flush_multipath_device", attempts, interval, async |_| {
        match host
            .execute_with_timeout(timeout, "multipath", &["-f", path])
            .await
        {
            Ok(out) => {
                debug!(device = %path, output = %out.trim(), "multipath -f done");
                true
            }
            Err(e) => {
                warn!(device = %path, error = %e, "multipath -f failed");
                false
            }
        }
    })
    .await;
    if !flushed {
        warn!(device = %path, "Giving up flushing multipath device");
    }
    flushed
}

/// `multipathd reconfigure`.
///
/// multipathd loses track of maps as attachments come and go, which makes
/// resize map fail every time; a reconfigure beforehand fixes that.
pub async fn multipath_reconfigure<H: Host>(host: &H) -> Result<()> {
    let out = host.execute("multipathd", &["reconfigure"]).await?;
    info!(output = %out.trim(), "multipathd reconfigure");
    Ok(())
}

/// `multipathd resize map <wwn>`; returns the daemon's reply.
pub async fn multipath_resize_map<H: Host>(
    host: &H,
    wwn: &str,
    timeout: Duration,
) -> Result<String> {
    host.execute_with_timeout(timeout, "multipathd", &["resize", "map", wwn])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPATH_L: &str = "\
Oct 19 10:01:02 | sdb: alua not supported
create: mpatha (3600a0980383039473524496c6a6c4d30) dm-0 NETAPP,LUN C-Mode
size=10G features='4 queue_if_no_path pg_init_retries 50 retain_attached_hw_handle' hwhandler='1 alua' wp=rw
|-+- policy='service-time 0' prio=50 status=active
| |- 6:0:1:1 sdb 8:16 active ready running
| `- 7:0:1:1 sdd 8:48 active ready running
`-+- policy='service-time 0' prio=10 status=enabled
  `- 6:0:2:1 sdc 8:32 active ready running
";

    #[test]
    fn test_parse_action_prefixed_map() {
        let mpath = parse_multipath_output(MULTIPATH_L).unwrap();
        assert_eq!(mpath.name, "mpatha");
        assert_eq!(mpath.device, "/dev/mapper/mpatha");
        assert_eq!(mpath.id, "3600a0980383039473524496c6a6c4d30");
        assert_eq!(mpath.legs.len(), 3);
        assert_eq!(
            mpath.legs[0],
            MultipathLeg {
                device: "/dev/sdb".into(),
                host: "6".into(),
                channel: "0".into(),
                id: "1".into(),
                lun: "1".into(),
            }
        );
        assert_eq!(mpath.legs[1].device, "/dev/sdd");
        assert_eq!(mpath.legs[1].host, "7");
        assert_eq!(mpath.legs[2].device, "/dev/sdc");
        assert_eq!(mpath.legs[2].id, "2");
    }

    #[test]
    fn test_parse_without_friendly_name() {
        let out = "\
3600a0980383039473524496c6a6c4d30 dm-1 NETAPP,LUN C-Mode
size=10G features='0' hwhandler='0' wp=rw
`-+- policy='round-robin 0' prio=0 status=active
  `- 6:0:1:3 sdf 8:80 active undef running
";
        let mpath = parse_multipath_output(out).unwrap();
        assert_eq!(mpath.name, "3600a0980383039473524496c6a6c4d30");
        // No parenthesized WWID: the map name doubles as the id
        assert_eq!(mpath.id, mpath.name);
        assert_eq!(mpath.legs.len(), 1);
        assert_eq!(mpath.legs[0].lun, "3");
    }

    #[test]
    fn test_parse_noise_only() {
        assert!(parse_multipath_output("").is_none());
        assert!(parse_multipath_output("Oct 19 10:01:02 | sdb: not found\n").is_none());
    }
}
