//! SCSI device lifecycle: probing, flushing, removal and resize.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectorConfig;
use crate::error::{FcError, Result};
use crate::host::Host;
use crate::retry::run_with_retry;
use crate::scsi::multipath::{
    find_multipath_device_path, get_scsi_wwn, multipath_reconfigure, multipath_resize_map,
};
use crate::types::{DeviceInfo, NormalizedProperties};

/// Block class root; `<dev>/device/delete` removes the device
pub const BLOCK_SYSFS_PATH: &str = "/sys/block";

/// sd driver root; `<h:c:t:l>/rescan` re-reads the device capacity
pub const SD_DRIVER_SYSFS_PATH: &str = "/sys/bus/scsi/drivers/sd";

/// SCSI address of a block device as reported by `sg_scan`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiDeviceInfo {
    pub device: String,
    pub host: String,
    pub channel: String,
    pub id: String,
    pub lun: String,
}

impl ScsiDeviceInfo {
    /// `host:channel:id:lun`, the name of the device under the sd driver.
    pub fn address(&self) -> String {
        format!("{}:{}:{}:{}", self.host, self.channel, self.id, self.lun)
    }
}

/// Parse a `sg_scan <dev>` line such as
/// `/dev/sdb: scsi6 channel=0 id=1 lun=1 [em]`.
pub fn parse_sg_scan(device: &str, output: &str) -> ScsiDeviceInfo {
    let mut info = ScsiDeviceInfo {
        device: device.to_string(),
        ..Default::default()
    };
    let line = output.trim();
    let line = line
        .strip_prefix(&format!("{}: ", device))
        .unwrap_or(line);

    for item in line.split_whitespace() {
        if let Some((key, value)) = item.split_once('=') {
            match key {
                "channel" => info.channel = value.to_string(),
                "id" => info.id = value.to_string(),
                "lun" => info.lun = value.to_string(),
                "host" => info.host = value.to_string(),
                _ => {}
            }
        } else if let Some(host) = item.strip_prefix("scsi")
            && !host.is_empty()
            && host.bytes().all(|b| b.is_ascii_digit())
        {
            info.host = host.to_string();
        }
    }
    info
}

/// Check that a block device can actually be read.
pub async fn check_valid_device<H: Host>(host: &H, device: &str) -> bool {
    let input = format!("if={}", device);
    match host
        .execute("dd", &[&input, "of=/dev/null", "count=1"])
        .await
    {
        Ok(_) => true,
        Err(e) => {
            warn!(device = %device, error = %e, "Failed to access the device");
            false
        }
    }
}

/// Query the SCSI address of a device.
pub async fn get_device_info<H: Host>(host: &H, device: &str) -> Result<ScsiDeviceInfo> {
    let out = host
        .execute("sg_scan", &[device])
        .await
        .map_err(|e| e.context(format!("probing SCSI device {}", device)))?;
    debug!(device = %device, output = %out.trim(), "sg_scan");
    Ok(parse_sg_scan(device, &out))
}

/// Flush any I/O left in the buffers of a device.
///
/// With high connection error rates the flush can hang, so every attempt
/// runs under the flush timeout. Giving up is logged, not an error.
pub async fn flush_device_io<H: Host>(host: &H, device: &str, config: &ConnectorConfig) {
    if !host.path_exists(Path::new(device)) {
        return;
    }
    let flushed = run_with_retry(
        "flush_device_io",
        config.flush_attempts,
        config.flush_interval,
        async |_| {
            match host
                .execute_with_timeout(config.flush_timeout, "blockdev", &["--flushbufs", device])
                .await
            {
                Ok(_) => {
                    debug!(device = %device, "Flushed device buffers");
                    true
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "blockdev --flushbufs failed");
                    false
                }
            }
        },
    )
    .await;
    if !flushed {
        warn!(device = %device, "Giving up flushing device buffers");
    }
}

/// Remove a SCSI device given its `/dev/sdX` name.
///
/// A missing `delete` control file means the device is already gone.
pub async fn remove_scsi_device<H: Host>(
    host: &H,
    device: &str,
    flush: bool,
    config: &ConnectorConfig,
) -> Result<()> {
    let name = device.strip_prefix("/dev/").unwrap_or(device);
    let delete = Path::new(BLOCK_SYSFS_PATH)
        .join(name)
        .join("device")
        .join("delete");
    if !host.path_exists(&delete) {
        debug!(device = %device, "SCSI device already removed");
        return Ok(());
    }

    if flush {
        flush_device_io(host, device, config).await;
    }
    info!(device = %device, "Removing SCSI device");
    host.write_sysfs(&delete, "1")
        .map_err(|e| FcError::io(delete.display().to_string(), e))
}

/// Size of a block device in bytes.
pub async fn get_device_size<H: Host>(host: &H, path: &str) -> Result<f64> {
    let out = host.execute("blockdev", &["--getsize64", path]).await?;
    let text = out.trim();
    text.parse::<f64>().map_err(|_| FcError::Parse {
        what: "device size",
        text: text.to_string(),
    })
}

/// Translate a `/dev/disk/by-path` entry to its `/dev/sdX` device.
///
/// `None` when the link doesn't resolve or points outside `/dev`.
pub fn get_name_from_path<H: Host>(host: &H, path: &str) -> Option<String> {
    match host.real_path(Path::new(path)) {
        Ok(real) => {
            let real = real.to_string_lossy().into_owned();
            real.starts_with("/dev/").then_some(real)
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to resolve device path");
            None
        }
    }
}

/// The path the volume manager did I/O through: the attach result first,
/// then the descriptor's `device_path`.
pub fn get_dev_path(props: &NormalizedProperties, device_info: Option<&DeviceInfo>) -> String {
    device_info
        .map(|info| info.path.clone())
        .or_else(|| props.device_path.clone())
        .unwrap_or_default()
}

/// Whether a single path device needs its buffers flushed before removal.
///
/// Only a path that was used directly for I/O needs it. No used path means
/// the attach failed; a multipath map means the paths were never written to
/// directly. Encrypted volumes replace the device link, so a used path that
/// resolves outside `/dev` also gets flushed.
pub fn requires_flush<H: Host>(
    host: &H,
    device_path: &str,
    path_used: &str,
    was_multipath: bool,
) -> Result<bool> {
    if path_used.is_empty() || was_multipath {
        return Ok(false);
    }
    let real_device = host
        .real_path(Path::new(device_path))
        .map_err(|e| FcError::io(device_path, e))?;
    let real_used = host
        .real_path(Path::new(path_used))
        .map_err(|e| FcError::io(path_used, e))?;
    Ok(real_used == real_device || real_used.parent() != Some(Path::new("/dev")))
}

/// Make the kernel and multipathd pick up a resized volume.
///
/// Every path gets a SCSI rescan; failures on one path are logged and the
/// next path is tried. Returns the last size observed.
#[instrument(skip(host, config))]
pub async fn do_extend_volume<H: Host>(
    host: &H,
    volume_paths: &[String],
    use_multipath: bool,
    config: &ConnectorConfig,
) -> Result<f64> {
    let Some(first) = volume_paths.first() else {
        return Err(FcError::NoVolumePaths("(none)".into()));
    };

    let mut new_size = 0.0;
    for path in volume_paths {
        let device = match get_device_info(host, path).await {
            Ok(device) => device,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to get device info");
                continue;
            }
        };
        let rescan = Path::new(SD_DRIVER_SYSFS_PATH)
            .join(device.address())
            .join("rescan");

        let size = match get_device_size(host, path).await {
            Ok(size) => size,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to get device size");
                continue;
            }
        };
        info!(path = %path, size, "Starting size");

        if let Err(e) = host.write_sysfs(&rescan, "1") {
            warn!(path = %rescan.display(), error = %e, "Failed to rescan SCSI device");
        }

        new_size = match get_device_size(host, path).await {
            Ok(size) => size,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to get device size after rescan");
                continue;
            }
        };
        info!(path = %path, size = new_size, "Size after SCSI device rescan");
    }

    let wwn = get_scsi_wwn(host, first)
        .await
        .map_err(|e| e.context(format!("reading WWN of {}", first)))?;
    if !use_multipath {
        return Ok(new_size);
    }

    let mpath = match find_multipath_device_path(
        host,
        &wwn,
        config.path_wait_attempts,
        config.path_wait_interval,
    )
    .await
    {
        Ok(mpath) => mpath,
        Err(e) => {
            debug!(wwn = %wwn, error = %e, "No multipath device to resize");
            return Ok(new_size);
        }
    };

    multipath_reconfigure(host)
        .await
        .map_err(|e| e.context("reconfiguring multipathd"))?;
    let size = get_device_size(host, &mpath)
        .await
        .map_err(|e| e.context(format!("size of {} after reconfigure", mpath)))?;
    info!(device = %mpath, size, "Multipath device current size");

    let reply = multipath_resize_map(host, &wwn, config.flush_timeout)
        .await
        .map_err(|e| e.context(format!("resizing multipath map {}", wwn)))?;
    if reply.contains("fail") {
        return Err(FcError::CommandFailed {
            command: format!("multipathd resize map {}", wwn),
            output: reply.trim().to_string(),
        }
        .context(format!(
            "multipathd failed to update the size of {} for {:?}",
            wwn, volume_paths
        )));
    }

    get_device_size(host, &mpath)
        .await
        .map_err(|e| e.context(format!("size of {} after resize map", mpath)))
}
