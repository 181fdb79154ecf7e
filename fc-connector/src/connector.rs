//! Volume attach, detach and resize over Fibre Channel.
//!
//! The connector is stateless between calls. The caller is expected to
//! serialize operations per volume: scan triggers, multipath reloads and
//! device removal are host-wide and are not locked here.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::config::ConnectorConfig;
use crate::error::{FcError, Result};
use crate::fc::hba::{HbaInfo, get_fc_hbas_info};
use crate::fc::paths::get_possible_volume_paths;
use crate::fc::rescan::rescan_hosts;
use crate::host::{Host, LinuxHost};
use crate::metrics::{self, OperationTimer};
use crate::retry::run_with_retry;
use crate::scsi::device::{
    ScsiDeviceInfo, check_valid_device, do_extend_volume, get_dev_path, get_device_info,
    get_name_from_path, remove_scsi_device, requires_flush,
};
use crate::scsi::multipath::{
    find_multipath_device, find_multipath_device_path, flush_multipath_device, get_scsi_wwn,
    wait_for_rw,
};
use crate::types::{
    AccessMode, ConnectionProperties, DeviceInfo, DeviceType, NormalizedProperties, Target,
};

/// Where the device search loop of an attach is at.
#[derive(Debug)]
enum ScanState {
    /// Check every candidate path once
    Poll { attempt: u32 },
    /// Nothing found, ask the HBAs to rescan before the next poll
    Rescan { attempt: u32 },
    Found { host_device: String, device_name: String },
    Exhausted,
}

/// Whether the attach handed out a multipath map rather than a single path.
///
/// By-path devices carry a `/pci-` segment, mapper devices don't. An empty
/// used path means the attach never completed.
fn attached_through_map(path_used: &str, device_info: Option<&DeviceInfo>) -> bool {
    device_info.is_some_and(|info| info.multipath_id.is_some())
        || (!path_used.is_empty() && !path_used.contains("/pci-"))
}

/// Fibre Channel volume connector.
pub struct FibreChannelConnector<H: Host = LinuxHost> {
    host: H,
    config: ConnectorConfig,
}

impl FibreChannelConnector<LinuxHost> {
    /// Connector for the running host with default tunables.
    pub fn new() -> Self {
        Self::with_config(LinuxHost::new(), ConnectorConfig::default())
    }
}

impl Default for FibreChannelConnector<LinuxHost> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Host> FibreChannelConnector<H> {
    pub fn with_config(host: H, config: ConnectorConfig) -> Self {
        Self { host, config }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Attach a volume and return the device to use for I/O.
    ///
    /// Polls the candidate by-path devices, rescanning the HBAs between
    /// polls, until one exists and can be read. When multipath is in use
    /// and the volume has a map, the map is returned instead of the single
    /// path device.
    #[instrument(skip(self, properties))]
    pub async fn connect_volume(&self, properties: &ConnectionProperties) -> Result<DeviceInfo> {
        let timer = OperationTimer::new("connect_volume");
        let result = self.do_connect_volume(properties).await;
        timer.finish(&result);
        result
    }

    async fn do_connect_volume(&self, properties: &ConnectionProperties) -> Result<DeviceInfo> {
        let props = properties.normalize()?;
        debug!(targets = ?props.targets, "Normalized connection properties");

        let hbas = get_fc_hbas_info(&self.host).await?;
        if hbas.is_empty() {
            return Err(FcError::NoHbas);
        }
        let candidates = get_possible_volume_paths(&self.host, &props.targets, &hbas)?;
        debug!(paths = ?candidates, "Possible volume paths");

        let (host_device, device_name) = self.scan_for_device(&props, &hbas, &candidates).await?;
        info!(device = %host_device, real = %device_name, "Found Fibre Channel volume");

        let wwn = get_scsi_wwn(&self.host, &host_device)
            .await
            .map_err(|e| e.context(format!("reading WWN of {}", host_device)))?;

        let (path, multipath_id) = if props.use_multipath {
            self.discover_multipath_device(&props, &wwn, &device_name)
                .await
        } else {
            (host_device, None)
        };

        Ok(DeviceInfo {
            path,
            scsi_wwn: wwn,
            multipath_id,
            device_type: DeviceType::Block,
        })
    }

    /// Poll and rescan until a candidate shows up or the attempts run out.
    async fn scan_for_device(
        &self,
        props: &NormalizedProperties,
        hbas: &[HbaInfo],
        candidates: &[String],
    ) -> Result<(String, String)> {
        let max_attempts = self.config.device_scan_attempts;
        let mut state = ScanState::Poll { attempt: 1 };
        loop {
            state = match state {
                ScanState::Poll { attempt } => match self.poll_candidates(candidates).await {
                    Some((host_device, device_name)) => ScanState::Found {
                        host_device,
                        device_name,
                    },
                    None if attempt < max_attempts => ScanState::Rescan { attempt },
                    None => ScanState::Exhausted,
                },
                ScanState::Rescan { attempt } => {
                    debug!(attempt, max_attempts, "Volume not found yet, rescanning");
                    rescan_hosts(&self.host, hbas, props);
                    metrics::record_retry("connect_volume");
                    tokio::time::sleep(self.config.device_scan_interval).await;
                    ScanState::Poll {
                        attempt: attempt + 1,
                    }
                }
                ScanState::Found {
                    host_device,
                    device_name,
                } => return Ok((host_device, device_name)),
                ScanState::Exhausted => {
                    warn!(attempts = max_attempts, "Fibre Channel volume device not found");
                    return Err(FcError::DeviceNotFound(format!(
                        "targets {}",
                        props.targets_label()
                    )));
                }
            };
        }
    }

    /// First candidate that exists and can be read, with its real device.
    async fn poll_candidates(&self, candidates: &[String]) -> Option<(String, String)> {
        for dev in candidates {
            if self.host.path_exists(Path::new(dev)) && check_valid_device(&self.host, dev).await {
                // The /dev/sdX name is what multipath knows the device by
                let device_name = self
                    .host
                    .real_path(Path::new(dev))
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| dev.clone());
                return Some((dev.clone(), device_name));
            }
        }
        None
    }

    /// Find the multipath map of an attached volume.
    ///
    /// Falls back to the single path device when there is no map. Waiting
    /// for the map to go read-write is best effort.
    async fn discover_multipath_device(
        &self,
        props: &NormalizedProperties,
        wwn: &str,
        device_name: &str,
    ) -> (String, Option<String>) {
        let found = match find_multipath_device_path(
            &self.host,
            wwn,
            self.config.path_wait_attempts,
            self.config.path_wait_interval,
        )
        .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(wwn = %wwn, error = %e, "No multipath link, asking multipath");
                match find_multipath_device(&self.host, device_name).await {
                    Ok(Some(mpath)) => Some(mpath.device),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(device = %device_name, error = %e, "Multipath lookup failed");
                        None
                    }
                }
            }
        };

        let Some(path) = found else {
            // No map, the kernel only sees the one device
            info!(device = %device_name, "No multipath device, using single path");
            return (device_name.to_string(), None);
        };

        if props.access_mode != AccessMode::ReadOnly {
            // Maps sometimes come up read-only and need time to go read-write
            let rw = run_with_retry(
                "wait_for_rw",
                self.config.rw_wait_attempts,
                self.config.rw_wait_interval,
                async |_| {
                    match wait_for_rw(&self.host, wwn, &path).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(device = %path, error = %e, "Device not read-write yet");
                            false
                        }
                    }
                },
            )
            .await;
            if !rw {
                warn!(device = %path, "Block device is still read-only, continuing anyway");
            }
        }
        (path, Some(wwn.to_string()))
    }

    /// Detach a volume, removing every SCSI device the kernel created for it.
    ///
    /// `device_info` is the result of the attach, when the caller kept it.
    #[instrument(skip(self, properties, device_info))]
    pub async fn disconnect_volume(
        &self,
        properties: &ConnectionProperties,
        device_info: Option<&DeviceInfo>,
    ) -> Result<()> {
        let timer = OperationTimer::new("disconnect_volume");
        let result = self.do_disconnect_volume(properties, device_info).await;
        timer.finish(&result);
        result
    }

    async fn do_disconnect_volume(
        &self,
        properties: &ConnectionProperties,
        device_info: Option<&DeviceInfo>,
    ) -> Result<()> {
        let props = properties.normalize()?;
        let volume_paths = self
            .get_volume_paths(&props.targets)
            .await
            .map_err(|e| e.context("looking up volume paths"))?;
        debug!(paths = ?volume_paths, "Volume paths to disconnect");

        let path_used = get_dev_path(&props, device_info);
        let was_multipath = attached_through_map(&path_used, device_info);

        // Only a map the attach handed out gets flushed, and only once
        let mut flush_map = props.use_multipath && was_multipath;
        let mut devices = Vec::new();
        for path in &volume_paths {
            if flush_map && check_valid_device(&self.host, path).await {
                flush_map = self.flush_multipath_for(path).await.is_none();
            }

            let Some(real_path) = get_name_from_path(&self.host, path) else {
                continue;
            };
            match get_device_info(&self.host, &real_path).await {
                Ok(device) => devices.push(device),
                Err(e) => warn!(path = %real_path, error = %e, "Failed to get device info"),
            }
        }

        if devices.is_empty() {
            return Err(FcError::NoDeviceToRemove(props.targets_label()));
        }
        info!(devices = devices.len(), "Removing devices");
        self.remove_devices(&devices, &path_used, was_multipath).await?;
        info!("Devices removed successfully");
        Ok(())
    }

    /// Flush the multipath map a path belongs to; returns the map's path.
    async fn flush_multipath_for(&self, path: &str) -> Option<String> {
        let wwn = match get_scsi_wwn(&self.host, path).await {
            Ok(wwn) => wwn,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to read WWN");
                return None;
            }
        };
        let mpath = match find_multipath_device_path(
            &self.host,
            &wwn,
            self.config.path_wait_attempts,
            self.config.path_wait_interval,
        )
        .await
        {
            Ok(mpath) => mpath,
            Err(e) => {
                debug!(wwn = %wwn, error = %e, "No multipath device to flush");
                return None;
            }
        };
        flush_multipath_device(
            &self.host,
            &mpath,
            self.config.flush_attempts,
            self.config.flush_interval,
            self.config.flush_timeout,
        )
        .await;
        Some(mpath)
    }

    /// There may have been more than one device created by the kernel for
    /// this volume; remove all of them.
    async fn remove_devices(
        &self,
        devices: &[ScsiDeviceInfo],
        path_used: &str,
        was_multipath: bool,
    ) -> Result<()> {
        for device in devices {
            let flush = requires_flush(&self.host, &device.device, path_used, was_multipath)
                .map_err(|e| {
                    e.context(format!(
                        "checking flush for {} (used {}, multipath {})",
                        device.device, path_used, was_multipath
                    ))
                })?;
            remove_scsi_device(&self.host, &device.device, flush, &self.config)
                .await
                .map_err(|e| e.context(format!("removing SCSI device {}", device.device)))?;
        }
        Ok(())
    }

    /// Make the host see a new volume size; returns the size in bytes.
    #[instrument(skip(self, properties))]
    pub async fn extend_volume(&self, properties: &ConnectionProperties) -> Result<f64> {
        let timer = OperationTimer::new("extend_volume");
        let result = self.do_extend(properties).await;
        timer.finish(&result);
        result
    }

    async fn do_extend(&self, properties: &ConnectionProperties) -> Result<f64> {
        let props = properties.normalize()?;
        let volume_paths = self
            .get_volume_paths(&props.targets)
            .await
            .map_err(|e| e.context("looking up volume paths"))?;
        if volume_paths.is_empty() {
            return Err(FcError::NoVolumePaths(props.targets_label()));
        }

        let new_size =
            do_extend_volume(&self.host, &volume_paths, props.use_multipath, &self.config).await?;
        info!(size = new_size, "Volume extended");
        Ok(new_size)
    }

    /// Candidate paths for `targets` that currently exist on the host.
    ///
    /// How the fabric is zoned decides which of the possible paths show up,
    /// so each one is checked.
    pub async fn get_volume_paths(&self, targets: &[Target]) -> Result<Vec<String>> {
        let hbas = get_fc_hbas_info(&self.host).await?;
        let possible = get_possible_volume_paths(&self.host, targets, &hbas)?;
        Ok(possible
            .into_iter()
            .filter(|path| self.host.path_exists(Path::new(path)))
            .collect())
    }
}
