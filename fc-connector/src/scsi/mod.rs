//! SCSI and multipath device handling.

pub mod device;
pub mod multipath;

pub use device::{
    ScsiDeviceInfo, check_valid_device, do_extend_volume, get_dev_path, get_device_info,
    get_device_size, get_name_from_path, remove_scsi_device, requires_flush,
};
pub use multipath::{
    MultipathDevice, MultipathLeg, find_multipath_device, find_multipath_device_path,
    get_scsi_wwn, wait_for_rw,
};
