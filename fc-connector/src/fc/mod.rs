//! Fibre Channel host side: adapter discovery, candidate device paths and
//! SCSI host rescans.

pub mod hba;
pub mod paths;
pub mod rescan;

pub use hba::{
    FC_HOST_SYSFS_PATH, Hba, HbaInfo, get_fc_hbas, get_fc_hbas_info, get_fc_wwnns, get_fc_wwpns,
    has_fc_support,
};
pub use paths::{CandidateDevice, format_lun_id, get_possible_volume_paths, process_lun_ids};
pub use rescan::{ScanTriple, rescan_hosts};
