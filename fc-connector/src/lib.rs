//! Linux Fibre Channel volume connector
//!
//! Attaches, detaches and resizes block volumes exported by a storage array
//! over Fibre Channel: discovers the host's HBAs, computes where the volume's
//! devices will appear under `/dev/disk/by-path`, nudges the SCSI layer to
//! scan for them, resolves the multipath map on top and tears the devices
//! down again on detach.
//!
//! ```no_run
//! use fc_connector::{ConnectionProperties, FibreChannelConnector};
//!
//! # async fn attach() -> fc_connector::Result<()> {
//! let connector = FibreChannelConnector::new();
//! let props = ConnectionProperties::new(["500507680b21ac0a", "500507680b22ac0a"], 1u64);
//! let device = connector.connect_volume(&props).await?;
//! println!("volume attached at {}", device.path);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod fc;
pub mod host;
pub mod metrics;
pub mod retry;
pub mod scsi;
pub mod types;

pub use config::ConnectorConfig;
pub use connector::FibreChannelConnector;
pub use error::{ErrorKind, FcError, Result};
pub use host::{Host, LinuxHost, PathStatus};
pub use types::{
    AccessMode, ConnectionProperties, DeviceInfo, DeviceType, LunId, NormalizedProperties,
    OneOrMany, Target,
};
