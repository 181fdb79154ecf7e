//! Typed connection descriptor and connector results.
//!
//! The volume manager hands the connector a loosely shaped descriptor
//! (`target_wwn` may be a string or a list, LUNs may be numbers or strings).
//! [`ConnectionProperties`] accepts all of those shapes at the deserialization
//! boundary and [`ConnectionProperties::normalize`] turns them into the strict
//! [`NormalizedProperties`] the rest of the pipeline works with.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{FcError, Result};

// ============================================================================
// Descriptor input shapes
// ============================================================================

/// A value that may be given either as a single item or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// A LUN as supplied by the volume manager: a number or a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LunId {
    Number(u64),
    Text(String),
}

impl Display for LunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LunId::Number(n) => write!(f, "{}", n),
            LunId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for LunId {
    fn from(value: u64) -> Self {
        LunId::Number(value)
    }
}

impl From<&str> for LunId {
    fn from(value: &str) -> Self {
        LunId::Text(value.to_string())
    }
}

/// Access mode requested for the attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
}

// ============================================================================
// ConnectionProperties
// ============================================================================

/// Connection descriptor for a Fibre Channel volume.
///
/// Example:
///
/// ```json
/// {
///   "target_wwn": ["20210002AC00383D", "20220002AC00383D"],
///   "target_lun": 1,
///   "initiator_target_map": {
///     "100010604b010459": ["20210002AC00383D"],
///     "100010604b01045d": ["20220002AC00383D"]
///   },
///   "access_mode": "rw"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_wwn: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_wwns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lun: Option<LunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_luns: Option<Vec<LunId>>,
    /// Initiator WWPN -> target WWPNs the initiator is zoned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_target_map: Option<HashMap<String, Vec<String>>>,
    /// Use the multipath device when one exists (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_multipath: Option<bool>,
    /// Allow wildcard SCSI scans when no target port is found (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_wildcard_scan: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    /// Path the volume manager used for I/O, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
}

impl ConnectionProperties {
    /// Descriptor for a single LUN exposed through one or more target ports.
    pub fn new<I, S>(wwns: I, lun: impl Into<LunId>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_wwns: Some(wwns.into_iter().map(Into::into).collect()),
            target_lun: Some(lun.into()),
            ..Default::default()
        }
    }

    pub fn with_initiator_target_map(mut self, map: HashMap<String, Vec<String>>) -> Self {
        self.initiator_target_map = Some(map);
        self
    }

    pub fn with_multipath(mut self, use_multipath: bool) -> Self {
        self.use_multipath = Some(use_multipath);
        self
    }

    pub fn with_wildcard_scan(mut self, enabled: bool) -> Self {
        self.enable_wildcard_scan = Some(enabled);
        self
    }

    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = Some(mode);
        self
    }

    /// Reconcile the WWN/LUN fields into an explicit target list.
    ///
    /// WWNs are lower-cased. Equal-length WWN and LUN lists are paired up;
    /// several WWNs with a single LUN share that LUN. Any other combination
    /// is rejected.
    pub fn normalize(&self) -> Result<NormalizedProperties> {
        let wwns: Vec<String> = match (&self.target_wwns, &self.target_wwn) {
            (Some(list), _) => list.clone(),
            (None, Some(wwn)) => wwn.clone().into_vec(),
            (None, None) => Vec::new(),
        }
        .into_iter()
        .map(|w| w.to_lowercase())
        .collect();

        let luns: Vec<String> = match (&self.target_luns, &self.target_lun) {
            (Some(list), _) => list.iter().map(ToString::to_string).collect(),
            (None, Some(lun)) => vec![lun.to_string()],
            (None, None) => Vec::new(),
        };

        let targets: Vec<Target> = if !luns.is_empty() && luns.len() == wwns.len() {
            wwns.iter()
                .zip(&luns)
                .map(|(w, l)| Target::new(w, l))
                .collect()
        } else if luns.len() == 1 && wwns.len() > 1 {
            wwns.iter().map(|w| Target::new(w, &luns[0])).collect()
        } else {
            return Err(FcError::InvalidProperties(format!(
                "unable to find potential volume paths for FC device with luns {:?} and wwns {:?}",
                luns, wwns
            )));
        };

        let wwpn_lun: HashMap<&str, &str> = targets
            .iter()
            .map(|t| (t.wwpn.as_str(), t.lun.as_str()))
            .collect();

        let initiator_target_map: Option<BTreeMap<String, Vec<String>>> =
            self.initiator_target_map.as_ref().map(|map| {
                let mut lowered: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for (initiator, ports) in map {
                    lowered
                        .entry(initiator.to_lowercase())
                        .or_default()
                        .extend(ports.iter().map(|p| p.to_lowercase()));
                }
                lowered
            });

        let initiator_target_lun_map = initiator_target_map.as_ref().map(|map| {
            map.iter()
                .map(|(initiator, ports)| {
                    let targets: Vec<Target> = ports
                        .iter()
                        .filter_map(|p| wwpn_lun.get(p.as_str()).map(|lun| Target::new(p, lun)))
                        .collect();
                    (initiator.clone(), targets)
                })
                .collect::<BTreeMap<_, _>>()
        });

        Ok(NormalizedProperties {
            targets,
            initiator_target_map,
            initiator_target_lun_map,
            use_multipath: self.use_multipath.unwrap_or(true),
            enable_wildcard_scan: self.enable_wildcard_scan.unwrap_or(true),
            access_mode: self.access_mode.unwrap_or_default(),
            device_path: self.device_path.clone(),
        })
    }
}

// ============================================================================
// Normalized form
// ============================================================================

/// A target port / LUN pair. The WWPN is lower-case hex without `0x`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub wwpn: String,
    pub lun: String,
}

impl Target {
    pub fn new(wwpn: &str, lun: &str) -> Self {
        Self {
            wwpn: wwpn.to_lowercase(),
            lun: lun.to_string(),
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.wwpn, self.lun)
    }
}

/// Descriptor after [`ConnectionProperties::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedProperties {
    pub targets: Vec<Target>,
    /// Lower-cased initiator -> target WWPN map, when one was supplied
    pub initiator_target_map: Option<BTreeMap<String, Vec<String>>>,
    /// Initiator -> targets (with LUNs) derived from `initiator_target_map`
    pub initiator_target_lun_map: Option<BTreeMap<String, Vec<Target>>>,
    pub use_multipath: bool,
    pub enable_wildcard_scan: bool,
    pub access_mode: AccessMode,
    pub device_path: Option<String>,
}

impl NormalizedProperties {
    /// `wwpn/lun` of every target, for error messages.
    pub fn targets_label(&self) -> String {
        let targets: Vec<String> = self.targets.iter().map(ToString::to_string).collect();
        targets.join(", ")
    }
}

// ============================================================================
// DeviceInfo
// ============================================================================

/// Kind of device handed back to the volume manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Block,
}

/// Result of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Block device path in use (mapper device when multipathed)
    pub path: String,
    /// SCSI page 0x83 WWN of the volume
    pub scsi_wwn: String,
    /// Set only when a multipath device is in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipath_id: Option<String>,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_paired() {
        let props = ConnectionProperties {
            target_wwns: Some(vec!["500507680B21AC0A".into(), "500507680B22AC0A".into()]),
            target_luns: Some(vec![LunId::Number(1), LunId::Text("2".into())]),
            ..Default::default()
        };
        let norm = props.normalize().unwrap();
        assert_eq!(
            norm.targets,
            vec![
                Target::new("500507680b21ac0a", "1"),
                Target::new("500507680b22ac0a", "2"),
            ]
        );
        assert!(norm.use_multipath);
        assert!(norm.enable_wildcard_scan);
        assert_eq!(norm.access_mode, AccessMode::ReadWrite);
        assert!(norm.initiator_target_lun_map.is_none());
    }

    #[test]
    fn test_normalize_broadcast_lun() {
        let props = ConnectionProperties::new(["AA", "BB", "CC"], 7u64);
        let norm = props.normalize().unwrap();
        assert_eq!(norm.targets.len(), 3);
        assert!(norm.targets.iter().all(|t| t.lun == "7"));
        assert_eq!(norm.targets[2].wwpn, "cc");
    }

    #[test]
    fn test_normalize_cardinalities() {
        for wwn_count in 0..5usize {
            for lun_count in 0..5usize {
                let props = ConnectionProperties {
                    target_wwns: Some((0..wwn_count).map(|i| format!("5006AB{:02}", i)).collect()),
                    target_luns: Some((0..lun_count as u64).map(LunId::Number).collect()),
                    ..Default::default()
                };
                let valid = (wwn_count > 0 && wwn_count == lun_count)
                    || (lun_count == 1 && wwn_count > 1);
                match props.normalize() {
                    Ok(norm) => {
                        assert!(valid, "{} wwns / {} luns should fail", wwn_count, lun_count);
                        assert_eq!(norm.targets.len(), wwn_count.max(lun_count));
                        assert!(
                            norm.targets
                                .iter()
                                .all(|t| t.wwpn == t.wwpn.to_lowercase())
                        );
                    }
                    Err(e) => {
                        assert!(!valid, "{} wwns / {} luns should pass", wwn_count, lun_count);
                        assert!(matches!(e, FcError::InvalidProperties(_)));
                    }
                }
            }
        }
    }

    #[test]
    fn test_normalize_single_wwn_string() {
        let props: ConnectionProperties =
            serde_json::from_str(r#"{"target_wwn": "5006016A3EA0123B", "target_lun": "3"}"#)
                .unwrap();
        let norm = props.normalize().unwrap();
        assert_eq!(norm.targets, vec![Target::new("5006016a3ea0123b", "3")]);
    }

    #[test]
    fn test_normalize_target_wwns_preferred_over_target_wwn() {
        let props = ConnectionProperties {
            target_wwn: Some(OneOrMany::One("ignored".into())),
            target_wwns: Some(vec!["AB".into()]),
            target_lun: Some(LunId::Number(0)),
            ..Default::default()
        };
        assert_eq!(props.normalize().unwrap().targets[0].wwpn, "ab");
    }

    #[test]
    fn test_normalize_initiator_target_lun_map() {
        let mut itmap = HashMap::new();
        itmap.insert(
            "100010604B010459".to_string(),
            vec!["20210002AC00383D".to_string()],
        );
        itmap.insert(
            "100010604B01045D".to_string(),
            vec!["20220002AC00383D".to_string(), "DEADBEEF00000000".to_string()],
        );
        let props = ConnectionProperties::new(["20210002AC00383D", "20220002AC00383D"], 1u64)
            .with_initiator_target_map(itmap);
        let norm = props.normalize().unwrap();

        let itmap = norm.initiator_target_map.unwrap();
        assert_eq!(
            itmap["100010604b01045d"],
            vec!["20220002ac00383d", "deadbeef00000000"]
        );

        let lun_map = norm.initiator_target_lun_map.unwrap();
        assert_eq!(
            lun_map["100010604b010459"],
            vec![Target::new("20210002ac00383d", "1")]
        );
        // Ports that aren't among the volume's targets are dropped
        assert_eq!(
            lun_map["100010604b01045d"],
            vec![Target::new("20220002ac00383d", "1")]
        );
    }

    #[test]
    fn test_descriptor_flags_deserialize() {
        let props: ConnectionProperties = serde_json::from_str(
            r#"{
                "target_wwn": ["AA", "BB"],
                "target_lun": 2,
                "use_multipath": false,
                "enable_wildcard_scan": false,
                "access_mode": "ro"
            }"#,
        )
        .unwrap();
        let norm = props.normalize().unwrap();
        assert!(!norm.use_multipath);
        assert!(!norm.enable_wildcard_scan);
        assert_eq!(norm.access_mode, AccessMode::ReadOnly);
    }

    #[test]
    fn test_device_info_json() {
        let info = DeviceInfo {
            path: "/dev/sdb".into(),
            scsi_wwn: "3600507680b".into(),
            multipath_id: None,
            device_type: DeviceType::Block,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "block");
        assert!(json.get("multipath_id").is_none());
    }
}
