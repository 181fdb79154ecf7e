use std::time::Duration;

use thiserror::Error;

/// Broad failure categories, used by callers to decide whether an operation
/// is worth retrying at their level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed descriptor; retrying with the same input cannot succeed.
    Validation,
    /// Something that should be on the host is not (HBA, device, map).
    NotFound,
    /// A wrapped tool or sysfs access failed.
    ExternalCommand,
}

#[derive(Error, Debug)]
pub enum FcError {
    #[error("invalid connection properties: {0}")]
    InvalidProperties(String),

    #[error("invalid LUN '{0}': expected an integer")]
    InvalidLun(String),

    #[error("Fibre Channel is not supported on this host")]
    NotSupported,

    #[error("unable to locate any Fibre Channel HBAs")]
    NoHbas,

    #[error("Fibre Channel volume device not found: {0}")]
    DeviceNotFound(String),

    #[error("couldn't find any volume paths on the host for targets {0}")]
    NoVolumePaths(String),

    #[error("no device to remove for targets {0}")]
    NoDeviceToRemove(String),

    #[error("couldn't find a valid multipath device path for {0}")]
    MultipathNotFound(String),

    #[error("command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {text:?}")]
    Parse { what: &'static str, text: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<FcError>,
    },
}

impl FcError {
    /// Wrap this error with operation context (device path, WWN, ...).
    pub fn context(self, context: impl Into<String>) -> Self {
        FcError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        FcError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FcError::InvalidProperties(_) | FcError::InvalidLun(_) => ErrorKind::Validation,
            FcError::NotSupported
            | FcError::NoHbas
            | FcError::DeviceNotFound(_)
            | FcError::NoVolumePaths(_)
            | FcError::NoDeviceToRemove(_)
            | FcError::MultipathNotFound(_) => ErrorKind::NotFound,
            FcError::CommandFailed { .. }
            | FcError::CommandTimeout { .. }
            | FcError::Spawn { .. }
            | FcError::Parse { .. }
            | FcError::Io { .. } => ErrorKind::ExternalCommand,
            FcError::Context { source, .. } => source.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = FcError::InvalidLun("abc".into()).context("computing paths for 0x5006");
        assert_eq!(err.kind(), ErrorKind::Validation);
        let msg = err.to_string();
        assert!(msg.starts_with("computing paths for 0x5006: "));
        assert!(msg.contains("'abc'"));
    }

    #[test]
    fn test_command_failed_message() {
        let err = FcError::CommandFailed {
            command: "multipath -l sdb".into(),
            output: "sdb: not a multipath device".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ExternalCommand);
        assert_eq!(
            err.to_string(),
            "command `multipath -l sdb` failed: sdb: not a multipath device"
        );
    }

    #[test]
    fn test_not_found_kinds() {
        assert_eq!(FcError::NoHbas.kind(), ErrorKind::NotFound);
        let err = FcError::NoDeviceToRemove("500507680b21ac0a/1".into());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            "no device to remove for targets 500507680b21ac0a/1"
        );
    }
}
