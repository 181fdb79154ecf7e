//! Host access for the FC connector.
//!
//! Everything the connector needs from the machine it runs on (external
//! tools, sysfs reads and writes, devfs lookups) goes through the [`Host`]
//! trait. [`LinuxHost`] is the live implementation; tests substitute a
//! scripted host.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{FcError, Result};

/// Outcome of a `stat` on a path.
///
/// Only `NotFound` is a definite answer that a path is missing; any other
/// stat failure (permissions, I/O errors) leaves the question open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Present,
    Absent,
    Indeterminate(io::ErrorKind),
}

/// Operations the connector performs against the host.
#[allow(async_fn_in_trait)]
pub trait Host {
    /// Run a command to completion and return its merged stdout and stderr.
    ///
    /// A non-zero exit status is reported as [`FcError::CommandFailed`]
    /// carrying the captured output.
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Run a command under a hard deadline and return its stdout.
    ///
    /// Any text on stderr is treated as failure. When the deadline passes
    /// the process is killed and [`FcError::CommandTimeout`] is returned.
    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        program: &str,
        args: &[&str],
    ) -> Result<String>;

    fn stat_path(&self, path: &Path) -> PathStatus;

    /// Resolve all symlinks in `path`.
    fn real_path(&self, path: &Path) -> io::Result<PathBuf>;

    /// File names (not full paths) of the entries in `dir`.
    fn read_dir_names(&self, dir: &Path) -> io::Result<Vec<String>>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Write a control value to a sysfs attribute.
    fn write_sysfs(&self, path: &Path, value: &str) -> io::Result<()>;

    /// Collapsed form of [`Host::stat_path`]: an indeterminate stat counts
    /// as "does not exist".
    fn path_exists(&self, path: &Path) -> bool {
        match self.stat_path(path) {
            PathStatus::Present => true,
            PathStatus::Absent => false,
            PathStatus::Indeterminate(kind) => {
                debug!(path = %path.display(), ?kind, "Cannot stat path, treating as absent");
                false
            }
        }
    }
}

pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// The live Linux host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }
}

impl Host for LinuxHost {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = command_line(program, args);
        debug!(command = %command, "Executing");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                error!(error = %e, command = %command, "Failed to execute command");
                FcError::Spawn {
                    command: command.clone(),
                    source: e,
                }
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(FcError::CommandFailed {
                command,
                output: text,
            });
        }
        Ok(text)
    }

    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        program: &str,
        args: &[&str],
    ) -> Result<String> {
        let command = command_line(program, args);
        debug!(command = %command, timeout_secs = timeout.as_secs(), "Executing with timeout");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(error = %e, command = %command, "Failed to execute command");
                FcError::Spawn {
                    command: command.clone(),
                    source: e,
                }
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| FcError::Spawn {
                command: command.clone(),
                source: e,
            })?,
            Err(_) => {
                error!(command = %command, timeout_secs = timeout.as_secs(), "Command timed out, killed");
                return Err(FcError::CommandTimeout { command, timeout });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            return Err(FcError::CommandFailed {
                command,
                output: stderr.into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn stat_path(&self, path: &Path) -> PathStatus {
        match fs::metadata(path) {
            Ok(_) => PathStatus::Present,
            Err(e) if e.kind() == io::ErrorKind::NotFound => PathStatus::Absent,
            Err(e) => PathStatus::Indeterminate(e.kind()),
        }
    }

    fn real_path(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn read_dir_names(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write_sysfs(&self, path: &Path, value: &str) -> io::Result<()> {
        debug!(path = %path.display(), value = %value, "Writing sysfs attribute");
        fs::write(path, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_command_line() {
        assert_eq!(command_line("lsblk", &[]), "lsblk");
        assert_eq!(
            command_line("blockdev", &["--getsize64", "/dev/sdb"]),
            "blockdev --getsize64 /dev/sdb"
        );
    }

    #[test]
    fn test_stat_and_real_path() {
        let dir = TempDir::new().unwrap();
        let dev = dir.path().join("sdb");
        fs::write(&dev, "").unwrap();
        let link = dir.path().join("pci-0000:05:00.2-fc-0x5006016a3ea0123b-lun-1");
        std::os::unix::fs::symlink(&dev, &link).unwrap();

        let host = LinuxHost::new();
        assert_eq!(host.stat_path(&link), PathStatus::Present);
        assert!(host.path_exists(&dev));
        assert!(!host.path_exists(&dir.path().join("sdc")));
        assert_eq!(
            host.real_path(&link).unwrap(),
            fs::canonicalize(&dev).unwrap()
        );

        let mut names = host.read_dir_names(dir.path()).unwrap();
        names.sort();
        assert_eq!(names.len(), 2);
        assert_eq!(names[1], "sdb");
    }

    #[test]
    fn test_write_sysfs() {
        let dir = TempDir::new().unwrap();
        let scan = dir.path().join("scan");
        let host = LinuxHost::new();
        host.write_sysfs(&scan, "0 1 1").unwrap();
        assert_eq!(host.read_to_string(&scan).unwrap(), "0 1 1");
    }

    #[tokio::test]
    async fn test_execute_reports_exit_status() {
        let host = LinuxHost::new();
        let out = host.execute("sh", &["-c", "echo out; echo err >&2"]).await.unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));

        let err = host.execute("sh", &["-c", "echo nope; exit 3"]).await.unwrap_err();
        match err {
            FcError::CommandFailed { output, .. } => assert!(output.contains("nope")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_execute_with_timeout_stderr_is_error() {
        let host = LinuxHost::new();
        let out = host
            .execute_with_timeout(Duration::from_secs(5), "sh", &["-c", "echo ok"])
            .await
            .unwrap();
        assert_eq!(out.trim(), "ok");

        let err = host
            .execute_with_timeout(Duration::from_secs(5), "sh", &["-c", "echo bad >&2"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[tokio::test]
    async fn test_execute_with_timeout_kills() {
        let host = LinuxHost::new();
        let started = std::time::Instant::now();
        let err = host
            .execute_with_timeout(Duration::from_millis(200), "sleep", &["30"])
            .await
            .unwrap_err();
        assert!(matches!(err, FcError::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
