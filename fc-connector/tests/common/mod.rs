//! Scripted host for driving the connector in tests.
//!
//! Files, symlinks and command replies are declared up front. Directories
//! exist implicitly when anything lives under them. Commands match on a
//! prefix of their command line; the most recently added match wins and
//! anything unscripted fails like a missing tool.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use fc_connector::{FcError, Host, PathStatus, Result};

struct Rule {
    prefix: String,
    /// Replies in order; the last one repeats
    replies: VecDeque<std::result::Result<String, String>>,
}

#[derive(Default)]
struct State {
    files: BTreeMap<PathBuf, String>,
    links: BTreeMap<PathBuf, PathBuf>,
    rules: Vec<Rule>,
    /// Links that appear when a scan is written to the given file
    on_scan: Vec<(PathBuf, PathBuf, PathBuf)>,
    calls: Vec<String>,
    writes: Vec<(PathBuf, String)>,
}

impl State {
    fn resolve(&self, path: &Path) -> PathBuf {
        let mut current = path.to_path_buf();
        for _ in 0..40 {
            match self.links.get(&current) {
                Some(target) => current = target.clone(),
                None => break,
            }
        }
        current
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files
            .keys()
            .chain(self.links.keys())
            .any(|p| p != path && p.starts_with(path))
    }

    fn exists(&self, path: &Path) -> bool {
        let real = self.resolve(path);
        self.files.contains_key(&real) || self.is_dir(&real)
    }
}

#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str, contents: &str) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.files.insert(PathBuf::from(path), contents.to_string());
        self
    }

    pub fn add_link(&self, link: &str, target: &str) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.links.insert(PathBuf::from(link), PathBuf::from(target));
        self
    }

    /// Create `link -> target` once something is written to `scan_file`.
    pub fn link_on_scan(&self, scan_file: &str, link: &str, target: &str) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.on_scan.push((scan_file.into(), link.into(), target.into()));
        self
    }

    pub fn on_command(&self, prefix: &str, output: &str) -> &Self {
        self.on_command_seq(prefix, &[Ok(output)])
    }

    pub fn fail_command(&self, prefix: &str, output: &str) -> &Self {
        self.on_command_seq(prefix, &[Err(output)])
    }

    pub fn on_command_seq(
        &self,
        prefix: &str,
        replies: &[std::result::Result<&str, &str>],
    ) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.rules.push(Rule {
            prefix: prefix.to_string(),
            replies: replies
                .iter()
                .copied()
                .map(|r| r.map(String::from).map_err(String::from))
                .collect(),
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .map(|(p, v)| (p.display().to_string(), v.clone()))
            .collect()
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        let mut state = self.state.lock().unwrap();
        state.calls.push(command.clone());

        let reply = state
            .rules
            .iter_mut()
            .rev()
            .find(|rule| command.starts_with(&rule.prefix))
            .and_then(|rule| {
                if rule.replies.len() > 1 {
                    rule.replies.pop_front()
                } else {
                    rule.replies.front().cloned()
                }
            });
        match reply {
            Some(Ok(out)) => Ok(out),
            Some(Err(output)) => Err(FcError::CommandFailed { command, output }),
            None => Err(FcError::CommandFailed {
                command: command.clone(),
                output: format!("{}: command not found", program),
            }),
        }
    }
}

impl Host for FakeHost {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String> {
        self.run(program, args)
    }

    async fn execute_with_timeout(
        &self,
        _timeout: Duration,
        program: &str,
        args: &[&str],
    ) -> Result<String> {
        self.run(program, args)
    }

    fn stat_path(&self, path: &Path) -> PathStatus {
        if self.state.lock().unwrap().exists(path) {
            PathStatus::Present
        } else {
            PathStatus::Absent
        }
    }

    fn real_path(&self, path: &Path) -> io::Result<PathBuf> {
        let state = self.state.lock().unwrap();
        let real = state.resolve(path);
        if state.files.contains_key(&real) || state.is_dir(&real) {
            Ok(real)
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn read_dir_names(&self, dir: &Path) -> io::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let names: BTreeSet<String> = state
            .files
            .keys()
            .chain(state.links.keys())
            .filter_map(|p| p.strip_prefix(dir).ok())
            .filter_map(|rest| rest.components().next())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if names.is_empty() {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(names.into_iter().collect())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&state.resolve(path))
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write_sysfs(&self, path: &Path, value: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.writes.push((path.to_path_buf(), value.to_string()));
        let appeared: Vec<(PathBuf, PathBuf)> = state
            .on_scan
            .iter()
            .filter(|(scan, _, _)| scan == path)
            .map(|(_, link, target)| (link.clone(), target.clone()))
            .collect();
        state.links.extend(appeared);
        Ok(())
    }
}
