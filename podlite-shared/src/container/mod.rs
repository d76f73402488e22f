//! OS-level container abstraction
//!
//! The pod manager launches the stager through a [`ContainerFactory`], and the
//! stager launches its init and app containers through the same interface.
//! Keeping it a trait lets the orchestration logic run against in-memory
//! fakes in tests.
//!
//! # Architecture
//!
//! - [`ContainerFactory`]: creates or loads containers by id
//! - [`Container`]: a configured isolation context; the first started process
//!   becomes its init, later ones join it
//! - [`ContainerProcess`]: a handle to a started process

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;

use crate::errors::{PodliteError, PodliteResult};
use crate::schema::Namespace;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{set_child_subreaper, LibcontainerFactory};

/// Creates and loads containers under one state root.
pub trait ContainerFactory: Send + Sync {
    fn create(&self, id: &str, config: ContainerConfig) -> PodliteResult<Arc<dyn Container>>;

    /// Loads a container previously created, possibly by another process.
    fn load(&self, id: &str) -> PodliteResult<Arc<dyn Container>>;
}

pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    /// Starts a process. The first call starts the container itself.
    fn start(&self, process: ProcessSpec) -> PodliteResult<Arc<dyn ContainerProcess>>;

    /// Kills anything left running and removes the container state.
    fn destroy(&self) -> PodliteResult<()>;
}

#[async_trait]
pub trait ContainerProcess: Send + Sync {
    fn pid(&self) -> i32;

    fn signal(&self, signal: Signal) -> PodliteResult<()>;

    /// Waits for the process to exit. Concurrent and repeated callers all
    /// observe the same status.
    async fn wait(&self) -> PodliteResult<ExitStatus>;
}

/// Exit status of a container process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Shell-style exit code: the code itself, or 128 + signal.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(s) => write!(f, "signal: {}", s.as_str()),
                Err(_) => write!(f, "signal: {}", sig),
            },
            (None, None) => f.write_str("exit status unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capabilities {
    All,
    Only(Vec<String>),
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::Only(Vec::new())
    }
}

/// A namespace the container creates, or joins when `path` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub kind: Namespace,
    pub path: Option<PathBuf>,
}

impl NamespaceConfig {
    pub fn new(kind: Namespace) -> Self {
        Self { kind, path: None }
    }

    pub fn join(kind: Namespace, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }
}

/// A mount in OCI form; options are the textual mount flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub source: String,
    pub destination: String,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountConfig {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        fstype: impl Into<String>,
        options: &[&str],
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fstype: fstype.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    pub fn bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(source, destination, "bind", &["bind"])
    }

    pub fn rbind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(source, destination, "bind", &["rbind"])
    }

    pub fn read_only(mut self) -> Self {
        self.set_read_only(true);
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    pub fn set_read_only(&mut self, ro: bool) {
        self.options.retain(|o| o != "ro" && o != "rw");
        if ro {
            self.options.push("ro".to_string());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub rootfs: PathBuf,
    pub hostname: Option<String>,
    pub cgroup_path: Option<String>,
    pub capabilities: Capabilities,
    pub namespaces: Vec<NamespaceConfig>,
    pub mounts: Vec<MountConfig>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub readonly_rootfs: bool,
}

impl ContainerConfig {
    pub fn has_namespace(&self, kind: Namespace) -> bool {
        self.namespaces.iter().any(|n| n.kind == kind)
    }
}

/// A process to start in a container.
#[derive(Debug, Default)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl ProcessSpec {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            cwd: "/".to_string(),
            ..Default::default()
        }
    }

    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Parses a numeric user or group id; empty means root.
pub fn parse_id(value: &str) -> PodliteResult<u32> {
    if value.is_empty() {
        return Ok(0);
    }
    value.parse::<u32>().map_err(|_| {
        PodliteError::Validation(format!("user and group must be numeric ids, got {:?}", value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::exited(3).exit_code(), 3);
        assert_eq!(ExitStatus::signaled(9).exit_code(), 137);
        assert!(ExitStatus::exited(0).success());
        assert_eq!(ExitStatus::signaled(15).to_string(), "signal: SIGTERM");
    }

    #[test]
    fn mount_read_only_toggle() {
        let mut m = MountConfig::new("sysfs", "/sys", "sysfs", &["nosuid", "ro"]);
        assert!(m.is_read_only());
        m.set_read_only(false);
        assert!(!m.is_read_only());
        assert_eq!(m.options, vec!["nosuid"]);
        assert!(MountConfig::bind("/a", "/b").read_only().is_read_only());
    }

    #[test]
    fn numeric_ids() {
        assert_eq!(parse_id("").unwrap(), 0);
        assert_eq!(parse_id("1000").unwrap(), 1000);
        assert!(parse_id("nobody").is_err());
    }
}
