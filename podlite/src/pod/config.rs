//! Stager container configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use podlite_shared::constants::stager::{CONTAINER_IO_ENV_PREFIX, IO_DIR, LAYERS_DIR};
use podlite_shared::container::MountConfig;

/// Host files handed to an app as its standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerIo {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl ContainerIo {
    pub fn stdin(path: impl Into<PathBuf>) -> Self {
        Self {
            stdin: Some(path.into()),
            ..Default::default()
        }
    }

    fn streams(&self) -> impl Iterator<Item = (&'static str, &Path)> {
        [
            ("stdin", self.stdin.as_deref()),
            ("stdout", self.stdout.as_deref()),
            ("stderr", self.stderr.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, path)| path.map(|p| (name, p)))
    }
}

/// Mounts every stager gets: devices, proc, read-only sysfs and cgroups.
pub fn base_mounts() -> Vec<MountConfig> {
    vec![
        MountConfig::rbind("/dev", "/dev"),
        MountConfig::new("proc", "/proc", "proc", &["noexec", "nosuid", "nodev"]),
        MountConfig::new("sysfs", "/sys", "sysfs", &["noexec", "nosuid", "nodev", "ro"]),
        MountConfig::new(
            "cgroup",
            "/sys/fs/cgroup",
            "cgroup",
            &["noexec", "nosuid", "nodev", "relatime"],
        ),
    ]
}

/// Read-only bind of every image layer at `/layers/<hash>`.
pub fn layer_mounts(layers: &BTreeMap<String, PathBuf>) -> Vec<MountConfig> {
    layers
        .iter()
        .map(|(hash, path)| {
            MountConfig::bind(path.display().to_string(), format!("{}/{}", LAYERS_DIR, hash))
                .read_only()
        })
        .collect()
}

/// Binds each app's stream files at `/io/<app>/<stream>` and returns the
/// environment telling the stager where to find them.
pub fn io_mounts(io: &HashMap<String, ContainerIo>) -> (Vec<MountConfig>, Vec<(String, String)>) {
    let mut apps: Vec<_> = io.iter().collect();
    apps.sort_by(|a, b| a.0.cmp(b.0));

    let mut mounts = Vec::new();
    let mut env = Vec::new();
    for (app, streams) in apps {
        for (stream, source) in streams.streams() {
            let dest = format!("{}/{}/{}", IO_DIR, app, stream);
            mounts.push(MountConfig::bind(source.display().to_string(), dest.clone()));
            env.push((io_env_name(app, stream), dest));
        }
    }
    (mounts, env)
}

/// `STAGER_CONTAINER_<app>_<STREAM>`; the app name keeps its case.
pub fn io_env_name(app: &str, stream: &str) -> String {
    format!(
        "{}{}_{}",
        CONTAINER_IO_ENV_PREFIX,
        app,
        stream.to_ascii_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_mounts_keep_sysfs_read_only() {
        let mounts = base_mounts();
        let sys = mounts.iter().find(|m| m.destination == "/sys").unwrap();
        assert!(sys.is_read_only());
        let proc = mounts.iter().find(|m| m.destination == "/proc").unwrap();
        assert!(!proc.is_read_only());
        assert_eq!(mounts[0].options, vec!["rbind"]);
    }

    #[test]
    fn layers_are_read_only_binds() {
        let mut layers = BTreeMap::new();
        layers.insert("sha512-aa".to_string(), PathBuf::from("/images/sha512-aa/rootfs"));
        let mounts = layer_mounts(&layers);
        assert_eq!(mounts[0].destination, "/layers/sha512-aa");
        assert_eq!(mounts[0].source, "/images/sha512-aa/rootfs");
        assert!(mounts[0].is_read_only());
    }

    #[test]
    fn io_streams_get_mounts_and_env() {
        let mut io = HashMap::new();
        io.insert(
            "lo".to_string(),
            ContainerIo {
                stdin: Some("/run/netconf/lo.json".into()),
                stdout: None,
                stderr: Some("/run/netconf/lo.err".into()),
            },
        );
        let (mounts, env) = io_mounts(&io);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].destination, "/io/lo/stdin");
        assert_eq!(
            env,
            vec![
                ("STAGER_CONTAINER_lo_STDIN".to_string(), "/io/lo/stdin".to_string()),
                ("STAGER_CONTAINER_lo_STDERR".to_string(), "/io/lo/stderr".to_string()),
            ]
        );
    }
}
