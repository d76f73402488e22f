//! Container configurations for the init and app containers.

use podlite_shared::constants::isolators;
use podlite_shared::container::{Capabilities, ContainerConfig, MountConfig, NamespaceConfig};
use podlite_shared::schema::{
    flag_enabled, App, LinuxNamespaces, Namespace, RuntimeApp, StagerConfig, Volume,
};
use podlite_shared::{PodliteError, PodliteResult};

use crate::layout::Layout;

/// Capabilities granted to unprivileged apps.
pub const DEFAULT_CAPABILITIES: [&str; 14] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const MASKED_PATHS: [&str; 1] = ["/proc/kcore"];

const READONLY_PATHS: [&str; 6] = [
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

const DEFAULT_MOUNT_FLAGS: [&str; 3] = ["noexec", "nosuid", "nodev"];

fn default_mounts() -> Vec<MountConfig> {
    vec![
        MountConfig::new("proc", "/proc", "proc", &DEFAULT_MOUNT_FLAGS),
        MountConfig::new("tmpfs", "/dev", "tmpfs", &["nosuid", "strictatime", "mode=755"]),
        MountConfig::new(
            "devpts",
            "/dev/pts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        MountConfig::new(
            "shm",
            "/dev/shm",
            "tmpfs",
            &["noexec", "nosuid", "nodev", "mode=1777", "size=65536k"],
        ),
        MountConfig::new("mqueue", "/dev/mqueue", "mqueue", &DEFAULT_MOUNT_FLAGS),
        MountConfig::new("sysfs", "/sys", "sysfs", &["noexec", "nosuid", "nodev", "ro"]),
    ]
}

/// Namespaces the init container holds for the pod.
///
/// These are the configured defaults minus any the pod keeps from the host.
/// A required namespace can never come from the host.
pub fn pod_namespaces(
    config: &StagerConfig,
    isolator: Option<&LinuxNamespaces>,
) -> PodliteResult<Vec<Namespace>> {
    let is_host = |ns: Namespace| isolator.is_some_and(|i| i.is_host(ns));

    for name in &config.required_namespaces {
        let ns: Namespace = name.parse()?;
        if is_host(ns) {
            return Err(PodliteError::Validation(format!(
                "the {} namespace is required and cannot be shared with the host",
                ns
            )));
        }
    }

    let mut namespaces = Vec::new();
    for name in &config.default_namespaces {
        let ns: Namespace = name.parse()?;
        if !is_host(ns) && !namespaces.contains(&ns) {
            namespaces.push(ns);
        }
    }
    Ok(namespaces)
}

/// The init container owns the pod's shared namespaces.
///
/// The network namespace is not created here: the stager already runs in
/// the one provisioned for the pod, and init inherits it.
pub fn init_config(
    layout: &Layout,
    pod_name: &str,
    namespaces: &[Namespace],
    cgroup_parent: Option<&str>,
) -> ContainerConfig {
    let mut ns: Vec<NamespaceConfig> = vec![NamespaceConfig::new(Namespace::Mount)];
    ns.extend(
        namespaces
            .iter()
            .filter(|n| **n != Namespace::Net)
            .map(|n| NamespaceConfig::new(*n)),
    );

    ContainerConfig {
        rootfs: layout.init_root(),
        hostname: namespaces
            .contains(&Namespace::Uts)
            .then(|| pod_name.to_string()),
        cgroup_path: cgroup_parent.map(|p| format!("{}/init", p.trim_end_matches('/'))),
        capabilities: Capabilities::Only(Vec::new()),
        namespaces: ns,
        mounts: default_mounts(),
        masked_paths: MASKED_PATHS.iter().map(|s| s.to_string()).collect(),
        readonly_paths: READONLY_PATHS.iter().map(|s| s.to_string()).collect(),
        readonly_rootfs: true,
    }
}

/// An app container: its own mount namespace and root, joined to every
/// namespace the init process holds.
pub fn app_config(
    layout: &Layout,
    runtime_app: &RuntimeApp,
    app: &App,
    volumes: &[Volume],
    init_pid: i32,
    namespaces: &[Namespace],
    cgroup_parent: Option<&str>,
) -> PodliteResult<ContainerConfig> {
    let mut ns = vec![NamespaceConfig::new(Namespace::Mount)];
    ns.extend(
        namespaces
            .iter()
            .map(|n| NamespaceConfig::join(*n, format!("/proc/{}/ns/{}", init_pid, n))),
    );

    let mut mounts = default_mounts();
    for mount in &runtime_app.mounts {
        let volume = volumes.iter().find(|v| v.name == mount.volume).ok_or_else(|| {
            PodliteError::Validation(format!(
                "app {:?} mounts unknown volume {:?}",
                runtime_app.name, mount.volume
            ))
        })?;
        let read_only = volume.is_read_only()
            || app
                .mount_points
                .iter()
                .any(|mp| mp.name == mount.volume && mp.read_only);

        let mut bind = MountConfig::rbind(
            layout.volume(&mount.volume).display().to_string(),
            mount.path.clone(),
        );
        bind.set_read_only(read_only);
        mounts.push(bind);
    }

    let mut config = ContainerConfig {
        rootfs: layout.app_root(&runtime_app.name),
        hostname: None,
        cgroup_path: cgroup_parent
            .map(|p| format!("{}/{}", p.trim_end_matches('/'), runtime_app.name)),
        capabilities: Capabilities::Only(
            DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        ),
        namespaces: ns,
        mounts,
        masked_paths: MASKED_PATHS.iter().map(|s| s.to_string()).collect(),
        readonly_paths: READONLY_PATHS.iter().map(|s| s.to_string()).collect(),
        readonly_rootfs: false,
    };

    if flag_enabled(&app.isolators, isolators::LINUX_PRIVILEGED) {
        apply_privileged(&mut config);
    }
    Ok(config)
}

fn apply_privileged(config: &mut ContainerConfig) {
    config.capabilities = Capabilities::All;
    config.masked_paths.clear();
    config.readonly_paths.clear();
    for mount in &mut config.mounts {
        if matches!(mount.fstype.as_str(), "sysfs" | "cgroup") {
            mount.set_read_only(false);
        }
    }
}
