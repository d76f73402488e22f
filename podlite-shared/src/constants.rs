//! Shared constants between the host manager and the stager
//!
//! These constants must be identical on both sides of the stager boundary.

/// Paths inside the stager's root filesystem.
pub mod stager {
    /// Where the manager writes the resolved stager manifest.
    pub const MANIFEST_PATH: &str = "/manifest";

    /// Stager runtime state, rewritten on every app transition.
    pub const STATE_PATH: &str = "/state.json";

    /// Unix socket the stager connects to once the pod is running.
    pub const READY_SOCKET: &str = "/ready.sock";

    /// Root directory for per-app container state.
    pub const CONTAINERS_DIR: &str = "/containers";

    /// Per-app merged root filesystems.
    pub const APPS_DIR: &str = "/apps";

    /// Root filesystem of the init container.
    pub const INIT_DIR: &str = "/init";

    /// App and init log files.
    pub const LOGS_DIR: &str = "/logs";

    /// Image layers, bind-mounted read-only by the manager.
    pub const LAYERS_DIR: &str = "/layers";

    /// Pod volumes, bind-mounted by the manager.
    pub const VOLUMES_DIR: &str = "/volumes";

    /// Per-app stdio files handed in by the manager.
    pub const IO_DIR: &str = "/io";

    /// Entry point used by Enter to start a process in an app container.
    pub const RUN_BINARY: &str = "/opt/stager/run";

    /// Name of the init container and its log file.
    pub const INIT_CONTAINER: &str = "init";

    /// Environment variable naming the FIFO the run helper reads its config from.
    pub const RUN_CONFIG_ENV: &str = "STAGER_RUN_CONFIG";

    /// Prefix of the environment variables carrying per-app stdio paths.
    pub const CONTAINER_IO_ENV_PREFIX: &str = "STAGER_CONTAINER_";

    /// Default graph storage provider.
    pub const DEFAULT_GRAPH_STORAGE: &str = "overlay";
}

/// Host side layout and timing.
pub mod pod {
    use std::time::Duration;

    /// Manifest file name inside an image directory.
    pub const IMAGE_MANIFEST: &str = "manifest";

    /// Root filesystem directory name inside an image directory.
    pub const IMAGE_ROOTFS: &str = "rootfs";

    /// Stager process log inside the pod directory.
    pub const STAGER_LOG: &str = "stager.log";

    /// Name of the stager's root inside the pod directory.
    pub const STAGER_DIR: &str = "stager";

    /// Grace period between SIGTERM and SIGKILL for the stager.
    pub const STAGER_STOP_TIMEOUT: Duration = Duration::from_secs(60);

    /// Deadline for the run helper to read its Enter configuration.
    pub const ENTER_ACK_TIMEOUT: Duration = Duration::from_secs(10);

    /// Poll interval for `wait_for_state`.
    pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Host directory the api-access isolator exposes inside the pod.
    pub const HOST_API_DIR: &str = "/var/lib/podlite";

    /// Socket file name within [`HOST_API_DIR`].
    pub const HOST_API_SOCKET_NAME: &str = "podlite.sock";
}

/// Stager supervision timing.
pub mod supervisor {
    use std::time::Duration;

    /// Grace period before app and init processes are force killed.
    pub const STOP_GRACE: Duration = Duration::from_secs(30);
}

/// Network driver protocol.
pub mod network {
    use std::time::Duration;

    /// Name of the pod hosting the network drivers.
    pub const NETWORK_POD_NAME: &str = "podlite-networking";

    /// Volume carrying the per-pod network namespaces into the driver pod.
    pub const NETNS_VOLUME: &str = "podlite-network-ns";

    /// Where the driver pod sees the network namespace directory.
    pub const NETNS_MOUNT_PATH: &str = "/var/lib/podlite/netns";

    /// Driver executables inside each driver app.
    pub const ADD_CMD: &str = "/opt/network/add";
    pub const DEL_CMD: &str = "/opt/network/del";

    /// Deadline for a single driver invocation.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

    /// How long `setup` waits for the driver pod to come up.
    pub const POD_START_TIMEOUT: Duration = Duration::from_secs(60);

    /// Upper bound accepted by the `random` interface template function.
    pub const MAX_RANDOM_LEN: usize = 32;
}

/// Isolator names understood by the runtime.
pub mod isolators {
    pub const LINUX_NAMESPACES: &str = "os/linux/namespaces";
    pub const LINUX_PRIVILEGED: &str = "os/linux/privileged";
    pub const HOST_PRIVILEGED: &str = "host/privileged";
    pub const HOST_API_ACCESS: &str = "host/api-access";
}
