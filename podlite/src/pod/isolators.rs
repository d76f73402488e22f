//! Isolators that need host-side coordination.
//!
//! Each returns the extra app mounts, pod volumes and stager bind mounts the
//! isolator grants; the startup pipeline merges them into the pod.

use std::path::Path;

use podlite_shared::constants::pod::{HOST_API_DIR, HOST_API_SOCKET_NAME};
use podlite_shared::constants::stager::VOLUMES_DIR;
use podlite_shared::container::MountConfig;
use podlite_shared::schema::{Mount, Volume};

#[derive(Debug, Default, PartialEq)]
pub struct Grants {
    pub app_mounts: Vec<Mount>,
    pub volumes: Vec<Volume>,
    pub stager_mounts: Vec<MountConfig>,
}

impl Grants {
    fn add(&mut self, volume: String, app_path: &str, source: &Path, read_only: bool) {
        let source = source.display().to_string();
        self.app_mounts.push(Mount {
            volume: volume.clone(),
            path: app_path.to_string(),
        });
        let mut mount = MountConfig::bind(source.clone(), stager_volume_path(&volume));
        if read_only {
            mount.set_read_only(true);
        }
        self.stager_mounts.push(mount);
        self.volumes.push(Volume::host(volume, source, read_only));
    }

    pub fn extend(&mut self, other: Grants) {
        self.app_mounts.extend(other.app_mounts);
        self.volumes.extend(other.volumes);
        self.stager_mounts.extend(other.stager_mounts);
    }
}

/// Where a pod volume appears inside the stager.
pub fn stager_volume_path(volume: &str) -> String {
    format!("{}/{}", VOLUMES_DIR, volume)
}

/// `host/privileged`: the host's pods directory (read-only), /proc and the
/// volumes directory under `/host` in the app.
pub fn host_privilege(app: &str, pods_dir: &Path, volumes_dir: Option<&Path>) -> Grants {
    let mut grants = Grants::default();
    grants.add(format!("{}-host-pods", app), "/host/pods", pods_dir, true);
    grants.add(format!("{}-host-proc", app), "/host/proc", Path::new("/proc"), false);
    if let Some(dir) = volumes_dir {
        grants.add(format!("{}-host-volumes", app), "/host/volumes", dir, false);
    }
    grants
}

/// Name of the stager directory holding an app's copy of the API socket.
pub fn api_socket_volume(app: &str) -> String {
    format!("{}-podlite-socket", app)
}

/// `host/api-access`: the daemon's socket file, alone in a directory mounted
/// at the daemon's API directory in the app.
///
/// The caller must create [`api_socket_volume`] under the stager's volumes
/// directory first; the socket is bound onto a file inside it.
pub fn host_api_access(app: &str, socket_file: &Path) -> Grants {
    let volume = api_socket_volume(app);
    Grants {
        app_mounts: vec![Mount {
            volume: volume.clone(),
            path: HOST_API_DIR.to_string(),
        }],
        stager_mounts: vec![MountConfig::bind(
            socket_file.display().to_string(),
            format!("{}/{}", stager_volume_path(&volume), HOST_API_SOCKET_NAME),
        )],
        volumes: vec![Volume::host(volume, HOST_API_DIR, false)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlite_shared::schema::VolumeKind;

    #[test]
    fn privileged_app_sees_host_dirs() {
        let grants = host_privilege(
            "web",
            Path::new("/var/lib/podlite/pods"),
            Some(Path::new("/var/lib/podlite/volumes")),
        );

        let paths: Vec<_> = grants.app_mounts.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["/host/pods", "/host/proc", "/host/volumes"]);

        assert_eq!(grants.volumes[0].name, "web-host-pods");
        assert_eq!(grants.volumes[0].kind, VolumeKind::Host);
        assert!(grants.volumes[0].is_read_only());
        assert!(!grants.volumes[1].is_read_only());

        assert_eq!(grants.stager_mounts[0].source, "/var/lib/podlite/pods");
        assert_eq!(grants.stager_mounts[0].destination, "/volumes/web-host-pods");
        assert!(grants.stager_mounts[0].is_read_only());
        assert_eq!(grants.stager_mounts[1].source, "/proc");
    }

    #[test]
    fn privileged_without_volume_dir() {
        let grants = host_privilege("web", Path::new("/pods"), None);
        assert_eq!(grants.app_mounts.len(), 2);
    }

    #[test]
    fn api_access_binds_only_the_socket() {
        let grants = host_api_access("ctl", Path::new("/var/lib/podlite.sock"));
        assert_eq!(grants.app_mounts[0].volume, "ctl-podlite-socket");
        assert_eq!(grants.app_mounts[0].path, "/var/lib/podlite");
        assert_eq!(grants.stager_mounts[0].source, "/var/lib/podlite.sock");
        assert_eq!(
            grants.stager_mounts[0].destination,
            "/volumes/ctl-podlite-socket/podlite.sock"
        );
    }
}
