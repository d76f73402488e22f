//! Persistent network namespaces.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::mount::{mount, umount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use podlite_shared::{PodliteError, PodliteResult};

/// Creates and removes network namespaces pinned to files.
pub trait NamespaceCreator: Send + Sync {
    /// Readies the directory that holds the namespace files.
    fn prepare_dir(&self, dir: &Path) -> PodliteResult<()>;

    /// Creates a new network namespace pinned at `path`, which must not exist.
    fn create(&self, path: &Path) -> PodliteResult<()>;

    /// Removes the namespace at `path`; a missing path is not an error.
    fn delete(&self, path: &Path) -> PodliteResult<()>;
}

/// Pins namespaces by bind mounting `/proc/thread-self/ns/net`.
///
/// Needs `CAP_SYS_ADMIN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindMountNamespaces;

impl NamespaceCreator for BindMountNamespaces {
    /// Makes `dir` a shared mount point so namespaces pinned later propagate
    /// into pods that mount it.
    fn prepare_dir(&self, dir: &Path) -> PodliteResult<()> {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o770)).map_err(|e| {
            PodliteError::Network(format!("failed to chmod network namespace path: {}", e))
        })?;
        mount(Some(dir), dir, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(|e| {
            PodliteError::Network(format!("failed to bind mount network namespace path: {}", e))
        })?;
        mount(None::<&str>, dir, None::<&str>, MsFlags::MS_SHARED, None::<&str>).map_err(|e| {
            PodliteError::Network(format!("failed to make network namespace path shared: {}", e))
        })?;
        Ok(())
    }

    fn create(&self, path: &Path) -> PodliteResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                PodliteError::Network(format!("failed to create bind mount destination: {}", e))
            })?;

        // unshare only moves the calling thread, so a short-lived thread
        // creates the namespace and pins it before exiting.
        let target = path.to_path_buf();
        let pinned = std::thread::spawn(move || -> nix::Result<()> {
            unshare(CloneFlags::CLONE_NEWNET)?;
            mount(
                Some("/proc/thread-self/ns/net"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
        })
        .join()
        .map_err(|_| PodliteError::Internal("network namespace thread panicked".into()))
        .and_then(|r| r.map_err(|e| PodliteError::Network(format!("create network namespace failed: {}", e))));

        if pinned.is_err() {
            let _ = fs::remove_file(path);
        }
        pinned
    }

    fn delete(&self, path: &Path) -> PodliteResult<()> {
        match fs::metadata(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            _ => {}
        }
        umount(path).map_err(|e| {
            PodliteError::Network(format!("failed to unmount namespace path: {}", e))
        })?;
        fs::remove_file(path).map_err(|e| {
            PodliteError::Network(format!("failed to remove namespace path: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_of_missing_namespace_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        BindMountNamespaces.delete(&dir.path().join("absent")).unwrap();
    }

    #[test]
    fn create_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken");
        fs::write(&path, b"").unwrap();
        let err = BindMountNamespaces.create(&path).unwrap_err();
        assert!(err.to_string().contains("bind mount destination"));
        assert!(path.exists());
    }

    #[test]
    #[ignore = "requires root"]
    fn create_and_delete_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod");
        BindMountNamespaces.create(&path).unwrap();
        assert!(path.exists());
        BindMountNamespaces.delete(&path).unwrap();
        assert!(!path.exists());
    }
}
