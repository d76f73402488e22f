use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use podlite_shared::{PodliteError, PodliteResult};

use super::StorageProvisioner;

/// Mounts an overlayfs per app, with the writable layer kept beside the app
/// root in `.<app>/{upper,work}`.
pub struct OverlayProvisioner;

impl OverlayProvisioner {
    pub fn new() -> PodliteResult<Self> {
        // Without procfs mounted we cannot tell, so let the mount itself fail.
        if let Ok(filesystems) = std::fs::read_to_string("/proc/filesystems") {
            if !filesystems.lines().any(|l| l.split_whitespace().last() == Some("overlay")) {
                return Err(PodliteError::Storage(
                    "failed to configure app storage: overlay is not supported by the kernel"
                        .into(),
                ));
            }
        }
        Ok(Self)
    }
}

impl StorageProvisioner for OverlayProvisioner {
    fn create(&self, target: &Path, layers: &[PathBuf]) -> PodliteResult<()> {
        let (upper, work) = scratch_dirs(target)?;
        for dir in [&upper, &work] {
            ensure_clean_dir(dir)?;
        }

        let data = overlay_options(layers, &upper, &work)?;
        tracing::debug!(target = %target.display(), options = %data, "Mounting overlay");
        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| {
            PodliteError::Storage(format!(
                "failed to mount overlay at {}: {}",
                target.display(),
                e
            ))
        })
    }
}

fn scratch_dirs(target: &Path) -> PodliteResult<(PathBuf, PathBuf)> {
    let name = target.file_name().ok_or_else(|| {
        PodliteError::Storage(format!("invalid app root {}", target.display()))
    })?;
    let parent = target.parent().unwrap_or_else(|| Path::new("/"));
    let base = parent.join(format!(".{}", name.to_string_lossy()));
    Ok((base.join("upper"), base.join("work")))
}

/// The work dir must be empty for the mount to succeed.
fn ensure_clean_dir(path: &Path) -> PodliteResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(PodliteError::Storage(format!(
                "failed to clear {}: {}",
                path.display(),
                e
            )))
        }
    }
    std::fs::create_dir_all(path).map_err(|e| {
        PodliteError::Storage(format!("failed to create {}: {}", path.display(), e))
    })
}

/// Mount data for `layers`, which are already topmost first as overlayfs
/// wants its `lowerdir`.
fn overlay_options(layers: &[PathBuf], upper: &Path, work: &Path) -> PodliteResult<String> {
    if layers.is_empty() {
        return Err(PodliteError::Storage(
            "cannot mount overlayfs with no lower directories".into(),
        ));
    }
    let lowerdir = layers
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    Ok(format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        work.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowerdir_keeps_topmost_first() {
        let layers = vec![PathBuf::from("/layers/app"), PathBuf::from("/layers/base")];
        let data =
            overlay_options(&layers, Path::new("/apps/.web/upper"), Path::new("/apps/.web/work"))
                .unwrap();
        assert_eq!(
            data,
            "lowerdir=/layers/app:/layers/base,upperdir=/apps/.web/upper,workdir=/apps/.web/work"
        );
        assert!(overlay_options(&[], Path::new("/u"), Path::new("/w")).is_err());
    }

    #[test]
    fn scratch_dirs_sit_beside_the_app_root() {
        let (upper, work) = scratch_dirs(Path::new("/apps/web")).unwrap();
        assert_eq!(upper, PathBuf::from("/apps/.web/upper"));
        assert_eq!(work, PathBuf::from("/apps/.web/work"));
    }

    #[test]
    fn clean_dir_empties_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(work.join("stale")).unwrap();
        ensure_clean_dir(&work).unwrap();
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    #[ignore = "requires root"]
    fn mounts_two_layers() {
        let dir = tempfile::tempdir().unwrap();
        let (top, base, target) = (dir.path().join("top"), dir.path().join("base"), dir.path().join("web"));
        for d in [&top, &base, &target] {
            std::fs::create_dir_all(d).unwrap();
        }
        std::fs::write(base.join("a"), "base").unwrap();
        std::fs::write(top.join("a"), "top").unwrap();

        OverlayProvisioner::new().unwrap().create(&target, &[top, base]).unwrap();
        assert_eq!(std::fs::read_to_string(target.join("a")).unwrap(), "top");
        nix::mount::umount(&target).unwrap();
    }
}
