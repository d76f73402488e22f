//! Directory helpers for pod setup and teardown.

use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};
use podlite_shared::{PodliteError, PodliteResult};
use walkdir::WalkDir;

/// Creates each directory in order and forces `mode` on it.
///
/// With `exist_ok` false an existing path is an error; with it true an
/// existing non-directory still is.
pub fn mkdirs<P: AsRef<Path>>(dirs: &[P], mode: u32, exist_ok: bool) -> PodliteResult<()> {
    for dir in dirs {
        let dir = dir.as_ref();
        match fs::symlink_metadata(dir) {
            Ok(meta) => {
                if !exist_ok {
                    return Err(PodliteError::Storage(format!(
                        "lstat: path already exists: {}",
                        dir.display()
                    )));
                }
                if !meta.is_dir() {
                    return Err(PodliteError::Storage(format!(
                        "lstat: {} is not a directory",
                        dir.display()
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(dir)
                    .map_err(|e| PodliteError::Storage(format!("mkdir: {}", e)))?;
            }
            Err(e) => return Err(e.into()),
        }

        // umask applies to create_dir
        fs::set_permissions(dir, fs::Permissions::from_mode(mode))
            .map_err(|e| PodliteError::Storage(format!("chmod: {}", e)))?;
    }
    Ok(())
}

/// Copies the tree at `src` into `dst`, merging with what is already there.
///
/// Permissions are kept and symlinks are recreated, not followed.
pub fn copy_tree(src: &Path, dst: &Path) -> PodliteResult<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| PodliteError::Storage(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PodliteError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !target.exists() {
                fs::create_dir(&target)?;
            }
            let mode = entry
                .metadata()
                .map_err(|e| PodliteError::Storage(e.to_string()))?
                .permissions();
            fs::set_permissions(&target, mode)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Mount points from /proc/mounts content at or below `root`, in mount order.
pub fn mounts_under(proc_mounts: &str, root: &Path) -> Vec<PathBuf> {
    let prefix = format!("{}/", root.display());
    proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|point| Path::new(point) == root || point.starts_with(&prefix))
        .map(PathBuf::from)
        .collect()
}

/// Deepest mount points first; equal depths keep reverse mount order so
/// stacked mounts come off top down.
pub fn unmount_order(mut points: Vec<PathBuf>) -> Vec<PathBuf> {
    points.reverse();
    points.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    points
}

/// Unmounts everything at or below `root`, children before parents.
pub fn unmount_tree(root: &Path) -> PodliteResult<()> {
    let content = fs::read_to_string("/proc/mounts")
        .map_err(|e| PodliteError::Storage(format!("Failed to read /proc/mounts: {}", e)))?;

    for point in unmount_order(mounts_under(&content, root)) {
        umount2(&point, MntFlags::MNT_FORCE).map_err(|e| {
            PodliteError::Storage(format!("failed to unmount {:?}: {}", point, e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn mkdirs_rejects_existing_unless_allowed() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = a.join("b");

        mkdirs(&[&a, &b], 0o755, false).unwrap();
        let mode = fs::metadata(&b).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);

        let err = mkdirs(&[&a], 0o755, false).unwrap_err();
        assert!(err.to_string().contains("path already exists"));
        mkdirs(&[&a], 0o700, true).unwrap();

        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(mkdirs(&[&file], 0o755, true).is_err());
    }

    #[test]
    fn copy_tree_merges_and_keeps_links() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("opt/stager")).unwrap();
        fs::write(src.path().join("opt/stager/stager"), b"bin").unwrap();
        symlink("stager", src.path().join("opt/stager/run")).unwrap();
        fs::create_dir(dst.path().join("opt")).unwrap();
        fs::write(dst.path().join("opt/keep"), b"x").unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("opt/stager/stager")).unwrap(), b"bin");
        assert_eq!(
            fs::read_link(dst.path().join("opt/stager/run")).unwrap(),
            PathBuf::from("stager")
        );
        assert!(dst.path().join("opt/keep").exists());
    }

    #[test]
    fn mounts_under_matches_root_and_children_only() {
        let mounts = "\
proc /proc proc rw 0 0
/dev/sda1 /var/lib/podlite/pods/abc ext4 rw 0 0
overlay /var/lib/podlite/pods/abc/stager/apps/web overlay rw 0 0
/dev/sda1 /var/lib/podlite/pods/abcdef ext4 rw 0 0
tmpfs /var/lib/podlite/pods/abc/stager/layers/x tmpfs rw 0 0
";
        let points = mounts_under(mounts, Path::new("/var/lib/podlite/pods/abc"));
        assert_eq!(
            points,
            vec![
                PathBuf::from("/var/lib/podlite/pods/abc"),
                PathBuf::from("/var/lib/podlite/pods/abc/stager/apps/web"),
                PathBuf::from("/var/lib/podlite/pods/abc/stager/layers/x"),
            ]
        );
    }

    #[test]
    fn unmount_children_before_parents() {
        let points = vec![
            PathBuf::from("/pods/abc/stager/apps/web"),
            PathBuf::from("/pods/abc"),
            PathBuf::from("/pods/abc/stager/layers/x"),
            PathBuf::from("/pods/abc/stager/apps/web/proc"),
            PathBuf::from("/pods/abc/stager/apps/web"),
        ];
        assert_eq!(
            unmount_order(points),
            vec![
                PathBuf::from("/pods/abc/stager/apps/web/proc"),
                PathBuf::from("/pods/abc/stager/apps/web"),
                PathBuf::from("/pods/abc/stager/layers/x"),
                PathBuf::from("/pods/abc/stager/apps/web"),
                PathBuf::from("/pods/abc"),
            ]
        );
    }
}
