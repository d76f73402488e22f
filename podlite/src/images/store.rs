//! Directory-backed image store.
//!
//! Layout: `<root>/<hash>/manifest` and `<root>/<hash>/rootfs/`. Manifests are
//! cached in memory; the cache is only refreshed by [`DirImageStore::rescan`]
//! or by this store's own create/delete calls.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use podlite_shared::constants::pod::{IMAGE_MANIFEST, IMAGE_ROOTFS};
use podlite_shared::schema::{is_image_hash, ImageManifest};
use podlite_shared::{PodliteError, PodliteResult};
use walkdir::WalkDir;

use super::archive;
use super::resolver::{self, ImageLookup};
use super::{ImageManager, ResolutionTree};

pub struct DirImageStore {
    root: PathBuf,
    images: RwLock<HashMap<String, ImageManifest>>,
}

impl DirImageStore {
    /// Opens the store at `root`, creating it if needed, and loads its images.
    pub fn open(root: impl Into<PathBuf>) -> PodliteResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            PodliteError::Storage(format!(
                "Failed to create images directory {}: {}",
                root.display(),
                e
            ))
        })?;
        let store = Self {
            root,
            images: RwLock::new(HashMap::new()),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory of image `hash`; anything but a `sha512-<hex>` hash is
    /// rejected so callers cannot reach outside the store.
    fn image_dir(&self, hash: &str) -> PodliteResult<PathBuf> {
        if !is_image_hash(hash) {
            return Err(PodliteError::Image(format!("{:?} is not a valid image hash", hash)));
        }
        Ok(self.root.join(hash))
    }

    fn load_manifest(&self, hash: &str) -> PodliteResult<ImageManifest> {
        let path = self.image_dir(hash)?.join(IMAGE_MANIFEST);
        let data = fs::read(&path).map_err(|e| {
            PodliteError::Image(format!("failed to read manifest {}: {}", path.display(), e))
        })?;
        let manifest: ImageManifest = serde_json::from_slice(&data).map_err(|e| {
            PodliteError::Image(format!("failed to parse manifest {}: {}", path.display(), e))
        })?;
        self.images.write().insert(hash.to_string(), manifest.clone());
        Ok(manifest)
    }
}

impl ImageLookup for DirImageStore {
    fn manifest(&self, hash: &str) -> Option<ImageManifest> {
        self.get_image(hash)
    }

    fn find(&self, name: &str, version: &str) -> Option<String> {
        self.find_image(name, version).map(|(hash, _)| hash)
    }

    fn rootfs_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash).join(IMAGE_ROOTFS)
    }
}

impl ImageManager for DirImageStore {
    fn rescan(&self) -> PodliteResult<()> {
        self.images.write().clear();

        let entries = fs::read_dir(&self.root).map_err(|e| {
            PodliteError::Storage(format!("Failed to read {}: {}", self.root.display(), e))
        })?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Err(e) = self.load_manifest(&name) {
                tracing::warn!(image = %name, error = %e, "Failed to load existing manifest, removing");
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    tracing::warn!(image = %name, error = %e, "Failed to remove invalid image");
                }
            }
        }

        tracing::debug!(count = self.images.read().len(), "Rescanned image store");
        Ok(())
    }

    fn create_image(&self, reader: &mut dyn Read) -> PodliteResult<(String, ImageManifest)> {
        let (mut spool, hash) = archive::spool_and_hash(reader)?;

        if let Some(manifest) = self.images.read().get(&hash) {
            return Ok((hash, manifest.clone()));
        }

        let dest = self.root.join(&hash);
        fs::create_dir(&dest).map_err(|e| {
            PodliteError::Image(format!("Failed to create {}: {}", dest.display(), e))
        })?;

        let result = archive::extract(spool.as_file_mut(), &dest).and_then(|_| self.load_manifest(&hash));
        match result {
            Ok(manifest) => {
                tracing::info!(image = %hash, name = %manifest.name, "Imported image");
                Ok((hash, manifest))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&dest);
                Err(e)
            }
        }
    }

    fn list_images(&self) -> HashMap<String, ImageManifest> {
        self.images.read().clone()
    }

    fn get_image(&self, hash: &str) -> Option<ImageManifest> {
        self.images.read().get(hash).cloned()
    }

    fn find_image(&self, name: &str, version: &str) -> Option<(String, ImageManifest)> {
        self.images
            .read()
            .iter()
            .find(|(_, m)| {
                m.name == name && (version.is_empty() || m.label("version").unwrap_or("") == version)
            })
            .map(|(h, m)| (h.clone(), m.clone()))
    }

    fn get_image_size(&self, hash: &str) -> PodliteResult<u64> {
        let path = self.image_dir(hash)?;
        if !path.exists() {
            return Err(PodliteError::NotFound(format!(
                "failed to locate image path: {}",
                path.display()
            )));
        }
        let mut total = 0u64;
        for entry in WalkDir::new(&path).follow_links(false) {
            let entry = entry.map_err(|e| PodliteError::Storage(e.to_string()))?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(|e| PodliteError::Storage(e.to_string()))?.len();
            }
        }
        Ok(total)
    }

    fn delete_image(&self, hash: &str) -> PodliteResult<()> {
        if hash.is_empty() {
            return Ok(());
        }
        let path = self.image_dir(hash)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PodliteError::Storage(format!(
                    "Failed to remove image {}: {}",
                    hash, e
                )))
            }
        }
        self.images.write().remove(hash);
        tracing::info!(image = %hash, "Deleted image");
        Ok(())
    }

    fn resolve_tree(&self, hash: &str) -> PodliteResult<ResolutionTree> {
        resolver::resolve_tree(self, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::archive::tests::image_tar;
    use tempfile::TempDir;

    fn manifest_json(name: &str, version: &str) -> String {
        format!(
            r#"{{"acKind":"ImageManifest","acVersion":"0.7.4","name":"{}",
                 "labels":[{{"name":"version","value":"{}"}}]}}"#,
            name, version
        )
    }

    #[test]
    fn create_is_idempotent_per_content() {
        let dir = TempDir::new().unwrap();
        let store = DirImageStore::open(dir.path()).unwrap();
        let tar = image_tar(&manifest_json("example/app", "1.0"), &[("bin/app", b"\x7fELF")]);

        let (hash, manifest) = store.create_image(&mut &tar[..]).unwrap();
        assert!(hash.starts_with("sha512-"));
        assert_eq!(manifest.name, "example/app");
        assert!(dir.path().join(&hash).join("rootfs/bin/app").exists());

        let (again, _) = store.create_image(&mut &tar[..]).unwrap();
        assert_eq!(hash, again);
        assert_eq!(store.list_images().len(), 1);
    }

    #[test]
    fn failed_import_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = DirImageStore::open(dir.path()).unwrap();
        let tar = image_tar("not json", &[]);

        assert!(store.create_image(&mut &tar[..]).is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rescan_drops_invalid_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("lost+found")).unwrap();
        fs::create_dir(dir.path().join("sha512-abc")).unwrap();

        let store = DirImageStore::open(dir.path()).unwrap();
        assert!(store.list_images().is_empty());
        assert!(!dir.path().join("lost+found").exists());
        assert!(!dir.path().join("sha512-abc").exists());
    }

    #[test]
    fn find_by_name_and_version() {
        let dir = TempDir::new().unwrap();
        let store = DirImageStore::open(dir.path()).unwrap();
        let t1 = image_tar(&manifest_json("example/base", "1.0"), &[]);
        let t2 = image_tar(&manifest_json("example/base", "2.0"), &[]);
        let (h1, _) = store.create_image(&mut &t1[..]).unwrap();
        let (h2, _) = store.create_image(&mut &t2[..]).unwrap();

        assert_eq!(store.find_image("example/base", "1.0").unwrap().0, h1);
        assert_eq!(store.find_image("example/base", "2.0").unwrap().0, h2);
        assert!(store.find_image("example/base", "").is_some());
        assert!(store.find_image("example/base", "3.0").is_none());
    }

    #[test]
    fn size_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = DirImageStore::open(dir.path()).unwrap();
        let tar = image_tar(&manifest_json("example/app", "1.0"), &[("data", &[0u8; 100])]);
        let (hash, _) = store.create_image(&mut &tar[..]).unwrap();

        assert!(store.get_image_size(&hash).unwrap() >= 100);

        store.delete_image("").unwrap();
        store.delete_image(&hash).unwrap();
        assert!(store.get_image(&hash).is_none());
        assert!(store.get_image_size(&hash).is_err());
    }

    #[test]
    fn hashes_outside_the_store_are_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("images");
        let store = DirImageStore::open(&root).unwrap();
        let victim = dir.path().join("victim");
        fs::create_dir(&victim).unwrap();
        fs::write(victim.join("data"), "keep").unwrap();

        for hash in ["../victim", "sha512-../../victim", "/tmp", "sha256-abcd"] {
            assert!(store.delete_image(hash).is_err(), "{}", hash);
            assert!(store.get_image_size(hash).is_err(), "{}", hash);
        }
        assert!(victim.join("data").exists());
    }

    #[test]
    fn resolve_single_image() {
        let dir = TempDir::new().unwrap();
        let store = DirImageStore::open(dir.path()).unwrap();
        let tar = image_tar(&manifest_json("example/app", "1.0"), &[]);
        let (hash, _) = store.create_image(&mut &tar[..]).unwrap();

        let tree = store.resolve_tree(&hash).unwrap();
        assert_eq!(tree.order, vec![hash.clone()]);
        assert_eq!(tree.paths[&hash], dir.path().join(&hash).join("rootfs"));
    }
}
