//! Image store backed by a temp directory, filled from manifests directly.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use podlite::images::{resolve_tree, ImageLookup, ImageManager, ResolutionTree};
use podlite_shared::schema::{App, Dependency, ImageManifest, NameValue};
use podlite_shared::{PodliteError, PodliteResult};
use tempfile::TempDir;

pub struct MockImageManager {
    dir: TempDir,
    images: RwLock<HashMap<String, ImageManifest>>,
    counter: AtomicU64,
}

impl MockImageManager {
    pub fn new() -> PodliteResult<Self> {
        Ok(Self {
            dir: TempDir::new()?,
            images: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Registers `manifest` with an empty root filesystem and returns its
    /// hash.
    pub fn add(&self, manifest: ImageManifest) -> PodliteResult<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let hash = format!("sha512-{:032x}", n);
        fs::create_dir_all(self.rootfs_path(&hash))?;
        self.images.write().insert(hash.clone(), manifest);
        Ok(hash)
    }
}

impl ImageLookup for MockImageManager {
    fn manifest(&self, hash: &str) -> Option<ImageManifest> {
        self.images.read().get(hash).cloned()
    }

    fn find(&self, name: &str, version: &str) -> Option<String> {
        self.images
            .read()
            .iter()
            .find(|(_, m)| {
                m.name == name && (version.is_empty() || m.label("version") == Some(version))
            })
            .map(|(hash, _)| hash.clone())
    }

    fn rootfs_path(&self, hash: &str) -> PathBuf {
        self.dir.path().join(hash).join("rootfs")
    }
}

impl ImageManager for MockImageManager {
    fn rescan(&self) -> PodliteResult<()> {
        Ok(())
    }

    fn create_image(&self, _reader: &mut dyn Read) -> PodliteResult<(String, ImageManifest)> {
        Err(PodliteError::Image(
            "the mock image store does not import archives".into(),
        ))
    }

    fn list_images(&self) -> HashMap<String, ImageManifest> {
        self.images.read().clone()
    }

    fn get_image(&self, hash: &str) -> Option<ImageManifest> {
        self.manifest(hash)
    }

    fn find_image(&self, name: &str, version: &str) -> Option<(String, ImageManifest)> {
        let hash = self.find(name, version)?;
        self.manifest(&hash).map(|m| (hash, m))
    }

    fn get_image_size(&self, hash: &str) -> PodliteResult<u64> {
        if self.images.read().contains_key(hash) {
            Ok(0)
        } else {
            Err(PodliteError::NotFound(format!("image {:?} not found", hash)))
        }
    }

    fn delete_image(&self, hash: &str) -> PodliteResult<()> {
        self.images
            .write()
            .remove(hash)
            .map(|_| ())
            .ok_or_else(|| PodliteError::NotFound(format!("image {:?} not found", hash)))
    }

    fn resolve_tree(&self, hash: &str) -> PodliteResult<ResolutionTree> {
        resolve_tree(self, hash)
    }
}

/// An image whose app is the stager.
pub fn stager_manifest() -> ImageManifest {
    app_manifest("podlite/stager", &["/stager"])
}

pub fn app_manifest(name: &str, exec: &[&str]) -> ImageManifest {
    let mut manifest = ImageManifest::new(name);
    manifest.app = Some(App {
        exec: exec.iter().map(|s| s.to_string()).collect(),
        user: "0".into(),
        group: "0".into(),
        ..Default::default()
    });
    manifest
}

/// A layer image without an app that depends on nothing.
pub fn layer_manifest(name: &str, version: &str) -> ImageManifest {
    let mut manifest = ImageManifest::new(name);
    manifest.labels.push(NameValue::new("version", version));
    manifest
}

/// Adds a dependency on `name` at `version` to `manifest`.
pub fn depends_on(mut manifest: ImageManifest, name: &str, version: &str) -> ImageManifest {
    manifest.dependencies.push(Dependency {
        image_name: name.into(),
        image_id: None,
        labels: vec![NameValue::new("version", version)],
    });
    manifest
}
