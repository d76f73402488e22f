//! Content-addressed image store and dependency resolution.

mod archive;
mod resolver;
mod store;

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;

use podlite_shared::schema::ImageManifest;
use podlite_shared::PodliteResult;

pub use resolver::{resolve_tree, ImageLookup};
pub use store::DirImageStore;

/// Result of walking an image's dependency graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionTree {
    /// Requested image first, then dependencies in first-visited DFS order.
    pub order: Vec<String>,
    /// Image hash to its root filesystem directory.
    pub paths: HashMap<String, PathBuf>,
    /// Image hash to its manifest.
    pub manifests: HashMap<String, ImageManifest>,
}

/// Storage of filesystem images, addressed by `sha512-<hex>` hashes.
pub trait ImageManager: Send + Sync {
    /// Drops the in-memory cache and reloads it from disk.
    fn rescan(&self) -> PodliteResult<()>;

    /// Imports an image tarball, returning its hash and manifest.
    fn create_image(&self, reader: &mut dyn Read) -> PodliteResult<(String, ImageManifest)>;

    fn list_images(&self) -> HashMap<String, ImageManifest>;

    fn get_image(&self, hash: &str) -> Option<ImageManifest>;

    /// Finds an image by name; an empty `version` matches any version.
    fn find_image(&self, name: &str, version: &str) -> Option<(String, ImageManifest)>;

    /// On-disk size of the image in bytes.
    fn get_image_size(&self, hash: &str) -> PodliteResult<u64>;

    fn delete_image(&self, hash: &str) -> PodliteResult<()>;

    fn resolve_tree(&self, hash: &str) -> PodliteResult<ResolutionTree>;
}
