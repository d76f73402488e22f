//! Stager filesystem layout.
//!
//! The stager runs with its own root filesystem, so every well-known path is
//! absolute. Tests point the layout at a scratch directory instead.

use std::path::{Path, PathBuf};

use podlite_shared::constants::stager::{
    APPS_DIR, CONTAINERS_DIR, INIT_DIR, LAYERS_DIR, LOGS_DIR, MANIFEST_PATH, READY_SOCKET,
    STATE_PATH, VOLUMES_DIR,
};

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an absolute in-pod path under this layout's root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    pub fn manifest(&self) -> PathBuf {
        self.resolve(MANIFEST_PATH)
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(STATE_PATH)
    }

    pub fn ready_socket(&self) -> PathBuf {
        self.resolve(READY_SOCKET)
    }

    pub fn containers(&self) -> PathBuf {
        self.resolve(CONTAINERS_DIR)
    }

    pub fn apps(&self) -> PathBuf {
        self.resolve(APPS_DIR)
    }

    pub fn app_root(&self, app: &str) -> PathBuf {
        self.apps().join(app)
    }

    pub fn init_root(&self) -> PathBuf {
        self.resolve(INIT_DIR)
    }

    pub fn logs(&self) -> PathBuf {
        self.resolve(LOGS_DIR)
    }

    pub fn layer(&self, hash: &str) -> PathBuf {
        self.resolve(LAYERS_DIR).join(hash)
    }

    pub fn volume(&self, name: &str) -> PathBuf {
        self.resolve(VOLUMES_DIR).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_resolve_under_root() {
        let layout = Layout::new("/tmp/pod");
        assert_eq!(layout.manifest(), PathBuf::from("/tmp/pod/manifest"));
        assert_eq!(layout.app_root("web"), PathBuf::from("/tmp/pod/apps/web"));
        assert_eq!(layout.layer("sha512-ab"), PathBuf::from("/tmp/pod/layers/sha512-ab"));
        assert_eq!(Layout::default().state_file(), PathBuf::from("/state.json"));
    }
}
