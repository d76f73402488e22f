//! Graph storage: assembling an app's root filesystem from its layers.

mod overlay;

use std::path::{Path, PathBuf};

use podlite_shared::{PodliteError, PodliteResult};

pub use overlay::OverlayProvisioner;

pub trait StorageProvisioner: Send + Sync {
    /// Builds a root filesystem at `target` from `layers`, topmost first.
    fn create(&self, target: &Path, layers: &[PathBuf]) -> PodliteResult<()>;
}

/// Selects a provisioner by its configured name.
pub fn provisioner(name: &str) -> PodliteResult<Box<dyn StorageProvisioner>> {
    match name {
        "overlay" => Ok(Box::new(OverlayProvisioner::new()?)),
        other => Err(PodliteError::Config(format!(
            "unrecognized graph storage provider {:?} specified",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider() {
        let err = provisioner("aufs").err().unwrap();
        assert!(err
            .to_string()
            .contains("unrecognized graph storage provider \"aufs\" specified"));
    }
}
