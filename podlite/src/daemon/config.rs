//! Daemon configuration file.

use std::path::{Path, PathBuf};

use podlite_shared::schema::{NetConf, PodManifest};
use podlite_shared::{PodliteError, PodliteResult};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    pub debug: bool,
    pub parent_cgroup_name: String,
    pub pods_directory: PathBuf,
    pub images_directory: PathBuf,
    pub volumes_directory: PathBuf,
    /// Host API socket handed to pods with `host/api-access`.
    pub socket_path: PathBuf,
    /// Hash of an imported image, or path to an image tarball.
    pub default_stager_image: String,
    /// Image tarballs imported at boot.
    pub prefetch_images: Vec<PathBuf>,
    pub pod_networks: Vec<NetConf>,
    pub initial_pods: Vec<InitialPod>,
    /// Rolling log files go here; stderr when unset.
    pub log_directory: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debug: false,
            parent_cgroup_name: "podlite".to_string(),
            pods_directory: PathBuf::from("/var/lib/podlite/pods"),
            images_directory: PathBuf::from("/var/lib/podlite/images"),
            volumes_directory: PathBuf::from("/var/lib/podlite/volumes"),
            socket_path: PathBuf::from("/var/lib/podlite.sock"),
            default_stager_image: String::new(),
            prefetch_images: Vec::new(),
            pod_networks: Vec::new(),
            initial_pods: Vec::new(),
            log_directory: None,
        }
    }
}

impl DaemonConfig {
    /// Loads a JSON or YAML file, chosen by extension.
    pub fn load(path: &Path) -> PodliteResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            PodliteError::Config(format!("failed to read configuration file: {}", e))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config: Self = match ext {
            "json" => serde_json::from_str(&data).map_err(|e| e.to_string()),
            "yml" | "yaml" => serde_yaml::from_str(&data).map_err(|e| e.to_string()),
            _ => {
                return Err(PodliteError::Config(
                    "unrecognized configuration file format, please use JSON or YAML".into(),
                ));
            }
        }
        .map_err(|e| PodliteError::Config(format!("failed to parse configuration file: {}", e)))?;

        config.absolutize()
    }

    /// Resolves relative directories against the working directory.
    fn absolutize(mut self) -> PodliteResult<Self> {
        let cwd = std::env::current_dir()?;
        for dir in [
            &mut self.pods_directory,
            &mut self.images_directory,
            &mut self.volumes_directory,
        ] {
            if dir.is_relative() {
                *dir = cwd.join(&*dir);
            }
        }
        Ok(self)
    }
}

/// A pod launched at boot: an image to run on its own, or a partial pod
/// manifest whose apps may name images instead of giving their ids.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawInitialPod")]
pub struct InitialPod {
    pub name: String,
    pub image: Option<String>,
    pub pod: Option<PodManifest>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInitialPod {
    Image(String),
    Spec {
        #[serde(default)]
        name: String,
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        pod: Option<PodManifest>,
    },
}

impl From<RawInitialPod> for InitialPod {
    fn from(raw: RawInitialPod) -> Self {
        match raw {
            RawInitialPod::Image(image) => InitialPod {
                image: Some(image),
                ..Default::default()
            },
            RawInitialPod::Spec { name, image, pod } => InitialPod { name, image, pod },
        }
    }
}
