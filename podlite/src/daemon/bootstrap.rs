//! Daemon startup.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use podlite_shared::container::ContainerFactory;
use podlite_shared::schema::{is_image_hash, PodManifest, RuntimeApp, RuntimeImage};
use podlite_shared::{PodliteError, PodliteResult};

use super::config::{DaemonConfig, InitialPod};
use crate::images::{DirImageStore, ImageManager};
use crate::network::{DriverManager, NamespaceCreator, NetworkDriver, NetworkManager, NetworkOptions};
use crate::pod::{Manager, Options, PodOptions};

/// The running daemon's components.
pub struct Daemon {
    pub images: Arc<DirImageStore>,
    pub pods: Arc<Manager>,
    pub network: Arc<DriverManager>,
}

impl Daemon {
    /// Stops every pod, the networking pod last.
    pub async fn shutdown(&self) {
        self.pods.shutdown().await;
    }
}

/// Brings up the image store, pod manager and network manager, then
/// launches the networking pod and the configured initial pods.
///
/// Failures of individual prefetch images, network drivers and initial pods
/// are logged and skipped.
pub async fn bootstrap(
    config: &DaemonConfig,
    factory: Arc<dyn ContainerFactory>,
    namespaces: Arc<dyn NamespaceCreator>,
) -> PodliteResult<Daemon> {
    let images = Arc::new(DirImageStore::open(&config.images_directory).map_err(|e| {
        PodliteError::Config(format!("failed to create the image manager: {}", e))
    })?);

    for path in &config.prefetch_images {
        match import_image(images.as_ref(), path) {
            Ok(hash) => tracing::debug!(image = %hash, path = %path.display(), "Fetched image"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to fetch image"),
        }
    }

    if config.default_stager_image.is_empty() {
        return Err(PodliteError::Config(
            "a defaultStagerImage setting must be specified".into(),
        ));
    }
    let stager_hash = load_image(images.as_ref(), &config.default_stager_image).map_err(|e| {
        PodliteError::Config(format!(
            "failed to fetch default stager image {:?}: {}",
            config.default_stager_image, e
        ))
    })?;

    let opts = Options {
        pod_directory: config.pods_directory.clone(),
        volume_directory: config.volumes_directory.clone(),
        parent_cgroup_name: config.parent_cgroup_name.clone(),
        default_stager_hash: stager_hash,
        host_socket_file: config.socket_path.clone(),
        ..Default::default()
    };
    let image_manager: Arc<dyn ImageManager> = images.clone();
    let pods = Manager::new(opts, image_manager, None, factory)
        .map_err(|e| PodliteError::Config(format!("failed to create the pod manager: {}", e)))?;
    tracing::debug!("Pod manager has been initialized");

    let network = DriverManager::new(&pods, namespaces, NetworkOptions::default())?;
    pods.set_network_manager(network.clone());

    let drivers = config
        .pod_networks
        .iter()
        .filter_map(|conf| match load_image(images.as_ref(), &conf.aci) {
            Ok(hash) => Some(NetworkDriver {
                image: RuntimeImage {
                    id: hash,
                    ..Default::default()
                },
                config: conf.clone(),
            }),
            Err(e) => {
                tracing::warn!(network = %conf.name, error = %e, "Failed to load image for network");
                None
            }
        })
        .collect();
    if let Err(e) = network.setup(drivers).await {
        tracing::error!(error = %e, "Failed to set up the networking pod");
    }

    start_initial_pods(&pods, images.as_ref(), &config.initial_pods);

    Ok(Daemon {
        images,
        pods,
        network,
    })
}

fn import_image(images: &dyn ImageManager, path: &Path) -> PodliteResult<String> {
    let mut file = File::open(path)?;
    let (hash, _) = images.create_image(&mut file)?;
    Ok(hash)
}

/// Resolves an image reference: a known hash, a tarball path, or an image
/// name already in the store.
fn load_image(images: &dyn ImageManager, reference: &str) -> PodliteResult<String> {
    if is_image_hash(reference) {
        return images
            .get_image(reference)
            .map(|_| reference.to_string())
            .ok_or_else(|| PodliteError::NotFound(format!("image {:?} not found", reference)));
    }
    let path = Path::new(reference);
    if path.is_file() {
        return import_image(images, path);
    }
    images
        .find_image(reference, "")
        .map(|(hash, _)| hash)
        .ok_or_else(|| PodliteError::NotFound(format!("image {:?} not found", reference)))
}

fn start_initial_pods(pods: &Arc<Manager>, images: &dyn ImageManager, initial: &[InitialPod]) {
    for (i, entry) in initial.iter().enumerate() {
        let name = if entry.name.is_empty() {
            format!("initial-pod-{}", i + 1)
        } else {
            entry.name.clone()
        };

        let manifest = match initial_pod_manifest(entry, images) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!(pod = %name, error = %e, "Failed to configure pod, skipping");
                continue;
            }
        };

        match pods.create(&name, manifest, PodOptions::default()) {
            Ok(pod) => tracing::info!(pod_id = %pod.uuid(), pod = %name, "Launched initial pod"),
            Err(e) => tracing::error!(pod = %name, error = %e, "Failed to launch pod"),
        }
    }
}

/// Completes an initial pod entry into a runnable manifest.
pub fn initial_pod_manifest(entry: &InitialPod, images: &dyn ImageManager) -> PodliteResult<PodManifest> {
    if let Some(pod) = &entry.pod {
        let mut pod = pod.clone();
        for app in &mut pod.apps {
            if !app.image.id.is_empty() {
                continue;
            }
            let (hash, image) = images
                .find_image(&app.image.name, app.image.version())
                .ok_or_else(|| {
                    PodliteError::NotFound(format!("unable to locate image for {}", app.image.name))
                })?;
            app.image = RuntimeImage {
                name: image.name,
                id: hash,
                labels: image.labels,
            };
        }
        return Ok(pod);
    }

    let reference = entry
        .image
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PodliteError::Config("failed to get a valid pod manifest".into()))?;
    let hash = load_image(images, reference)?;
    let image = images
        .get_image(&hash)
        .ok_or_else(|| PodliteError::NotFound(format!("image {:?} not found", hash)))?;

    let mut pod = PodManifest::blank();
    pod.apps.push(RuntimeApp {
        name: app_name_for(&image.name).ok_or_else(|| {
            PodliteError::Validation(format!("failed to generate app name for {:?}", reference))
        })?,
        image: RuntimeImage {
            id: hash,
            ..Default::default()
        },
        ..Default::default()
    });
    Ok(pod)
}

/// App name derived from the last path segment of an image name.
fn app_name_for(image_name: &str) -> Option<String> {
    let last = image_name.rsplit('/').next().unwrap_or(image_name);
    let mut name = String::with_capacity(last.len());
    for c in last.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else if !name.is_empty() && !name.ends_with('-') {
            name.push('-');
        }
    }
    let name = name.trim_end_matches('-').to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_names_from_image_names() {
        assert_eq!(app_name_for("example.com/nginx").as_deref(), Some("nginx"));
        assert_eq!(app_name_for("podlite/Net_Driver.v2").as_deref(), Some("net-driver-v2"));
        assert_eq!(app_name_for("registry/__"), None);
    }
}
