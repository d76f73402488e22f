//! Contract between the pod manager and the stager.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::image::ImageManifest;
use super::pod::PodManifest;
use crate::constants::stager::DEFAULT_GRAPH_STORAGE;

/// Written once by the manager into the stager root, read once at stager startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagerManifest {
    pub version: String,
    pub name: String,
    pub pod: PodManifest,
    /// Image hash to manifest, for every layer used by any app.
    pub images: HashMap<String, ImageManifest>,
    /// App name to layer hashes, topmost first.
    pub app_image_order: HashMap<String, Vec<String>>,
    /// Opaque to the manager; parsed by the stager as [`StagerConfig`].
    #[serde(default = "empty_config")]
    pub stager_config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl StagerManifest {
    pub fn new(version: impl Into<String>, name: impl Into<String>, pod: PodManifest) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            pod,
            images: HashMap::new(),
            app_image_order: HashMap::new(),
            stager_config: empty_config(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagerConfig {
    /// Namespaces the pod may never share with the host.
    pub required_namespaces: Vec<String>,
    /// Namespaces owned by the init process unless an isolator says otherwise.
    pub default_namespaces: Vec<String>,
    pub graph_storage: String,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            required_namespaces: vec!["ipc".into(), "pid".into(), "uts".into()],
            default_namespaces: vec!["ipc".into(), "net".into(), "pid".into(), "uts".into()],
            graph_storage: DEFAULT_GRAPH_STORAGE.to_string(),
        }
    }
}

impl StagerConfig {
    /// Overlays the fields present in `raw` on top of the defaults.
    pub fn from_value(raw: &serde_json::Value) -> serde_json::Result<Self> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Partial {
            required_namespaces: Option<Vec<String>>,
            default_namespaces: Option<Vec<String>>,
            graph_storage: Option<String>,
        }

        let mut config = Self::default();
        if raw.is_null() {
            return Ok(config);
        }
        let partial: Partial = serde_json::from_value(raw.clone())?;
        if let Some(v) = partial.required_namespaces {
            config.required_namespaces = v;
        }
        if let Some(v) = partial.default_namespaces {
            config.default_namespaces = v;
        }
        if let Some(v) = partial.graph_storage {
            config.graph_storage = v;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagerPhase {
    #[default]
    Setup,
    Running,
    Teardown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pid: i32,
    pub exited: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exit_reason: String,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Stager-local runtime state, persisted for external inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagerState {
    pub apps: BTreeMap<String, AppState>,
    pub state: StagerPhase,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stager_config_defaults_fill_missing_fields() {
        let config = StagerConfig::from_value(&json!({"graphStorage": "aufs"})).unwrap();
        assert_eq!(config.graph_storage, "aufs");
        assert_eq!(config.required_namespaces, vec!["ipc", "pid", "uts"]);

        let config = StagerConfig::from_value(&json!({})).unwrap();
        assert_eq!(config, StagerConfig::default());
    }

    #[test]
    fn app_state_omits_zero_fields() {
        let state = AppState {
            exited: true,
            ..Default::default()
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v, json!({"exited": true}));
    }

    #[test]
    fn manifest_defaults_stager_config_to_empty_object() {
        let m = StagerManifest::new("0.1.0", "web", PodManifest::blank());
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["stagerConfig"], json!({}));
        assert_eq!(v["appImageOrder"], json!({}));
    }
}
