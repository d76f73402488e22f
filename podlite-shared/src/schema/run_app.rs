use serde::{Deserialize, Serialize};

use super::NameValue;

/// A process to start inside a running app container, handed to the
/// stager's run helper by Enter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunApp {
    pub exec: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
    #[serde(rename = "supplementaryGIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub supplementary_gids: Vec<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<NameValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
}

impl RunApp {
    /// Runs `exec` as root with no extra settings.
    pub fn root(exec: Vec<String>) -> Self {
        Self {
            exec,
            user: "0".into(),
            group: "0".into(),
            ..Default::default()
        }
    }
}
