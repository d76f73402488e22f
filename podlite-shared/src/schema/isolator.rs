//! Declarative isolators and their typed values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::isolators;
use crate::errors::{PodliteError, PodliteResult};

/// A named isolator with its raw JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Isolator {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Isolator {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Boolean isolators such as `os/linux/privileged`.
    pub fn as_bool(&self) -> PodliteResult<bool> {
        self.value.as_bool().ok_or_else(|| {
            PodliteError::Validation(format!("isolator {:?} must be a boolean", self.name))
        })
    }

    pub fn as_namespaces(&self) -> PodliteResult<LinuxNamespaces> {
        LinuxNamespaces::from_value(&self.value)
    }
}

/// Returns true when `name` is present in `list` and set to `true`.
pub fn flag_enabled(list: &[Isolator], name: &str) -> bool {
    list.iter()
        .find(|i| i.name == name)
        .and_then(|i| i.as_bool().ok())
        .unwrap_or(false)
}

/// The `os/linux/namespaces` isolator, if set on `list`.
pub fn namespaces(list: &[Isolator]) -> PodliteResult<Option<LinuxNamespaces>> {
    list.iter()
        .find(|i| i.name == isolators::LINUX_NAMESPACES)
        .map(Isolator::as_namespaces)
        .transpose()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Ipc,
    Mount,
    Net,
    Pid,
    User,
    Uts,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Ipc => "ipc",
            Namespace::Mount => "mount",
            Namespace::Net => "net",
            Namespace::Pid => "pid",
            Namespace::User => "user",
            Namespace::Uts => "uts",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = PodliteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipc" => Ok(Namespace::Ipc),
            "mount" => Ok(Namespace::Mount),
            "net" => Ok(Namespace::Net),
            "pid" => Ok(Namespace::Pid),
            "user" => Ok(Namespace::User),
            "uts" => Ok(Namespace::Uts),
            other => Err(PodliteError::Validation(format!(
                "unrecognized namespace {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceMode {
    /// A fresh namespace owned by the pod.
    #[default]
    #[serde(rename = "")]
    Default,
    /// Share the host's namespace.
    #[serde(rename = "host")]
    Host,
}

/// Value of the `os/linux/namespaces` isolator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinuxNamespaces {
    modes: BTreeMap<Namespace, NamespaceMode>,
}

impl LinuxNamespaces {
    pub fn from_value(value: &serde_json::Value) -> PodliteResult<Self> {
        let raw: BTreeMap<String, NamespaceMode> = serde_json::from_value(value.clone())
            .map_err(|e| {
                PodliteError::Validation(format!(
                    "invalid {} isolator: {}",
                    isolators::LINUX_NAMESPACES,
                    e
                ))
            })?;
        let mut modes = BTreeMap::new();
        for (key, mode) in raw {
            modes.insert(key.parse::<Namespace>()?, mode);
        }
        Ok(Self { modes })
    }

    pub fn with(mut self, ns: Namespace, mode: NamespaceMode) -> Self {
        self.modes.insert(ns, mode);
        self
    }

    pub fn get(&self, ns: Namespace) -> NamespaceMode {
        self.modes.get(&ns).copied().unwrap_or_default()
    }

    pub fn is_host(&self, ns: Namespace) -> bool {
        self.get(ns) == NamespaceMode::Host
    }

    pub fn to_isolator(&self) -> Isolator {
        let map: BTreeMap<&str, NamespaceMode> =
            self.modes.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        Isolator::new(
            isolators::LINUX_NAMESPACES,
            serde_json::to_value(map).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_namespace_modes() {
        let iso = Isolator::new(
            isolators::LINUX_NAMESPACES,
            json!({"net": "host", "ipc": ""}),
        );
        let ns = iso.as_namespaces().unwrap();
        assert!(ns.is_host(Namespace::Net));
        assert!(!ns.is_host(Namespace::Ipc));
        assert_eq!(ns.get(Namespace::Pid), NamespaceMode::Default);
    }

    #[test]
    fn rejects_unknown_namespace() {
        let iso = Isolator::new(isolators::LINUX_NAMESPACES, json!({"cgroup": "host"}));
        assert!(iso.as_namespaces().is_err());
    }

    #[test]
    fn flag_lookup() {
        let list = vec![
            Isolator::new(isolators::HOST_PRIVILEGED, json!(true)),
            Isolator::new(isolators::HOST_API_ACCESS, json!(false)),
        ];
        assert!(flag_enabled(&list, isolators::HOST_PRIVILEGED));
        assert!(!flag_enabled(&list, isolators::HOST_API_ACCESS));
        assert!(!flag_enabled(&list, isolators::LINUX_PRIVILEGED));
    }

    #[test]
    fn namespaces_serialize_back() {
        let ns = LinuxNamespaces::default().with(Namespace::Net, NamespaceMode::Host);
        let iso = ns.to_isolator();
        assert_eq!(iso.value, json!({"net": "host"}));
    }
}
