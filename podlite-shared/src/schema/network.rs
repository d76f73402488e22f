//! Network driver configuration and results.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A network driver definition.
///
/// Only `name`, `aci`, `containerInterface` and `default` are interpreted;
/// the full document is kept in `raw` and handed to the driver unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetConf {
    pub name: String,
    pub aci: String,
    pub container_interface: String,
    /// Attached to pods that do not name their networks.
    pub default: bool,
    pub raw: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetConfFields {
    #[serde(default)]
    name: String,
    #[serde(default)]
    aci: String,
    #[serde(default)]
    container_interface: String,
    #[serde(default)]
    default: bool,
}

impl<'de> Deserialize<'de> for NetConf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let fields: NetConfFields =
            serde_json::from_value(raw.clone()).map_err(serde::de::Error::custom)?;
        Ok(NetConf {
            name: fields.name,
            aci: fields.aci,
            container_interface: fields.container_interface,
            default: fields.default,
            raw,
        })
    }
}

impl Serialize for NetConf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl NetConf {
    pub fn from_json(raw: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(raw)
    }

    /// The raw configuration as bytes, written to the driver's stdin.
    pub fn raw_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.raw).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    /// A DNS block carrying no information at all.
    pub fn is_blank(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_empty()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// Result reported by a driver's `add` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpResult {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub container_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<IpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<IpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn netconf_keeps_raw_document() {
        let raw = json!({
            "name": "bridge",
            "aci": "podlite/bridge",
            "containerInterface": "veth{{num}}",
            "bridge": "br0",
            "ipMasq": true
        });
        let conf = NetConf::from_json(raw.clone()).unwrap();
        assert_eq!(conf.name, "bridge");
        assert_eq!(conf.container_interface, "veth{{num}}");
        assert_eq!(serde_json::to_value(&conf).unwrap(), raw);
        assert_eq!(conf.raw_bytes(), serde_json::to_vec(&raw).unwrap());
    }

    #[test]
    fn blank_dns() {
        assert!(Dns::default().is_blank());
        let dns = Dns {
            domain: "example.com".into(),
            ..Default::default()
        };
        assert!(!dns.is_blank());
    }

    #[test]
    fn ip_result_from_driver_output() {
        let out = br#"{"ip4":{"ip":"127.0.0.1/8"}}"#;
        let result: IpResult = serde_json::from_slice(out).unwrap();
        assert_eq!(result.ip4.unwrap().ip, "127.0.0.1/8");
        assert!(result.dns.is_none());
    }
}
