//! Compose manifest subset.
//!
//! Only the parts the driver needs are typed: service ports, volumes and
//! the routing extensions. Everything else survives parsing untouched
//! through flattened maps, so the rewritten manifest handed to the
//! compose CLI keeps the original configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Parsed compose file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeFile {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ComposeService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, ComposeVolume>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// One service block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeEntry>,
    /// Overrides the sub-domain allocated to this service.
    #[serde(rename = "x-domain", default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Marks the service answering the bare-namespace domain.
    #[serde(rename = "x-root", default, skip_serializing_if = "is_false")]
    pub root: bool,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// Top-level volume block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComposeVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<Value>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl ComposeVolume {
    /// Externally managed volumes are excluded from the backup set.
    pub fn is_external(&self) -> bool {
        match &self.external {
            None => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Null) => false,
            Some(_) => true,
        }
    }

    /// Only local (or default-driver) volumes can be archived.
    pub fn is_local(&self) -> bool {
        matches!(self.driver.as_deref(), None | Some("" | "local"))
    }
}

/// Port mapping in short or long syntax.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u16),
    Short(String),
    Long(LongPort),
}

/// Long-syntax port mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LongPort {
    pub target: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl PortEntry {
    /// Container-side port.
    pub fn target(&self) -> Option<u16> {
        match self {
            Self::Number(port) => Some(*port),
            Self::Short(spec) => {
                let spec = spec.split('/').next().unwrap_or(spec);
                spec.rsplit(':').next()?.parse().ok()
            }
            Self::Long(long) => Some(long.target),
        }
    }

    /// Protocol, defaulting to TCP.
    pub fn protocol(&self) -> &str {
        match self {
            Self::Number(_) => "tcp",
            Self::Short(spec) => spec.split_once('/').map_or("tcp", |(_, proto)| proto),
            Self::Long(long) => long.protocol.as_deref().unwrap_or("tcp"),
        }
    }

    /// Strips the host-side publication so the router stays the only
    /// entry point.
    pub fn neutralized(&self) -> PortEntry {
        match self {
            Self::Number(port) => Self::Number(*port),
            Self::Short(spec) => {
                let (ports, proto) = match spec.split_once('/') {
                    Some((ports, proto)) => (ports, Some(proto)),
                    None => (spec.as_str(), None),
                };
                let target = ports.rsplit(':').next().unwrap_or(ports);
                match proto {
                    Some(proto) => Self::Short(format!("{target}/{proto}")),
                    None => Self::Short(target.to_string()),
                }
            }
            Self::Long(long) => {
                let mut long = long.clone();
                long.published = None;
                Self::Long(long)
            }
        }
    }
}

/// Service volume in short or long syntax.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VolumeEntry {
    Short(String),
    Long(LongServiceVolume),
}

/// Long-syntax service volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LongServiceVolume {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl VolumeEntry {
    /// Rewrites relative bind sources to absolute paths under `root`.
    pub fn absolutized(&self, root: &Path) -> VolumeEntry {
        match self {
            Self::Short(spec) => {
                if let Some((source, rest)) = spec.split_once(':') {
                    if is_relative_bind(source) {
                        return Self::Short(format!("{}:{rest}", root.join(source).display()));
                    }
                }
                Self::Short(spec.clone())
            }
            Self::Long(long) => {
                let mut long = long.clone();
                if long.kind == "bind" {
                    if let Some(source) = &long.source {
                        if is_relative_bind(source) {
                            long.source = Some(root.join(source).display().to_string());
                        }
                    }
                }
                Self::Long(long)
            }
        }
    }
}

fn is_relative_bind(source: &str) -> bool {
    source.starts_with("./") || source.starts_with("../") || source == "." || source == ".."
}

fn is_false(flag: &bool) -> bool {
    !flag
}

/// Result of preparing a manifest for deployment.
pub struct PreparedManifest {
    pub file: ComposeFile,
    /// Docker volume names eligible for backup.
    pub backup_volumes: Vec<String>,
}

/// Applies the deployment rewrites to a parsed manifest.
///
/// Published ports are neutralised, relative bind sources are anchored
/// at the working tree, every backup-eligible volume gets an explicit
/// engine-level name (daemon-prefixed when it starts with `_`), and the
/// list of those names is returned as the backup set.
pub fn prepare(mut file: ComposeFile, project: &str, root: &Path) -> PreparedManifest {
    for service in file.services.values_mut() {
        service.ports = service.ports.iter().map(PortEntry::neutralized).collect();
        service.volumes = service
            .volumes
            .iter()
            .map(|volume| volume.absolutized(root))
            .collect();
    }

    let mut backup_volumes = Vec::new();
    for (key, volume) in file.volumes.iter_mut() {
        if volume.is_external() || !volume.is_local() {
            continue;
        }
        let mut name = volume
            .name
            .clone()
            .unwrap_or_else(|| format!("{project}_{key}"));
        if name.starts_with('_') {
            name = format!("{project}{name}");
        }
        volume.name = Some(name.clone());
        backup_volumes.push(name);
    }

    PreparedManifest {
        file,
        backup_volumes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ComposeFile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_port_short_forms() {
        let entry = PortEntry::Short("8080:80".to_string());
        assert_eq!(entry.target(), Some(80));
        assert_eq!(entry.protocol(), "tcp");
        assert_eq!(entry.neutralized(), PortEntry::Short("80".to_string()));

        let bound = PortEntry::Short("127.0.0.1:8080:80".to_string());
        assert_eq!(bound.target(), Some(80));
        assert_eq!(bound.neutralized(), PortEntry::Short("80".to_string()));

        let udp = PortEntry::Short("5353:53/udp".to_string());
        assert_eq!(udp.protocol(), "udp");
        assert_eq!(udp.neutralized(), PortEntry::Short("53/udp".to_string()));
    }

    #[test]
    fn test_port_number_form() {
        let entry = PortEntry::Number(80);
        assert_eq!(entry.target(), Some(80));
        assert_eq!(entry.neutralized(), PortEntry::Number(80));
    }

    #[test]
    fn test_parse_keeps_unknown_fields() {
        let file = parse(
            "services:\n  web:\n    image: nginx\n    ports: [\"80\"]\n    environment:\n      TEST: ${MY_TEST}\n",
        );
        let service = &file.services["web"];
        assert!(service.rest.contains_key("image"));
        assert!(service.rest.contains_key("environment"));

        let rendered = serde_yaml::to_string(&file).unwrap();
        assert!(rendered.contains("image: nginx"));
        assert!(rendered.contains("${MY_TEST}"));
    }

    #[test]
    fn test_extensions_parse() {
        let file = parse(
            "services:\n  web:\n    x-root: true\n    ports: [\"80\"]\n  api:\n    x-domain: backend\n    ports: [\"8080\"]\n",
        );
        assert!(file.services["web"].root);
        assert_eq!(file.services["api"].domain.as_deref(), Some("backend"));
    }

    #[test]
    fn test_prepare_neutralizes_published_ports() {
        let file = parse("services:\n  web:\n    ports:\n      - \"8080:80\"\n");
        let prepared = prepare(file, "my-app", Path::new("/work/my-app"));
        assert_eq!(
            prepared.file.services["web"].ports,
            vec![PortEntry::Short("80".to_string())]
        );
    }

    #[test]
    fn test_prepare_names_and_collects_volumes() {
        let file = parse(
            "volumes:\n  data: {}\n  _scratch:\n    name: _scratch\n  remote:\n    driver: nfs\n  shared:\n    external: true\n",
        );
        let prepared = prepare(file, "my-app", Path::new("/work"));
        let mut volumes = prepared.backup_volumes.clone();
        volumes.sort();
        assert_eq!(volumes, vec!["my-app_data", "my-app_scratch"]);
        assert_eq!(
            prepared.file.volumes["data"].name.as_deref(),
            Some("my-app_data")
        );
        // Non-local and external volumes keep their configuration.
        assert_eq!(prepared.file.volumes["remote"].name, None);
        assert_eq!(prepared.file.volumes["shared"].name, None);
    }

    #[test]
    fn test_prepare_absolutizes_binds() {
        let file = parse(
            "services:\n  web:\n    volumes:\n      - ./conf:/etc/conf:ro\n      - data:/var/lib/data\n      - type: bind\n        source: ./html\n        target: /usr/share/html\n",
        );
        let prepared = prepare(file, "my-app", Path::new("/work/my-app"));
        let volumes = &prepared.file.services["web"].volumes;
        assert_eq!(
            volumes[0],
            VolumeEntry::Short("/work/my-app/conf:/etc/conf:ro".to_string())
        );
        // Named volumes pass through untouched.
        assert_eq!(
            volumes[1],
            VolumeEntry::Short("data:/var/lib/data".to_string())
        );
        match &volumes[2] {
            VolumeEntry::Long(long) => {
                assert_eq!(long.source.as_deref(), Some("/work/my-app/html"));
            }
            other => panic!("expected long volume, got {other:?}"),
        }
    }
}
