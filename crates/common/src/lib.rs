use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const METADATA_FLAVOR: &str = "Metadata-Flavor";
pub const METADATA_FLAVOR_VALUE: &str = "Google";
pub const DEFAULT_METADATA_ROOT: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Marks the next line of an authorized-keys file as agent-managed.
pub const GOOGLE_COMMENT: &str = "# Added by Google";
pub const GOOGLE_BLOCK_START: &str = "#### Google OS Login control. Do not edit this section. ####";
pub const GOOGLE_BLOCK_END: &str = "#### End Google OS Login control section. ####";

/// Flat `key -> value` view of the attributes published at one scope.
pub type AttributeMap = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown script event {0:?}, expected specialize, startup or shutdown")]
    UnknownEvent(String),
    #[error("unknown os family {0:?}, expected windows or linux")]
    UnknownOs(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
}

impl OsFamily {
    /// Family of the host the agent was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Windows => "windows",
            OsFamily::Linux => "linux",
        }
    }
}

impl Default for OsFamily {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsFamily {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "windows" => Ok(OsFamily::Windows),
            "linux" => Ok(OsFamily::Linux),
            other => Err(ParseError::UnknownOs(other.to_string())),
        }
    }
}

/// Lifecycle event a script collection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptEvent {
    Specialize,
    Startup,
    Shutdown,
}

impl ScriptEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptEvent::Specialize => "specialize",
            ScriptEvent::Startup => "startup",
            ScriptEvent::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ScriptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptEvent {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specialize" => Ok(ScriptEvent::Specialize),
            "startup" => Ok(ScriptEvent::Startup),
            "shutdown" => Ok(ScriptEvent::Shutdown),
            other => Err(ParseError::UnknownEvent(other.to_string())),
        }
    }
}

/// Format of a script, derived from the metadata key it came from and, for
/// URL keys, refined from the extension of the fetched reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    Batch,
    Cmd,
    PowerShell,
    UrlBat,
    UrlCmd,
    UrlPs1,
    UrlGeneric,
    Shell,
    UrlShell,
}

impl ScriptType {
    /// Derive the type from a metadata key such as `windows-startup-script-ps1`
    /// or `startup-script-url`. Keys without a recognised suffix yield `None`.
    pub fn from_key(key: &str) -> Option<Self> {
        if key.ends_with("-script-bat") {
            Some(ScriptType::Batch)
        } else if key.ends_with("-script-cmd") {
            Some(ScriptType::Cmd)
        } else if key.ends_with("-script-ps1") {
            Some(ScriptType::PowerShell)
        } else if key == "startup-script-url" || key == "shutdown-script-url" {
            Some(ScriptType::UrlShell)
        } else if key.ends_with("-script-url") {
            Some(ScriptType::UrlGeneric)
        } else if key.ends_with("-script") {
            Some(ScriptType::Shell)
        } else {
            None
        }
    }

    /// Refine a generic URL type from a file extension (with or without the dot).
    pub fn from_url_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "ps1" => Some(ScriptType::UrlPs1),
            "cmd" => Some(ScriptType::UrlCmd),
            "bat" => Some(ScriptType::UrlBat),
            _ => None,
        }
    }

    pub fn is_url(&self) -> bool {
        matches!(
            self,
            ScriptType::UrlBat
                | ScriptType::UrlCmd
                | ScriptType::UrlPs1
                | ScriptType::UrlGeneric
                | ScriptType::UrlShell
        )
    }

    pub fn is_powershell(&self) -> bool {
        matches!(self, ScriptType::PowerShell | ScriptType::UrlPs1)
    }

    pub fn is_shell(&self) -> bool {
        matches!(self, ScriptType::Shell | ScriptType::UrlShell)
    }

    /// File extension used for the on-disk copy of the script.
    pub fn extension(&self) -> &'static str {
        match self {
            ScriptType::Batch | ScriptType::UrlBat => ".bat",
            ScriptType::Cmd | ScriptType::UrlCmd => ".cmd",
            ScriptType::PowerShell | ScriptType::UrlPs1 => ".ps1",
            ScriptType::UrlGeneric | ScriptType::Shell | ScriptType::UrlShell => "",
        }
    }
}

/// One script to run, as found in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    /// Inline script content, or a reference to fetch for URL types.
    pub script: String,
    /// Metadata key the script came from.
    pub metadata: String,
    pub script_type: ScriptType,
}

impl ScriptDescriptor {
    pub fn from_key(metadata: &str, script: &str) -> Option<Self> {
        let script_type = ScriptType::from_key(metadata)?;
        Some(Self {
            script: script.to_string(),
            metadata: metadata.to_string(),
            script_type,
        })
    }
}

/// Recursive view of the metadata tree, limited to the fields the agent reacts to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataDescriptor {
    pub instance: InstanceMetadata,
    pub project: ProjectMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceMetadata {
    #[serde(deserialize_with = "string_or_number")]
    pub id: Option<String>,
    pub attributes: AttributeMap,
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub project_id: Option<String>,
    pub attributes: AttributeMap,
}

/// Per-NIC addressing published by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInterface {
    pub mac: String,
    pub forwarded_ips: Vec<String>,
    pub forwarded_ipv6s: Vec<String>,
    pub target_instance_ips: Vec<String>,
    pub ip_aliases: Vec<String>,
}

// The metadata server publishes the instance id as a JSON number.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_type_follows_key_suffix() {
        let cases = [
            ("sysprep-specialize-script-bat", ScriptType::Batch),
            ("windows-startup-script-cmd", ScriptType::Cmd),
            ("windows-shutdown-script-ps1", ScriptType::PowerShell),
            ("windows-startup-script-url", ScriptType::UrlGeneric),
            ("startup-script-url", ScriptType::UrlShell),
            ("shutdown-script", ScriptType::Shell),
        ];
        for (key, want) in cases {
            assert_eq!(ScriptType::from_key(key), Some(want), "{key}");
        }
        assert_eq!(ScriptType::from_key("enable-oslogin"), None);
    }

    #[test]
    fn url_extension_refinement() {
        assert_eq!(ScriptType::from_url_extension(".PS1"), Some(ScriptType::UrlPs1));
        assert_eq!(ScriptType::from_url_extension("bat"), Some(ScriptType::UrlBat));
        assert_eq!(ScriptType::from_url_extension(".bad"), None);
    }

    #[test]
    fn descriptor_parses_numeric_instance_id() {
        let raw = r#"{
            "instance": {
                "id": 4242,
                "attributes": {"startup-script": "echo hi"},
                "networkInterfaces": [{"mac": "42:01:0a:00:00:02", "forwardedIps": ["10.1.2.3"]}]
            },
            "project": {"projectId": "demo", "attributes": {"ssh-keys": "a:ssh-rsa AAA a"}}
        }"#;
        let md: MetadataDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(md.instance.id.as_deref(), Some("4242"));
        assert_eq!(md.instance.network_interfaces[0].forwarded_ips, vec!["10.1.2.3"]);
        assert!(md.instance.network_interfaces[0].ip_aliases.is_empty());
        assert_eq!(md.project.project_id.as_deref(), Some("demo"));
    }

    #[test]
    fn event_and_os_parsing_reject_unknown_values() {
        assert_eq!("startup".parse::<ScriptEvent>(), Ok(ScriptEvent::Startup));
        assert!("reboot".parse::<ScriptEvent>().is_err());
        assert!("plan9".parse::<OsFamily>().is_err());
    }
}
