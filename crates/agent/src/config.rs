use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use common::{OsFamily, DEFAULT_METADATA_ROOT};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub os: OsFamily,
    pub metadata: MetadataConfig,
    pub scripts: ScriptsConfig,
    pub network: NetworkConfig,
    pub accounts: AccountsConfig,
    pub oslogin: OsLoginConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Root of the metadata tree, without a trailing slash.
    pub base_url: String,
    /// Query suffix appended to attribute reads; may be empty.
    pub attributes_query: String,
    /// Server-side hang for the watch request. 0 disables `wait_for_change`.
    pub watch_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_METADATA_ROOT.to_string(),
            attributes_query: "?recursive=true&alt=json&timeout_sec=10".to_string(),
            watch_timeout_secs: 60,
            request_timeout_secs: 30,
            backoff_min_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl MetadataConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The long poll must outlive the server-side hang.
    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs + self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Interpreter for shell scripts that carry no `#!` line.
    pub default_shell: String,
    pub powershell: String,
    /// Parent of the per-script temporary directories; system temp when unset.
    pub run_dir: Option<PathBuf>,
    /// Object storage endpoint used for `gs://` style references.
    pub storage_endpoint: String,
    pub fetch_timeout_secs: u64,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            default_shell: "/bin/bash".to_string(),
            powershell: "powershell.exe".to_string(),
            run_dir: None,
            storage_endpoint: "https://storage.googleapis.com".to_string(),
            fetch_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub ip_aliases: bool,
    /// Routing protocol id stamped on every route the agent owns.
    pub proto_id: u32,
    pub ip_binary: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_aliases: true,
            proto_id: 66,
            ip_binary: "ip".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    pub enabled: bool,
    pub home_root: PathBuf,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            home_root: PathBuf::from("/home"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OsLoginConfig {
    pub enabled: bool,
    pub sshd_config: PathBuf,
    pub authorized_keys_command: String,
}

impl Default for OsLoginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sshd_config: PathBuf::from("/etc/ssh/sshd_config"),
            authorized_keys_command: "/usr/bin/google_authorized_keys".to_string(),
        }
    }
}

/// Load the agent configuration.
///
/// A missing file at the default location yields defaults; an explicitly
/// requested file must exist. Environment overrides are applied last.
pub fn load_config(explicit: Option<&Path>, data_dir: &Path) -> anyhow::Result<AgentConfig> {
    let mut cfg = match explicit {
        Some(path) => read_config_file(path)?,
        None => {
            let path = crate::state::config_path(data_dir);
            if path.exists() {
                read_config_file(&path)?
            } else {
                AgentConfig::default()
            }
        }
    };
    apply_overrides(&mut cfg, |k| std::env::var(k).ok())?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> anyhow::Result<AgentConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

fn env_flag(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

pub fn apply_overrides<F>(cfg: &mut AgentConfig, lookup: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("GCE_METADATA_HOST").filter(|h| !h.is_empty()) {
        cfg.metadata.base_url = format!("http://{host}/computeMetadata/v1");
    }
    if let Some(os) = lookup("GUEST_AGENT_OS") {
        cfg.os = os.parse().context("GUEST_AGENT_OS")?;
    }
    if lookup("GUEST_AGENT_DISABLE_NETWORK").as_deref().is_some_and(env_flag) {
        cfg.network.enabled = false;
    }
    if lookup("GUEST_AGENT_DISABLE_ACCOUNTS").as_deref().is_some_and(env_flag) {
        cfg.accounts.enabled = false;
    }
    Ok(())
}
