use std::path::PathBuf;

use tracing::info;

use common::AttributeMap;

use crate::config::OsLoginConfig;
use crate::error::{AgentError, Result};
use crate::managed_file::{filter_google_lines, render_block, write_if_changed};

pub const ENABLE_OSLOGIN: &str = "enable-oslogin";

/// Boolean metadata values: `1 t T TRUE true True` and `0 f F FALSE false False`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Instance setting if it parses, project setting otherwise, off by default.
pub fn oslogin_enabled(instance: &AttributeMap, project: &AttributeMap) -> bool {
    instance
        .get(ENABLE_OSLOGIN)
        .and_then(|v| parse_bool(v))
        .or_else(|| project.get(ENABLE_OSLOGIN).and_then(|v| parse_bool(v)))
        .unwrap_or(false)
}

/// Keeps the managed block at the top of `sshd_config` in sync with the
/// OS Login setting.
pub struct OsLoginManager {
    sshd_config: PathBuf,
    authorized_keys_command: String,
}

impl OsLoginManager {
    pub fn new(config: &OsLoginConfig) -> Self {
        Self {
            sshd_config: config.sshd_config.clone(),
            authorized_keys_command: config.authorized_keys_command.clone(),
        }
    }

    fn block(&self) -> Vec<String> {
        vec![
            format!("AuthorizedKeysCommand {}", self.authorized_keys_command),
            "AuthorizedKeysCommandUser root".to_string(),
        ]
    }

    /// Insert or remove the block. Returns whether the file changed.
    pub fn apply(&self, enabled: bool) -> Result<bool> {
        let path = &self.sshd_config;
        let existing = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !enabled => return Ok(false),
            Err(e) => return Err(AgentError::io(format!("read {}", path.display()), e)),
        };
        let block = if enabled { self.block() } else { Vec::new() };
        let changed = write_if_changed(path, &render_block(&block, &filter_google_lines(&existing)))?;
        if changed {
            info!(path = %path.display(), enabled, "sshd_config updated");
        }
        Ok(changed)
    }
}
