//! SSH keys published in metadata, written into users' `authorized_keys`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use common::AttributeMap;

use crate::error::{AgentError, Result};
use crate::managed_file::{filter_google_lines, render_tagged, write_if_changed};
use crate::oslogin::parse_bool;

/// Attribute keys that hold `user:key` lines, current name first.
pub const SSH_KEY_ATTRIBUTES: [&str; 2] = ["ssh-keys", "sshKeys"];
pub const BLOCK_PROJECT_KEYS: &str = "block-project-ssh-keys";

const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Keys to install, by user name.
pub type UserKeys = BTreeMap<String, Vec<String>>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleSshMeta {
    expire_on: Option<String>,
}

fn is_valid_user(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && name != "."
        && name != ".."
}

/// False for keys whose `google-ssh` metadata has passed its `expireOn`
/// time or cannot be read.
fn key_is_live(key: &str, now: DateTime<Utc>) -> bool {
    let Some((_, meta)) = key.split_once("google-ssh ") else {
        return true;
    };
    let meta: GoogleSshMeta = match serde_json::from_str(meta.trim()) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "unreadable google-ssh metadata, dropping key");
            return false;
        }
    };
    let Some(expire_on) = meta.expire_on else {
        return true;
    };
    match DateTime::parse_from_str(&expire_on, EXPIRY_FORMAT) {
        Ok(at) => at.with_timezone(&Utc) > now,
        Err(e) => {
            debug!(expire_on = %expire_on, error = %e, "bad expireOn, dropping key");
            false
        }
    }
}

/// Parse `user:key` lines into `keys`, skipping malformed and expired ones.
pub fn parse_ssh_keys(text: &str, now: DateTime<Utc>, keys: &mut UserKeys) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((user, key)) = line.split_once(':') else {
            debug!(line = %line, "ssh key without user");
            continue;
        };
        let (user, key) = (user.trim(), key.trim());
        if !is_valid_user(user) || key.is_empty() {
            warn!(user = %user, "skipping invalid ssh key entry");
            continue;
        }
        if !key_is_live(key, now) {
            continue;
        }
        let entry = keys.entry(user.to_string()).or_default();
        if !entry.iter().any(|k| k == key) {
            entry.push(key.to_string());
        }
    }
}

/// Keys from instance attributes, plus project attributes unless the
/// instance blocks them.
pub fn collect_keys(instance: &AttributeMap, project: &AttributeMap, now: DateTime<Utc>) -> UserKeys {
    let mut keys = UserKeys::new();
    for attr in SSH_KEY_ATTRIBUTES {
        if let Some(text) = instance.get(attr) {
            parse_ssh_keys(text, now, &mut keys);
        }
    }
    let blocked = instance
        .get(BLOCK_PROJECT_KEYS)
        .and_then(|v| parse_bool(v))
        .unwrap_or(false);
    if !blocked {
        for attr in SSH_KEY_ATTRIBUTES {
            if let Some(text) = project.get(attr) {
                parse_ssh_keys(text, now, &mut keys);
            }
        }
    }
    keys
}

/// Maintains the agent-managed lines of each user's `authorized_keys`.
pub struct AccountsManager {
    home_root: PathBuf,
    // Users whose files currently carry agent lines; None until the first
    // pass has scanned the home directories.
    managed: Mutex<Option<BTreeSet<String>>>,
}

impl AccountsManager {
    pub fn new(home_root: impl Into<PathBuf>) -> Self {
        Self {
            home_root: home_root.into(),
            managed: Mutex::new(None),
        }
    }

    fn authorized_keys(&self, user: &str) -> Option<PathBuf> {
        let home = self.home_root.join(user);
        home.is_dir().then(|| home.join(".ssh").join("authorized_keys"))
    }

    /// Users whose `authorized_keys` already holds agent-managed lines, as
    /// left behind by an earlier run.
    fn scan_managed(&self) -> Result<BTreeSet<String>> {
        let mut users = BTreeSet::new();
        let entries = match std::fs::read_dir(&self.home_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(users),
            Err(e) => return Err(AgentError::io(format!("read {}", self.home_root.display()), e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| AgentError::io(format!("read {}", self.home_root.display()), e))?;
            let user = entry.file_name().to_string_lossy().into_owned();
            let Some(path) = self.authorized_keys(&user) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    if filter_google_lines(&text).len() != text.lines().count() {
                        users.insert(user);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(path = %path.display(), error = %e, "cannot read authorized keys"),
            }
        }
        debug!(users = users.len(), "found agent-managed authorized keys");
        Ok(users)
    }

    fn update_user(&self, path: &Path, keys: &[String]) -> Result<bool> {
        let existing = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if keys.is_empty() {
                    return Ok(false);
                }
                String::new()
            }
            Err(e) => return Err(AgentError::io(format!("read {}", path.display()), e)),
        };
        if let Some(dir) = path.parent() {
            create_ssh_dir(dir)?;
        }
        let user_lines = filter_google_lines(&existing);
        write_if_changed(path, &render_tagged(&user_lines, keys))
    }

    /// Write `keys` for every user with a home directory, and strip agent
    /// lines from users that carry them but have no keys now. The first call
    /// finds those users on disk, later calls remember them.
    /// Every user is attempted; the first error is returned.
    pub fn apply(&self, keys: &UserKeys) -> Result<usize> {
        let mut guard = self
            .managed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(self.scan_managed()?);
        }
        let Some(managed) = guard.as_mut() else {
            return Ok(0);
        };
        let users: BTreeSet<String> = managed.iter().chain(keys.keys()).cloned().collect();
        let mut changed = 0;
        let mut first_err = None;
        for user in users {
            let Some(path) = self.authorized_keys(&user) else {
                debug!(user = %user, "no home directory, skipping");
                managed.remove(&user);
                continue;
            };
            let wanted = keys.get(&user).map(Vec::as_slice).unwrap_or(&[]);
            match self.update_user(&path, wanted) {
                Ok(true) => {
                    info!(user = %user, keys = wanted.len(), "updated authorized keys");
                    changed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(user = %user, error = %e, "authorized keys update failed");
                    first_err.get_or_insert(e);
                    continue;
                }
            }
            if wanted.is_empty() {
                managed.remove(&user);
            } else {
                managed.insert(user);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }
}

fn create_ssh_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| AgentError::io(format!("create {}", dir.display()), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| AgentError::io(format!("chmod {}", dir.display()), e))?;
    }
    Ok(())
}
