use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Resolve the agent data directory in a platform-appropriate location.
pub fn agent_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or(std::env::temp_dir()).join("guest-agent")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("agent.toml")
}

fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
}

/// Facts the agent remembers across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AgentState {
    /// Instance id seen when the agent last ran; a different id means this
    /// disk booted on a new instance.
    #[serde(default)]
    pub instance_id: Option<String>,
}

pub fn load_state(data_dir: &Path) -> AgentState {
    if let Ok(bytes) = fs::read(state_path(data_dir)) {
        if let Ok(s) = serde_json::from_slice::<AgentState>(&bytes) {
            return s;
        }
    }
    AgentState::default()
}

pub fn save_state(data_dir: &Path, state: &AgentState) -> std::io::Result<()> {
    fs::create_dir_all(data_dir)?;
    let bytes = serde_json::to_vec_pretty(state).map_err(std::io::Error::other)?;
    fs::write(state_path(data_dir), bytes)
}

/// Returns true when `instance_id` differs from the recorded one.
pub fn is_first_boot(data_dir: &Path, instance_id: &str) -> bool {
    load_state(data_dir).instance_id.as_deref() != Some(instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_boot_until_instance_recorded() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_first_boot(dir.path(), "123"));
        save_state(
            dir.path(),
            &AgentState {
                instance_id: Some("123".into()),
            },
        )
        .unwrap();
        assert!(!is_first_boot(dir.path(), "123"));
        assert!(is_first_boot(dir.path(), "456"));
    }

    #[test]
    fn corrupt_state_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("state.json"), b"{not json").unwrap();
        assert_eq!(load_state(dir.path()), AgentState::default());
    }
}
