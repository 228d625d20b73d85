use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::config::{load_config, AgentConfig};
use crate::metadata::MetadataClient;
use crate::state::agent_data_dir;

/// Configuration, data directory and metadata client shared by commands.
pub struct Setup {
    pub config: AgentConfig,
    pub data_dir: PathBuf,
    pub client: MetadataClient,
}

pub fn setup(config_path: Option<&Path>) -> anyhow::Result<Setup> {
    let data_dir = agent_data_dir();
    let config = load_config(config_path, &data_dir)?;
    debug!(os = %config.os, metadata = %config.metadata.base_url, "configuration loaded");
    let client = MetadataClient::new(config.metadata.clone()).context("create metadata client")?;
    Ok(Setup {
        config,
        data_dir,
        client,
    })
}
