use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::OsFamily;

use crate::accounts::AccountsManager;
use crate::config::AgentConfig;
use crate::metadata::MetadataClient;
use crate::network::NetworkReconciler;
use crate::oslogin::OsLoginManager;
use crate::scripts::ScriptRunner;
use crate::watcher::{Handlers, Watcher};

use super::util::setup;

fn build_handlers(config: &AgentConfig, client: &MetadataClient) -> anyhow::Result<Handlers> {
    let scripts = ScriptRunner::from_config(client.clone(), &config.scripts, config.os)
        .context("create script runner")?;
    let linux = config.os == OsFamily::Linux;

    let network = if linux && config.network.enabled {
        match NetworkReconciler::from_config(&config.network) {
            Ok(r) => Some(Arc::new(r)),
            Err(e) => {
                warn!(error = %e, "route management disabled");
                None
            }
        }
    } else {
        None
    };
    let accounts = (linux && config.accounts.enabled)
        .then(|| AccountsManager::new(config.accounts.home_root.clone()));
    let oslogin = (linux && config.oslogin.enabled).then(|| OsLoginManager::new(&config.oslogin));

    Ok(Handlers {
        scripts: Some(scripts),
        network,
        accounts,
        oslogin,
    })
}

/// Run the watch loop until `shutdown` resolves.
pub async fn agent(config_path: Option<&Path>, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let setup = setup(config_path)?;
    let handlers = build_handlers(&setup.config, &setup.client)?;
    let watcher = Watcher::new(
        setup.client,
        &setup.config.metadata,
        handlers,
        setup.config.os,
        setup.data_dir,
    )?;

    let cancel = CancellationToken::new();
    let task = tokio::spawn(watcher.run(cancel.clone()));
    shutdown.await;
    info!("Shutdown signal received, stopping agent gracefully");
    cancel.cancel();
    task.await.context("watcher task")?;
    Ok(())
}
