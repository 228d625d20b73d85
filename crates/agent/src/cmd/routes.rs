use std::path::Path;

use anyhow::Context;

use common::OsFamily;

use crate::metadata::MetadataClient;
use crate::network::NetworkReconciler;

use super::util::setup;

/// One reconciliation pass against the current metadata.
pub async fn routes(config_path: Option<&Path>) -> anyhow::Result<()> {
    let setup = setup(config_path)?;
    if setup.config.os != OsFamily::Linux {
        anyhow::bail!("route management is only available on linux");
    }
    // a single read, no long poll
    let mut metadata = setup.config.metadata.clone();
    metadata.watch_timeout_secs = 0;
    let client = MetadataClient::new(metadata).context("create metadata client")?;
    let watched = client.watch(None).await.context("read metadata")?;

    let reconciler = NetworkReconciler::from_config(&setup.config.network)?;
    let plan = reconciler
        .reconcile(&watched.descriptor.instance.network_interfaces)
        .await
        .context("reconcile routes")?;
    if plan.is_empty() {
        println!("routes up to date");
    }
    for route in &plan.add {
        println!("added {route}");
    }
    for route in &plan.remove {
        println!("removed {route}");
    }
    Ok(())
}
