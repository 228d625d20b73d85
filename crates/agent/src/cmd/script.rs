use std::future::Future;
use std::path::Path;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::ScriptEvent;

use crate::scripts::ScriptRunner;

use super::util::setup;

/// Run the scripts of one lifecycle event. Failing scripts are logged but do
/// not make the command fail; unreadable metadata does.
pub async fn script(
    config_path: Option<&Path>,
    event: ScriptEvent,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let setup = setup(config_path)?;
    let runner = ScriptRunner::from_config(setup.client, &setup.config.scripts, setup.config.os)
        .context("create script runner")?;

    let cancel = CancellationToken::new();
    let run = runner.run_event(event, &cancel);
    tokio::pin!(run);
    let finished = tokio::select! {
        res = &mut run => Some(res),
        _ = shutdown => None,
    };
    let result = match finished {
        Some(res) => res,
        None => {
            warn!(event = %event, "interrupted, stopping scripts");
            cancel.cancel();
            run.await
        }
    };
    let reports = result.with_context(|| format!("run {event} scripts"))?;

    for report in &reports {
        info!(script = %report.metadata, status = ?report.status, "script result");
    }
    Ok(())
}
