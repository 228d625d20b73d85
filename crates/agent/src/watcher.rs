//! The metadata watch loop.
//!
//! Each successful long poll yields a fresh metadata tree. The tree is cut
//! into per-domain views, and only domains whose view differs from the last
//! one handled are dispatched. A domain whose handler fails keeps its old
//! view and is therefore dispatched again after the next poll.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::{thread_rng, Rng};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{AttributeMap, MetadataDescriptor, NetworkInterface, OsFamily, ScriptDescriptor, ScriptEvent};

use crate::accounts::{collect_keys, AccountsManager, BLOCK_PROJECT_KEYS, SSH_KEY_ATTRIBUTES};
use crate::config::MetadataConfig;
use crate::error::{AgentError, Result};
use crate::metadata::{MetadataClient, Watched};
use crate::network::NetworkReconciler;
use crate::oslogin::{oslogin_enabled, OsLoginManager, ENABLE_OSLOGIN};
use crate::scripts::{assemble, wanted_keys, ScriptReport, ScriptRunner};
use crate::state::{is_first_boot, save_state, AgentState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Network,
    Accounts,
    Scripts,
}

/// Attributes the accounts handler reads, at both scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountsView {
    pub instance: AttributeMap,
    pub project: AttributeMap,
}

/// The parts of the metadata tree each domain reacts to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Views {
    pub network: Vec<NetworkInterface>,
    pub accounts: AccountsView,
    /// Startup scripts after precedence, so an overridden project value
    /// changing does not count.
    pub scripts: Vec<ScriptDescriptor>,
}

fn pick(attributes: &AttributeMap, keys: &[&str]) -> AttributeMap {
    keys.iter()
        .filter_map(|k| attributes.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

impl Views {
    pub fn from_descriptor(descriptor: &MetadataDescriptor, startup_keys: &[String]) -> Self {
        let instance = &descriptor.instance.attributes;
        let project = &descriptor.project.attributes;
        let account_keys = [
            SSH_KEY_ATTRIBUTES[0],
            SSH_KEY_ATTRIBUTES[1],
            BLOCK_PROJECT_KEYS,
            ENABLE_OSLOGIN,
        ];
        Self {
            network: descriptor.instance.network_interfaces.clone(),
            accounts: AccountsView {
                instance: pick(instance, &account_keys),
                // blocking project keys is an instance-only setting
                project: pick(project, &[SSH_KEY_ATTRIBUTES[0], SSH_KEY_ATTRIBUTES[1], ENABLE_OSLOGIN]),
            },
            scripts: assemble(startup_keys, instance, project),
        }
    }
}

/// Views as of the last successful dispatch of each domain; `None` until
/// the domain has been handled once.
#[derive(Debug, Clone, Default)]
pub struct LastViews {
    pub network: Option<Vec<NetworkInterface>>,
    pub accounts: Option<AccountsView>,
    pub scripts: Option<Vec<ScriptDescriptor>>,
}

impl LastViews {
    pub fn changed(&self, next: &Views) -> Vec<Domain> {
        let mut domains = Vec::new();
        if self.network.as_ref() != Some(&next.network) {
            domains.push(Domain::Network);
        }
        if self.accounts.as_ref() != Some(&next.accounts) {
            domains.push(Domain::Accounts);
        }
        if self.scripts.as_ref() != Some(&next.scripts) {
            domains.push(Domain::Scripts);
        }
        domains
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// A script batch was handed to a background task.
    Started,
    /// First sighting; remembered without acting on it.
    Recorded,
    /// No handler for this domain on this host.
    Disabled,
    Failed(String),
}

/// What a dispatch did, per changed domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub results: Vec<(Domain, Outcome)>,
}

impl DispatchReport {
    #[cfg(test)]
    pub fn outcome(&self, domain: Domain) -> Option<&Outcome> {
        self.results.iter().find(|(d, _)| *d == domain).map(|(_, o)| o)
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Failed(_)))
            .count()
    }
}

/// Exponential delay with jitter: each delay is drawn from the upper half
/// of the current step.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    pub fn from_config(config: &MetadataConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_min_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = self
            .min
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let half = step / 2;
        let jitter_ms = thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }

    /// Delay before polling again after `err`. Errors that retrying cannot
    /// fix wait the full maximum.
    pub fn delay_for(&mut self, err: &AgentError) -> Duration {
        if err.is_retryable() {
            self.next_delay()
        } else {
            self.max
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Handlers available on this host. A missing handler disables its domain.
#[derive(Default)]
pub struct Handlers {
    pub scripts: Option<ScriptRunner>,
    pub network: Option<Arc<NetworkReconciler>>,
    pub accounts: Option<AccountsManager>,
    pub oslogin: Option<OsLoginManager>,
}

type BatchResult = (ScriptEvent, Vec<ScriptReport>);
type PendingPoll = Pin<Box<dyn Future<Output = Result<Watched>> + Send>>;

pub struct Watcher {
    client: MetadataClient,
    handlers: Handlers,
    os: OsFamily,
    data_dir: PathBuf,
    startup_keys: Vec<String>,
    last: LastViews,
    etag: Option<String>,
    first_boot_checked: bool,
    batch_locks: HashMap<ScriptEvent, Arc<Mutex<()>>>,
    backoff: Backoff,
    hanging: bool,
}

impl Watcher {
    pub fn new(
        client: MetadataClient,
        config: &MetadataConfig,
        handlers: Handlers,
        os: OsFamily,
        data_dir: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            client,
            handlers,
            os,
            data_dir,
            startup_keys: wanted_keys(ScriptEvent::Startup, os)?,
            last: LastViews::default(),
            etag: None,
            first_boot_checked: false,
            batch_locks: HashMap::new(),
            backoff: Backoff::from_config(config),
            hanging: config.watch_timeout_secs > 0,
        })
    }

    fn poll(&self) -> PendingPoll {
        let client = self.client.clone();
        let etag = self.etag.clone();
        Box::pin(async move { client.watch(etag.as_deref()).await })
    }

    /// Poll until `cancel` fires, then wait for running script batches.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut batches: JoinSet<BatchResult> = JoinSet::new();
        // survives batch completions so a finished batch does not restart the hang
        let mut in_flight: Option<PendingPoll> = None;
        info!(os = %self.os, "watching metadata");
        loop {
            let poll = in_flight.get_or_insert_with(|| self.poll());
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(done) = batches.join_next(), if !batches.is_empty() => {
                    log_batch(done);
                    continue;
                }
                res = poll => res,
            };
            in_flight = None;
            match polled {
                Ok(watched) => {
                    self.backoff.reset();
                    if let Some(tag) = watched.etag {
                        self.etag = Some(tag);
                    }
                    let report = self.observe(&watched.descriptor, &mut batches, &cancel).await;
                    if !report.results.is_empty() {
                        info!(domains = report.results.len(), failed = report.failed(), "dispatched metadata changes");
                    }
                    if !self.hanging {
                        // without a server-side hang, space the polls out
                        let pause = self.backoff.min;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
                Err(e) => {
                    let delay = self.backoff.delay_for(&e);
                    warn!(
                        error = %e,
                        retryable = e.is_retryable(),
                        retry_in_ms = delay.as_millis() as u64,
                        "metadata poll failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        if !batches.is_empty() {
            info!(running = batches.len(), "waiting for script batches to stop");
        }
        while let Some(done) = batches.join_next().await {
            log_batch(done);
        }
        info!("watcher stopped");
    }

    /// Handle one metadata tree: the first-boot check, then dispatch.
    pub async fn observe(
        &mut self,
        descriptor: &MetadataDescriptor,
        batches: &mut JoinSet<BatchResult>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        if !self.first_boot_checked {
            self.first_boot(descriptor, cancel).await;
        }
        self.dispatch(descriptor, batches, cancel).await
    }

    async fn first_boot(&mut self, descriptor: &MetadataDescriptor, cancel: &CancellationToken) {
        let Some(id) = descriptor.instance.id.as_deref() else {
            debug!("metadata has no instance id yet");
            return;
        };
        self.first_boot_checked = true;
        if !is_first_boot(&self.data_dir, id) {
            return;
        }
        info!(instance_id = %id, "first boot on this instance");
        if let (OsFamily::Windows, Some(runner)) = (self.os, &self.handlers.scripts) {
            match wanted_keys(ScriptEvent::Specialize, self.os) {
                Ok(keys) => {
                    let scripts = assemble(
                        &keys,
                        &descriptor.instance.attributes,
                        &descriptor.project.attributes,
                    );
                    runner.run_collection(ScriptEvent::Specialize, &scripts, cancel).await;
                }
                Err(e) => warn!(error = %e, "cannot resolve specialize scripts"),
            }
        }
        let state = AgentState {
            instance_id: Some(id.to_string()),
        };
        if let Err(e) = save_state(&self.data_dir, &state) {
            warn!(error = %e, "failed to record instance id");
        }
    }

    /// Run the handler of every domain whose view changed.
    pub async fn dispatch(
        &mut self,
        descriptor: &MetadataDescriptor,
        batches: &mut JoinSet<BatchResult>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let views = Views::from_descriptor(descriptor, &self.startup_keys);
        let mut report = DispatchReport::default();
        for domain in self.last.changed(&views) {
            let outcome = match domain {
                Domain::Network => self.handle_network(&views.network).await,
                Domain::Accounts => self.handle_accounts(&views.accounts),
                Domain::Scripts => self.handle_scripts(&views.scripts, batches, cancel),
            };
            match &outcome {
                Outcome::Failed(message) => {
                    warn!(domain = ?domain, error = %message, "handler failed, will retry after next poll")
                }
                outcome => {
                    debug!(domain = ?domain, outcome = ?outcome, "handled");
                    match domain {
                        Domain::Network => self.last.network = Some(views.network.clone()),
                        Domain::Accounts => self.last.accounts = Some(views.accounts.clone()),
                        Domain::Scripts => self.last.scripts = Some(views.scripts.clone()),
                    }
                }
            }
            report.results.push((domain, outcome));
        }
        report
    }

    async fn handle_network(&self, interfaces: &[NetworkInterface]) -> Outcome {
        let Some(reconciler) = &self.handlers.network else {
            return Outcome::Disabled;
        };
        match reconciler.reconcile(interfaces).await {
            Ok(plan) => {
                if !plan.is_empty() {
                    info!(added = plan.add.len(), removed = plan.remove.len(), "routes reconciled");
                }
                Outcome::Applied
            }
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    fn handle_accounts(&self, view: &AccountsView) -> Outcome {
        if self.handlers.accounts.is_none() && self.handlers.oslogin.is_none() {
            return Outcome::Disabled;
        }
        let oslogin = oslogin_enabled(&view.instance, &view.project);
        if let Some(manager) = &self.handlers.oslogin {
            if let Err(e) = manager.apply(oslogin) {
                return Outcome::Failed(e.to_string());
            }
        }
        if oslogin {
            debug!("OS Login enabled, authorized keys left alone");
            return Outcome::Applied;
        }
        if let Some(accounts) = &self.handlers.accounts {
            let keys = collect_keys(&view.instance, &view.project, Utc::now());
            if let Err(e) = accounts.apply(&keys) {
                return Outcome::Failed(e.to_string());
            }
        }
        Outcome::Applied
    }

    fn handle_scripts(
        &mut self,
        scripts: &[ScriptDescriptor],
        batches: &mut JoinSet<BatchResult>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(runner) = self.handlers.scripts.clone() else {
            return Outcome::Disabled;
        };
        // The boot-time run belongs to the service manager.
        if self.last.scripts.is_none() {
            return Outcome::Recorded;
        }
        let event = ScriptEvent::Startup;
        let lock = self.batch_locks.entry(event).or_default().clone();
        let scripts = scripts.to_vec();
        let cancel = cancel.clone();
        info!(event = %event, scripts = scripts.len(), "startup scripts changed, running");
        batches.spawn(async move {
            // one batch per event at a time
            let _guard = lock.lock_owned().await;
            let reports = runner.run_collection(event, &scripts, &cancel).await;
            (event, reports)
        });
        Outcome::Started
    }
}

fn log_batch(done: std::result::Result<BatchResult, JoinError>) {
    match done {
        Ok((event, reports)) => {
            let failed = reports.iter().filter(|r| !r.is_success()).count();
            info!(event = %event, total = reports.len(), failed, "script batch finished");
        }
        Err(e) => warn!(error = %e, "script batch task failed"),
    }
}
