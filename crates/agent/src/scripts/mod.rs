//! Lifecycle scripts: which metadata keys hold them, where their bodies live
//! and how they are run.

pub mod exec;
pub mod fetch;
pub mod keys;
pub mod uri;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use common::{AttributeMap, OsFamily, ScriptDescriptor, ScriptEvent};

use crate::config::ScriptsConfig;
use crate::error::Result;
use crate::metadata::{MetadataClient, Scope};

pub use exec::{ScriptExecutor, ScriptReport, ScriptStatus};
pub use fetch::ScriptFetcher;
pub use keys::{select_attributes, wanted_keys};

/// Ordered script collection for `wanted`, taking each key from instance
/// scope when present there and from project scope otherwise.
pub fn assemble(
    wanted: &[String],
    instance: &AttributeMap,
    project: &AttributeMap,
) -> Vec<ScriptDescriptor> {
    let instance = select_attributes(instance, wanted);
    let project = select_attributes(project, wanted);
    wanted
        .iter()
        .filter_map(|key| {
            let value = instance.get(key).or_else(|| project.get(key))?;
            ScriptDescriptor::from_key(key, value)
        })
        .collect()
}

/// Read both scopes from the metadata server and assemble the collection.
pub async fn get_scripts(client: &MetadataClient, wanted: &[String]) -> Result<Vec<ScriptDescriptor>> {
    let instance = client.get_attributes(Scope::Instance).await?;
    let project = client.get_attributes(Scope::Project).await?;
    Ok(assemble(wanted, &instance, &project))
}

/// Runs the script collection of one lifecycle event.
#[derive(Clone)]
pub struct ScriptRunner {
    client: MetadataClient,
    executor: Arc<ScriptExecutor>,
    os: OsFamily,
}

impl ScriptRunner {
    pub fn new(client: MetadataClient, executor: ScriptExecutor, os: OsFamily) -> Self {
        Self {
            client,
            executor: Arc::new(executor),
            os,
        }
    }

    /// Runner wired from configuration. Object-storage reads authenticate
    /// with the instance's service account through `client`.
    pub fn from_config(client: MetadataClient, config: &ScriptsConfig, os: OsFamily) -> Result<Self> {
        let fetcher = ScriptFetcher::new(
            &config.storage_endpoint,
            Duration::from_secs(config.fetch_timeout_secs),
            Some(client.clone()),
        )?;
        Ok(Self::new(client, ScriptExecutor::new(fetcher, config.clone(), os), os))
    }

    /// Fetch and run the scripts of `event`.
    pub async fn run_event(
        &self,
        event: ScriptEvent,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScriptReport>> {
        let wanted = wanted_keys(event, self.os)?;
        let scripts = get_scripts(&self.client, &wanted).await?;
        Ok(self.run_collection(event, &scripts, cancel).await)
    }

    /// Run an already assembled collection in order. One script failing does
    /// not stop the others; cancellation skips whatever has not started.
    pub async fn run_collection(
        &self,
        event: ScriptEvent,
        scripts: &[ScriptDescriptor],
        cancel: &CancellationToken,
    ) -> Vec<ScriptReport> {
        if scripts.is_empty() {
            info!(event = %event, "no scripts to run");
            return Vec::new();
        }
        let mut reports = Vec::with_capacity(scripts.len());
        for descriptor in scripts {
            if cancel.is_cancelled() {
                reports.push(ScriptReport {
                    metadata: descriptor.metadata.clone(),
                    status: ScriptStatus::Cancelled,
                    output: Vec::new(),
                });
                continue;
            }
            reports.push(self.executor.run(descriptor, cancel).await);
        }
        let failed = reports.iter().filter(|r| !r.is_success()).count();
        info!(event = %event, total = reports.len(), failed, "scripts finished");
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::MetadataConfig;
    use crate::metadata::test_config;
    use common::ScriptType;

    fn attrs(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn wanted(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    async fn serve(server: &MockServer, instance: &str, project: &str) {
        Mock::given(method("GET"))
            .and(path("/instance/attributes"))
            .respond_with(ResponseTemplate::new(200).set_body_string(instance.to_string()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/project/attributes"))
            .respond_with(ResponseTemplate::new(200).set_body_string(project.to_string()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn instance_value_wins_over_project() {
        let cases = [
            ("instance", r#"{"startup-script":"instance"}"#, "{}", "instance"),
            ("project", "{}", r#"{"startup-script":"project"}"#, "project"),
            (
                "both",
                r#"{"startup-script":"instance"}"#,
                r#"{"startup-script":"project"}"#,
                "instance",
            ),
        ];
        let server = MockServer::start().await;
        for (name, instance, project, _) in cases {
            Mock::given(method("GET"))
                .and(path("/instance/attributes"))
                .and(query_param("case", name))
                .respond_with(ResponseTemplate::new(200).set_body_string(instance.to_string()))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/project/attributes"))
                .and(query_param("case", name))
                .respond_with(ResponseTemplate::new(200).set_body_string(project.to_string()))
                .mount(&server)
                .await;
        }
        for (name, _, _, want) in cases {
            let config = MetadataConfig {
                attributes_query: format!("?case={name}"),
                ..test_config(&server.uri())
            };
            let client = MetadataClient::new(config).unwrap();
            let got = get_scripts(&client, &wanted(&["startup-script"])).await.unwrap();
            assert_eq!(
                got,
                vec![ScriptDescriptor {
                    script: want.to_string(),
                    metadata: "startup-script".to_string(),
                    script_type: ScriptType::Shell,
                }],
                "{name}"
            );
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 6);
    }

    #[test]
    fn precedence_is_per_key_and_order_follows_wanted_keys() {
        let wanted = wanted(&[
            "windows-startup-script-bat",
            "windows-startup-script-cmd",
            "windows-startup-script-ps1",
            "windows-startup-script-url",
        ]);
        let instance = attrs(&[
            ("windows-startup-script-ps1", "instance ps1"),
            ("unrelated", "x"),
        ]);
        let project = attrs(&[
            ("windows-startup-script-ps1", "project ps1"),
            ("windows-startup-script-bat", "project bat"),
        ]);
        let got = assemble(&wanted, &instance, &project);
        let got: Vec<(&str, &str)> = got
            .iter()
            .map(|d| (d.metadata.as_str(), d.script.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("windows-startup-script-bat", "project bat"),
                ("windows-startup-script-ps1", "instance ps1"),
            ]
        );
    }

    #[tokio::test]
    async fn attribute_errors_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client = MetadataClient::new(test_config(&server.uri())).unwrap();
        assert!(get_scripts(&client, &wanted(&["startup-script"])).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_event_runs_every_script_and_reports_each() {
        let server = MockServer::start().await;
        serve(
            &server,
            r##"{"startup-script":"#!/bin/sh\nexit 1\n"}"##,
            &format!(r#"{{"startup-script-url":"{}/boot"}}"#, server.uri()),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/boot"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/sh\necho from-url\n"))
            .mount(&server)
            .await;

        let client = MetadataClient::new(test_config(&server.uri())).unwrap();
        let run_dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptFetcher::new(&server.uri(), Duration::from_secs(5), None).unwrap();
        let config = ScriptsConfig {
            run_dir: Some(run_dir.path().to_path_buf()),
            ..ScriptsConfig::default()
        };
        let runner = ScriptRunner::new(
            client,
            ScriptExecutor::new(fetcher, config, OsFamily::Linux),
            OsFamily::Linux,
        );
        let reports = runner
            .run_event(ScriptEvent::Startup, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].metadata, "startup-script-url");
        assert!(reports[0].is_success());
        assert_eq!(reports[0].output, vec!["from-url".to_string()]);
        assert_eq!(reports[1].metadata, "startup-script");
        assert_eq!(reports[1].status, ScriptStatus::Exited(1));
    }

    #[tokio::test]
    async fn cancelled_runs_skip_remaining_scripts() {
        let server = MockServer::start().await;
        let client = MetadataClient::new(test_config(&server.uri())).unwrap();
        let fetcher = ScriptFetcher::new(&server.uri(), Duration::from_secs(5), None).unwrap();
        let runner = ScriptRunner::new(
            client,
            ScriptExecutor::new(fetcher, ScriptsConfig::default(), OsFamily::Linux),
            OsFamily::Linux,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scripts = vec![ScriptDescriptor::from_key("startup-script", "echo hi").unwrap()];
        let reports = runner.run_collection(ScriptEvent::Startup, &scripts, &cancel).await;
        assert_eq!(reports[0].status, ScriptStatus::Cancelled);
    }
}
