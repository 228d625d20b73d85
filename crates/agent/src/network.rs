//! Local host routes for forwarded IPs and IP aliases.
//!
//! The control plane publishes, per NIC, addresses the instance must accept
//! traffic for. Each one becomes a `local` route in the `local` table, tagged
//! with the agent's protocol id so agent-owned routes can be told apart from
//! anything else on the host.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::NetworkInterface;

use crate::config::NetworkConfig;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn from_cidr(cidr: &str) -> Self {
        if cidr.contains(':') {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            IpFamily::V4 => "-4",
            IpFamily::V6 => "-6",
        }
    }

    fn host_prefix(&self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }
}

/// Canonical `addr/prefix` form. Bare addresses get a host prefix.
pub fn normalize_cidr(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (addr, prefix) = match raw.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (raw, None),
    };
    let addr: IpAddr = addr.parse().ok()?;
    let family = if addr.is_ipv6() { IpFamily::V6 } else { IpFamily::V4 };
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().ok().filter(|p| *p <= family.host_prefix())?,
        None => family.host_prefix(),
    };
    Some(format!("{addr}/{prefix}"))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalRoute {
    pub interface: String,
    pub cidr: String,
}

impl LocalRoute {
    pub fn new(interface: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            cidr: cidr.into(),
        }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::from_cidr(&self.cidr)
    }
}

impl std::fmt::Display for LocalRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} dev {}", self.cidr, self.interface)
    }
}

/// Agent-owned routes in the host's `local` table.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Routes carrying the agent protocol id on `interface`, normalized.
    async fn list(&self, interface: &str, family: IpFamily) -> Result<Vec<String>>;
    /// Adding a route that is already present succeeds.
    async fn add(&self, route: &LocalRoute) -> Result<()>;
    /// Deleting a route that is absent succeeds.
    async fn delete(&self, route: &LocalRoute) -> Result<()>;
}

/// Maps NIC MAC addresses to interface names.
#[async_trait]
pub trait InterfaceLocator: Send + Sync {
    /// MAC (lowercase) to name, loopback excluded.
    async fn interfaces(&self) -> Result<BTreeMap<String, String>>;
}

/// [`RouteTable`] backed by the `ip` command.
pub struct IpRouteTable {
    binary: PathBuf,
    proto_id: u32,
}

fn route_args(op: &str, route: &LocalRoute, proto_id: u32) -> Vec<String> {
    let proto = proto_id.to_string();
    [
        route.family().flag(),
        "route",
        op,
        "to",
        "local",
        route.cidr.as_str(),
        "scope",
        "host",
        "dev",
        route.interface.as_str(),
        "proto",
        proto.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn list_args(interface: &str, family: IpFamily, proto_id: u32) -> Vec<String> {
    let proto = proto_id.to_string();
    [
        family.flag(),
        "route",
        "list",
        "table",
        "local",
        "type",
        "local",
        "scope",
        "host",
        "dev",
        interface,
        "proto",
        proto.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Destinations from `ip route list` output. Lines may or may not repeat
/// the route type in front of the destination.
fn parse_route_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let first = tokens.next()?;
            let dest = if first == "local" { tokens.next()? } else { first };
            normalize_cidr(dest)
        })
        .collect()
}

impl IpRouteTable {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let binary = which::which(&config.ip_binary).map_err(|e| AgentError::Route {
            op: "locate",
            route: config.ip_binary.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            binary,
            proto_id: config.proto_id,
        })
    }

    async fn ip(&self, op: &'static str, subject: &str, args: &[String]) -> Result<std::process::Output> {
        debug!(cmd = %self.binary.display(), args = ?args, "ip");
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| AgentError::Route {
                op,
                route: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn mutate(&self, op: &'static str, route: &LocalRoute, benign: &[&str]) -> Result<()> {
        let out = self.ip(op, &route.to_string(), &route_args(op, route, self.proto_id)).await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if benign.iter().any(|b| stderr.contains(b)) {
            debug!(route = %route, op, "route already in wanted state");
            return Ok(());
        }
        Err(AgentError::Route {
            op,
            route: route.to_string(),
            message: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn list(&self, interface: &str, family: IpFamily) -> Result<Vec<String>> {
        let out = self
            .ip("list", interface, &list_args(interface, family, self.proto_id))
            .await?;
        if !out.status.success() {
            return Err(AgentError::Route {
                op: "list",
                route: interface.to_string(),
                message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(parse_route_list(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn add(&self, route: &LocalRoute) -> Result<()> {
        self.mutate("add", route, &["File exists"]).await
    }

    async fn delete(&self, route: &LocalRoute) -> Result<()> {
        self.mutate("delete", route, &["No such process", "Cannot find device"])
            .await
    }
}

/// [`InterfaceLocator`] reading `/sys/class/net`.
pub struct SysfsInterfaces {
    root: PathBuf,
}

impl SysfsInterfaces {
    pub fn new() -> Self {
        Self::at("/sys/class/net")
    }

    pub fn at(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Default for SysfsInterfaces {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterfaceLocator for SysfsInterfaces {
    async fn interfaces(&self) -> Result<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| AgentError::io(format!("read {}", self.root.display()), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentError::io(format!("read {}", self.root.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lo" {
                continue;
            }
            match tokio::fs::read_to_string(entry.path().join("address")).await {
                Ok(mac) => {
                    found.insert(mac.trim().to_ascii_lowercase(), name);
                }
                Err(e) => debug!(interface = %name, error = %e, "no hardware address"),
            }
        }
        Ok(found)
    }
}

/// Routes wanted for the published interfaces. NICs whose MAC is not
/// present on the host are skipped.
pub fn desired_routes(
    published: &[NetworkInterface],
    names: &BTreeMap<String, String>,
    ip_aliases: bool,
) -> BTreeSet<LocalRoute> {
    let mut routes = BTreeSet::new();
    for nic in published {
        let Some(name) = names.get(&nic.mac.to_ascii_lowercase()) else {
            warn!(mac = %nic.mac, "no local interface with this MAC");
            continue;
        };
        let aliases: &[String] = if ip_aliases { &nic.ip_aliases } else { &[] };
        let addresses = nic
            .forwarded_ips
            .iter()
            .chain(&nic.forwarded_ipv6s)
            .chain(&nic.target_instance_ips)
            .chain(aliases);
        for raw in addresses {
            match normalize_cidr(raw) {
                Some(cidr) => {
                    routes.insert(LocalRoute::new(name.clone(), cidr));
                }
                None => warn!(address = %raw, interface = %name, "ignoring malformed address"),
            }
        }
    }
    routes
}

/// Route operations that take `current` to `desired`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePlan {
    pub add: Vec<LocalRoute>,
    pub remove: Vec<LocalRoute>,
}

impl RoutePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

pub fn plan(current: &BTreeSet<LocalRoute>, desired: &BTreeSet<LocalRoute>) -> RoutePlan {
    RoutePlan {
        add: desired.difference(current).cloned().collect(),
        remove: current.difference(desired).cloned().collect(),
    }
}

/// Applies route plans and remembers what it applied.
pub struct NetworkReconciler {
    table: Arc<dyn RouteTable>,
    locator: Arc<dyn InterfaceLocator>,
    ip_aliases: bool,
    // None until the first pass has read the table.
    applied: Mutex<Option<BTreeSet<LocalRoute>>>,
}

impl NetworkReconciler {
    pub fn new(table: Arc<dyn RouteTable>, locator: Arc<dyn InterfaceLocator>, ip_aliases: bool) -> Self {
        Self {
            table,
            locator,
            ip_aliases,
            applied: Mutex::new(None),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(IpRouteTable::new(config)?),
            Arc::new(SysfsInterfaces::new()),
            config.ip_aliases,
        ))
    }

    async fn read_table(&self, names: &BTreeMap<String, String>) -> Result<BTreeSet<LocalRoute>> {
        let lists = names.values().flat_map(|name| {
            [IpFamily::V4, IpFamily::V6].into_iter().map(move |family| async move {
                let cidrs = self.table.list(name, family).await?;
                Ok::<_, AgentError>(cidrs.into_iter().map(|cidr| LocalRoute::new(name.clone(), cidr)))
            })
        });
        let current = try_join_all(lists).await?.into_iter().flatten().collect();
        Ok(current)
    }

    /// Bring the local table in line with `published`.
    ///
    /// Every operation is attempted; the first failure is returned after the
    /// snapshot has been updated with the operations that did succeed.
    pub async fn reconcile(&self, published: &[NetworkInterface]) -> Result<RoutePlan> {
        let mut applied = self.applied.lock().await;
        let names = self.locator.interfaces().await?;
        let desired = desired_routes(published, &names, self.ip_aliases);
        let mut current = match applied.as_ref() {
            Some(snapshot) => snapshot.clone(),
            None => self.read_table(&names).await?,
        };
        let plan = plan(&current, &desired);
        if plan.is_empty() {
            debug!("routes up to date");
            *applied = Some(current);
            return Ok(plan);
        }

        let mut first_err = None;
        for route in &plan.add {
            match self.table.add(route).await {
                Ok(()) => {
                    info!(route = %route, "added local route");
                    current.insert(route.clone());
                }
                Err(e) => {
                    warn!(route = %route, error = %e, "add failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        for route in &plan.remove {
            match self.table.delete(route).await {
                Ok(()) => {
                    info!(route = %route, "removed local route");
                    current.remove(route);
                }
                Err(e) => {
                    warn!(route = %route, error = %e, "delete failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        *applied = Some(current);
        match first_err {
            Some(e) => Err(e),
            None => Ok(plan),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::{locator, FakeTable};
    use super::*;

    fn nic(mac: &str, forwarded: &[&str], aliases: &[&str]) -> NetworkInterface {
        NetworkInterface {
            mac: mac.to_string(),
            forwarded_ips: forwarded.iter().map(|s| s.to_string()).collect(),
            ip_aliases: aliases.iter().map(|s| s.to_string()).collect(),
            ..NetworkInterface::default()
        }
    }

    #[test]
    fn cidrs_are_normalized() {
        assert_eq!(normalize_cidr("10.0.0.5").as_deref(), Some("10.0.0.5/32"));
        assert_eq!(normalize_cidr("23.34.45.56/18").as_deref(), Some("23.34.45.56/18"));
        assert_eq!(
            normalize_cidr("2600:1901:ffb0:721d:8000::/96").as_deref(),
            Some("2600:1901:ffb0:721d:8000::/96")
        );
        assert_eq!(normalize_cidr("fd00::1").as_deref(), Some("fd00::1/128"));
        assert_eq!(normalize_cidr("10.0.0.5/33"), None);
        assert_eq!(normalize_cidr("not-an-ip"), None);
    }

    #[test]
    fn ip_command_lines() {
        let route = LocalRoute::new("eth0", "23.34.45.56/18");
        assert_eq!(
            route_args("add", &route, 66).join(" "),
            "-4 route add to local 23.34.45.56/18 scope host dev eth0 proto 66"
        );
        assert_eq!(
            list_args("eth0", IpFamily::V6, 66).join(" "),
            "-6 route list table local type local scope host dev eth0 proto 66"
        );
        assert_eq!(
            parse_route_list("10.0.0.5 \nlocal 10.0.1.0/24\n\n"),
            vec!["10.0.0.5/32".to_string(), "10.0.1.0/24".to_string()]
        );
    }

    #[test]
    fn aliases_only_when_enabled_and_unknown_macs_skipped() {
        let names = BTreeMap::from([("42:01:0a:00:00:02".to_string(), "eth0".to_string())]);
        let published = vec![
            nic("42:01:0A:00:00:02", &["10.0.0.5"], &["10.1.0.0/24"]),
            nic("42:01:0a:00:09:09", &["10.9.9.9"], &[]),
        ];
        let with = desired_routes(&published, &names, true);
        assert_eq!(
            with,
            BTreeSet::from([
                LocalRoute::new("eth0", "10.0.0.5/32"),
                LocalRoute::new("eth0", "10.1.0.0/24"),
            ])
        );
        let without = desired_routes(&published, &names, false);
        assert_eq!(without, BTreeSet::from([LocalRoute::new("eth0", "10.0.0.5/32")]));
    }

    #[tokio::test]
    async fn second_pass_with_same_input_is_a_no_op() {
        let table = Arc::new(FakeTable::default());
        let reconciler = NetworkReconciler::new(table.clone(), locator(), true);
        let published = vec![nic("42:01:0a:00:00:02", &["10.0.0.5", "fd00::1"], &[])];

        let first = reconciler.reconcile(&published).await.unwrap();
        assert_eq!(first.add.len(), 2);
        let second = reconciler.reconcile(&published).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(table.ops.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn withdrawn_addresses_are_removed() {
        let table = Arc::new(FakeTable::default());
        let reconciler = NetworkReconciler::new(table.clone(), locator(), true);
        reconciler
            .reconcile(&[nic("42:01:0a:00:00:02", &["10.0.0.5", "10.0.0.6"], &[])])
            .await
            .unwrap();
        // something outside the agent already removed this one
        table
            .routes
            .lock()
            .unwrap()
            .remove(&LocalRoute::new("eth0", "10.0.0.6/32"));

        let plan = reconciler
            .reconcile(&[nic("42:01:0a:00:00:02", &["10.0.0.5"], &[])])
            .await
            .unwrap();
        assert_eq!(plan.remove, vec![LocalRoute::new("eth0", "10.0.0.6/32")]);
        assert!(plan.add.is_empty());
    }

    #[tokio::test]
    async fn first_pass_reads_existing_agent_routes() {
        let table = Arc::new(FakeTable::default());
        table.routes.lock().unwrap().extend([
            LocalRoute::new("eth1", "10.7.0.1/32"),
            LocalRoute::new("eth0", "10.0.0.5/32"),
        ]);
        let reconciler = NetworkReconciler::new(table.clone(), locator(), true);
        let plan = reconciler
            .reconcile(&[nic("42:01:0a:00:00:02", &["10.0.0.5"], &[])])
            .await
            .unwrap();
        assert!(plan.add.is_empty());
        assert_eq!(plan.remove, vec![LocalRoute::new("eth1", "10.7.0.1/32")]);
    }

    #[tokio::test]
    async fn failed_add_is_retried_next_pass() {
        let table = Arc::new(FakeTable::default());
        *table.fail_add.lock().unwrap() = Some("10.0.0.6/32".into());
        let reconciler = NetworkReconciler::new(table.clone(), locator(), true);
        let published = vec![nic("42:01:0a:00:00:02", &["10.0.0.5", "10.0.0.6"], &[])];
        assert!(reconciler.reconcile(&published).await.is_err());
        // the successful add is remembered, the failed one is planned again
        let err = reconciler.reconcile(&published).await.unwrap_err();
        assert!(matches!(err, AgentError::Route { op: "add", .. }));
        let ops = table.ops.lock().unwrap().clone();
        assert_eq!(ops, vec!["add 10.0.0.5/32 dev eth0".to_string()]);
    }

    #[tokio::test]
    async fn sysfs_locator_skips_loopback() {
        let dir = tempfile::tempdir().unwrap();
        for (name, mac) in [("lo", "00:00:00:00:00:00"), ("ens4", "42:01:0A:80:00:02")] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("address"), format!("{mac}\n")).unwrap();
        }
        let found = SysfsInterfaces::at(dir.path()).interfaces().await.unwrap();
        assert_eq!(
            found,
            BTreeMap::from([("42:01:0a:80:00:02".to_string(), "ens4".to_string())])
        );
    }

    /// An `ip` stand-in that records its argv, prints the given output and
    /// exits with `code`.
    #[cfg(unix)]
    fn stub_ip(dir: &Path, stdout: &str, stderr: &str, code: i32) -> NetworkConfig {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("ip");
        let body = format!(
            "#!/bin/sh\necho \"$@\" >> {}\nprintf '%s' '{stdout}'\necho '{stderr}' >&2\nexit {code}\n",
            dir.join("argv").display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        NetworkConfig {
            ip_binary: script.to_string_lossy().into_owned(),
            ..NetworkConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ip_table_treats_existing_and_missing_routes_as_done() {
        let dir = tempfile::tempdir().unwrap();
        let route = LocalRoute::new("eth0", "10.0.0.5/32");

        let table = IpRouteTable::new(&stub_ip(dir.path(), "", "RTNETLINK answers: File exists", 2)).unwrap();
        table.add(&route).await.unwrap();

        let table = IpRouteTable::new(&stub_ip(dir.path(), "", "RTNETLINK answers: No such process", 2)).unwrap();
        table.delete(&route).await.unwrap();

        let argv = std::fs::read_to_string(dir.path().join("argv")).unwrap();
        assert_eq!(
            argv.lines().collect::<Vec<_>>(),
            vec![
                "-4 route add to local 10.0.0.5/32 scope host dev eth0 proto 66",
                "-4 route delete to local 10.0.0.5/32 scope host dev eth0 proto 66",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ip_table_reports_other_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_ip(dir.path(), "", "RTNETLINK answers: Operation not permitted", 2);
        let table = IpRouteTable::new(&config).unwrap();
        let err = table
            .add(&LocalRoute::new("eth0", "2001:db8::1/128"))
            .await
            .unwrap_err();
        match err {
            AgentError::Route { op, message, .. } => {
                assert_eq!(op, "add");
                assert!(message.contains("Operation not permitted"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        let argv = std::fs::read_to_string(dir.path().join("argv")).unwrap();
        assert!(argv.starts_with("-6 route add to local 2001:db8::1/128 "), "{argv}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ip_table_lists_agent_routes() {
        let dir = tempfile::tempdir().unwrap();
        let listing = "local 10.0.0.5 dev eth0 proto 66 scope host\n10.1.0.0/24 dev eth0 proto 66 scope host\n";
        let table = IpRouteTable::new(&stub_ip(dir.path(), listing, "", 0)).unwrap();
        let routes = table.list("eth0", IpFamily::V4).await.unwrap();
        assert_eq!(routes, vec!["10.0.0.5/32".to_string(), "10.1.0.0/24".to_string()]);
        let argv = std::fs::read_to_string(dir.path().join("argv")).unwrap();
        assert_eq!(
            argv.trim_end(),
            "-4 route list table local type local scope host dev eth0 proto 66"
        );
    }
}
