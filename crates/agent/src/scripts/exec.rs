use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{OsFamily, ScriptDescriptor, ScriptType};

use crate::config::ScriptsConfig;
use crate::error::{AgentError, Result};

use super::fetch::ScriptFetcher;
use super::uri::{resolve, ResolvedReference};

/// Flags placed before the script path when running PowerShell.
pub const POWERSHELL_ARGS: [&str; 5] = [
    "-NoProfile",
    "-NonInteractive",
    "-ExecutionPolicy",
    "Bypass",
    "-File",
];

/// How long output is still collected after a script exits. Processes the
/// script left running in the background can hold its pipes open.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Program and arguments used to start a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    fn direct(path: &Path) -> Self {
        Self {
            program: path.to_path_buf(),
            args: Vec::new(),
        }
    }

    fn with_interpreter(program: &str, prefix: &[&str], path: &Path) -> Self {
        let mut args: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        args.push(path.to_string_lossy().into_owned());
        Self {
            program: PathBuf::from(program),
            args,
        }
    }
}

/// A script on disk, ready to run. Dropping it removes its temporary
/// directory, if it has one.
#[derive(Debug)]
pub struct PreparedScript {
    pub metadata: String,
    pub script_type: ScriptType,
    pub path: PathBuf,
    pub invocation: Invocation,
    dir: Option<TempDir>,
}

impl PreparedScript {
    pub fn temp_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStatus {
    Exited(i32),
    /// Terminated without an exit code (signal).
    Terminated,
    Cancelled,
    /// Never started: resolution, fetch or spawn failed.
    Failed(String),
}

/// Outcome of one descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReport {
    pub metadata: String,
    pub status: ScriptStatus,
    /// Combined stdout and stderr lines, in arrival order.
    pub output: Vec<String>,
}

impl ScriptReport {
    pub fn is_success(&self) -> bool {
        self.status == ScriptStatus::Exited(0)
    }
}

pub struct ScriptExecutor {
    fetcher: ScriptFetcher,
    config: ScriptsConfig,
    os: OsFamily,
}

impl ScriptExecutor {
    pub fn new(fetcher: ScriptFetcher, config: ScriptsConfig, os: OsFamily) -> Self {
        Self { fetcher, config, os }
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("guest-agent-script-");
        let dir = match &self.config.run_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| AgentError::io(format!("create {}", dir.display()), e))?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| AgentError::io("create script temp dir", e))
    }

    /// Type of a URL script, judged from the extension of its reference.
    fn url_script_type(&self, reference: &ResolvedReference, raw: &str) -> Result<ScriptType> {
        if self.os == OsFamily::Linux {
            return Ok(ScriptType::UrlShell);
        }
        let hint = reference.file_name_hint();
        let ext = Path::new(&hint)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        ScriptType::from_url_extension(&ext).ok_or_else(|| AgentError::BadExtension {
            reference: raw.to_string(),
            ext,
        })
    }

    /// Build the command line for a script file of the given type.
    pub async fn invocation_for(&self, script_type: ScriptType, path: &Path) -> Invocation {
        if script_type.is_powershell() {
            return Invocation::with_interpreter(&self.config.powershell, &POWERSHELL_ARGS, path);
        }
        if script_type.is_shell() && !has_shebang(path).await {
            return Invocation::with_interpreter(&self.config.default_shell, &[], path);
        }
        Invocation::direct(path)
    }

    /// Resolve and, unless local, download a URL reference into a fresh
    /// temporary directory as `<metadata><ext>`.
    pub async fn prepare_uri(&self, metadata: &str, reference: &str) -> Result<PreparedScript> {
        let resolved = resolve(reference)?;
        let script_type = self.url_script_type(&resolved, reference)?;
        if let ResolvedReference::Local(path) = &resolved {
            return Ok(PreparedScript {
                metadata: metadata.to_string(),
                script_type,
                invocation: self.invocation_for(script_type, path).await,
                path: path.clone(),
                dir: None,
            });
        }
        let dir = self.scratch_dir()?;
        let file_name = format!("{metadata}{}", script_type.extension());
        let path = self.fetcher.download_to(&resolved, dir.path(), &file_name).await?;
        make_executable(&path).await?;
        Ok(PreparedScript {
            metadata: metadata.to_string(),
            script_type,
            invocation: self.invocation_for(script_type, &path).await,
            path,
            dir: Some(dir),
        })
    }

    async fn prepare_inline(&self, descriptor: &ScriptDescriptor) -> Result<PreparedScript> {
        let dir = self.scratch_dir()?;
        let file_name = format!(
            "{}{}",
            descriptor.metadata,
            descriptor.script_type.extension()
        );
        let path = dir.path().join(file_name);
        tokio::fs::write(&path, descriptor.script.as_bytes())
            .await
            .map_err(|e| AgentError::io(format!("write {}", path.display()), e))?;
        make_executable(&path).await?;
        Ok(PreparedScript {
            metadata: descriptor.metadata.clone(),
            script_type: descriptor.script_type,
            invocation: self.invocation_for(descriptor.script_type, &path).await,
            path,
            dir: Some(dir),
        })
    }

    pub async fn prepare(&self, descriptor: &ScriptDescriptor) -> Result<PreparedScript> {
        if descriptor.script_type.is_url() {
            self.prepare_uri(&descriptor.metadata, &descriptor.script).await
        } else {
            self.prepare_inline(descriptor).await
        }
    }

    /// Prepare and run one descriptor. Failures are reported, never returned.
    pub async fn run(&self, descriptor: &ScriptDescriptor, cancel: &CancellationToken) -> ScriptReport {
        let metadata = descriptor.metadata.clone();
        let prepared = match self.prepare(descriptor).await {
            Ok(p) => p,
            Err(e) => {
                warn!(script = %metadata, error = %e, "script not run");
                return ScriptReport {
                    metadata,
                    status: ScriptStatus::Failed(e.to_string()),
                    output: Vec::new(),
                };
            }
        };
        info!(script = %metadata, program = %prepared.invocation.program.display(), "running script");
        if let Some(dir) = prepared.temp_dir() {
            debug!(script = %metadata, dir = %dir.display(), "scratch directory");
        }
        let report = match run_invocation(&metadata, &prepared.invocation, cancel).await {
            Ok((status, output)) => ScriptReport {
                metadata,
                status,
                output,
            },
            Err(e) => ScriptReport {
                metadata,
                status: ScriptStatus::Failed(e.to_string()),
                output: Vec::new(),
            },
        };
        match &report.status {
            ScriptStatus::Exited(0) => info!(script = %report.metadata, "script finished"),
            status => warn!(script = %report.metadata, status = ?status, "script did not succeed"),
        }
        // `prepared` drops here, removing the scratch directory.
        drop(prepared);
        report
    }
}

async fn has_shebang(path: &Path) -> bool {
    let mut buf = [0u8; 2];
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    file.read_exact(&mut buf).await.is_ok() && &buf == b"#!"
}

async fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| AgentError::io(format!("stat {}", path.display()), e))?;
        let mut perms = meta.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|e| AgentError::io(format!("chmod {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

async fn run_invocation(
    metadata: &str,
    invocation: &Invocation,
    cancel: &CancellationToken,
) -> Result<(ScriptStatus, Vec<String>)> {
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Execution {
            metadata: metadata.to_string(),
            message: format!("spawn {}: {e}", invocation.program.display()),
        })?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(spawn_line_reader(metadata.to_string(), BufReader::new(out), tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(spawn_line_reader(metadata.to_string(), BufReader::new(err), tx.clone()));
    }
    drop(tx);

    let status = tokio::select! {
        res = child.wait() => match res {
            Ok(st) => st.code().map(ScriptStatus::Exited).unwrap_or(ScriptStatus::Terminated),
            Err(e) => return Err(AgentError::Execution {
                metadata: metadata.to_string(),
                message: format!("wait: {e}"),
            }),
        },
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            ScriptStatus::Cancelled
        }
    };
    let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
    let drained = if status == ScriptStatus::Cancelled {
        false
    } else {
        tokio::select! {
            _ = join_all(readers) => true,
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(OUTPUT_GRACE) => false,
        }
    };
    if !drained {
        debug!(script = %metadata, "output still open after exit, detaching");
        for abort in aborts {
            abort.abort();
        }
    }
    let mut output = Vec::new();
    while let Ok(line) = rx.try_recv() {
        output.push(line);
    }
    Ok((status, output))
}

fn spawn_line_reader<R>(
    metadata: String,
    mut rdr: BufReader<R>,
    tx: tokio::sync::mpsc::UnboundedSender<String>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match rdr.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = line.trim_end().to_string();
                    info!(script = %metadata, "{}", text);
                    let _ = tx.send(text);
                }
                Err(e) => {
                    warn!(script = %metadata, error = %e, "output read error");
                    break;
                }
            }
        }
    })
}
