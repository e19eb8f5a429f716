//! Process control: spawn a service in its own process group, check whether
//! it is still alive, and stop it with SIGTERM then SIGKILL.
//!
//! The [`ProcessControl`] trait is the seam the orchestrator drives;
//! [`UnixProcessControl`] is the real implementation.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use warden_types::{Launcher, ServiceDefinition, WardenError};

/// Poll period while waiting for a signalled process to exit.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Upper bound on reaping after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Launch specification
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to exec one service, resolved from its definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub service: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Complete child environment; the child sees nothing else.
    pub env: BTreeMap<String, String>,
    /// Append-only destination for stdout and stderr; `None` discards output.
    pub log_path: Option<PathBuf>,
}

impl LaunchSpec {
    /// Build the launch spec for `def`, layering its variables on `parent_env`.
    ///
    /// A conda environment puts its `bin/` first on `PATH`, its `lib/` first
    /// on `LD_LIBRARY_PATH` and sets `CONDA_PREFIX`, so children locate the
    /// interpreter and shared libraries of that environment. Declared
    /// variables are applied last and win.
    pub fn from_definition<I>(def: &ServiceDefinition, log_dir: &Path, parent_env: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = parent_env.into_iter().collect();

        if let Some(prefix) = &def.conda_env {
            let bin = prefix.join("bin").display().to_string();
            let lib = prefix.join("lib").display().to_string();
            let path = match env.get("PATH") {
                Some(p) if !p.is_empty() => format!("{bin}:{p}"),
                _ => bin,
            };
            let ld = match env.get("LD_LIBRARY_PATH") {
                Some(p) if !p.is_empty() => format!("{lib}:{p}"),
                _ => lib,
            };
            env.insert("PATH".into(), path);
            env.insert("LD_LIBRARY_PATH".into(), ld);
            env.insert("CONDA_PREFIX".into(), prefix.display().to_string());
        }
        env.extend(def.environment.clone());

        let (program, args) = match def.launcher {
            Launcher::Direct => {
                let mut words = def.command.iter();
                let program = words.next().map(PathBuf::from).unwrap_or_default();
                (program, words.cloned().collect())
            }
            Launcher::Shell => (
                PathBuf::from("/bin/sh"),
                vec!["-c".to_string(), def.command.join(" ")],
            ),
            Launcher::Python => {
                let prefix = def.conda_env.clone().unwrap_or_default();
                (prefix.join("bin").join("python"), def.command.clone())
            }
        };

        Self {
            service: def.name.clone(),
            program,
            args,
            cwd: def.working_dir.clone(),
            env,
            log_path: def.log_file.as_ref().map(|f| log_dir.join(f)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque reference to a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub id: u64,
    pub pid: u32,
}

/// How a process exited; `code` is `None` when a signal ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
    /// Was already gone before the stop began.
    AlreadyExited,
}

#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawn without waiting for readiness.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, WardenError>;

    /// `Some` once the process has exited. Unknown handles count as exited.
    async fn try_wait(&self, handle: &ProcessHandle) -> Result<Option<ExitInfo>, WardenError>;

    /// SIGTERM the process group, wait up to `grace`, then SIGKILL.
    ///
    /// Stopping a process that has already exited succeeds.
    async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> Result<StopOutcome, WardenError>;

    /// Block until the process exits or `timeout` elapses.
    async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> Result<Option<ExitInfo>, WardenError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.try_wait(handle).await? {
                return Ok(Some(exit));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(EXIT_POLL).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Unix implementation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ChildRec {
    child: Child,
    pgid: libc::pid_t,
    service: String,
}

/// Spawns each service as a session leader so the whole tree can be
/// signalled through its process group.
#[derive(Debug, Default)]
pub struct UnixProcessControl {
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, ChildRec>>,
}

impl UnixProcessControl {
    pub fn new() -> Self {
        Self::default()
    }
}

fn startup_error(service: &str, e: &io::Error, what: &str) -> WardenError {
    let retryable = !matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    );
    WardenError::Startup {
        service: service.to_string(),
        reason: format!("{what}: {e}"),
        retryable,
    }
}

fn open_log(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Send `signal` to the group; `Ok(false)` when the group no longer exists.
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> io::Result<bool> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

async fn wait_exit(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitInfo>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(ExitInfo { code: status.code() }));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        sleep(EXIT_POLL).await;
    }
}

#[async_trait]
impl ProcessControl for UnixProcessControl {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, WardenError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        match &spec.log_path {
            Some(path) => {
                let out = open_log(path).map_err(|e| startup_error(&spec.service, &e, "cannot open log file"))?;
                let err = out
                    .try_clone()
                    .map_err(|e| startup_error(&spec.service, &e, "cannot open log file"))?;
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| startup_error(&spec.service, &e, &format!("cannot spawn {}", spec.program.display())))?;
        let pid = child.id().ok_or_else(|| WardenError::Startup {
            service: spec.service.clone(),
            reason: "process exited before its pid was read".into(),
            retryable: true,
        })?;
        let pgid = libc::pid_t::try_from(pid).map_err(|_| WardenError::Startup {
            service: spec.service.clone(),
            reason: format!("pid {pid} out of range"),
            retryable: false,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.children.lock().await.insert(
            id,
            ChildRec {
                child,
                pgid,
                service: spec.service.clone(),
            },
        );
        info!(service = %spec.service, pid, program = %spec.program.display(), "Process spawned");
        Ok(ProcessHandle { id, pid })
    }

    async fn try_wait(&self, handle: &ProcessHandle) -> Result<Option<ExitInfo>, WardenError> {
        let mut children = self.children.lock().await;
        let Some(rec) = children.get_mut(&handle.id) else {
            return Ok(Some(ExitInfo { code: None }));
        };
        match rec.child.try_wait() {
            Ok(Some(status)) => {
                let exit = ExitInfo { code: status.code() };
                debug!(service = %rec.service, pid = handle.pid, code = ?exit.code, "Process exited");
                children.remove(&handle.id);
                Ok(Some(exit))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(WardenError::Startup {
                service: rec.service.clone(),
                reason: format!("cannot query process state: {e}"),
                retryable: true,
            }),
        }
    }

    async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> Result<StopOutcome, WardenError> {
        // Take the record out so other services are not blocked during the grace period.
        let Some(mut rec) = self.children.lock().await.remove(&handle.id) else {
            return Ok(StopOutcome::AlreadyExited);
        };
        let stop_error = |reason: String| WardenError::Stop {
            service: rec.service.clone(),
            reason,
        };

        if let Ok(Some(_)) = rec.child.try_wait() {
            return Ok(StopOutcome::AlreadyExited);
        }

        match signal_group(rec.pgid, libc::SIGTERM) {
            Ok(true) => {}
            Ok(false) => {
                let _ = rec.child.wait().await;
                return Ok(StopOutcome::AlreadyExited);
            }
            Err(e) => return Err(stop_error(format!("SIGTERM failed: {e}"))),
        }

        if let Some(exit) = wait_exit(&mut rec.child, grace)
            .await
            .map_err(|e| stop_error(e.to_string()))?
        {
            info!(service = %rec.service, pid = handle.pid, code = ?exit.code, "Process stopped");
            return Ok(StopOutcome::Graceful);
        }

        warn!(service = %rec.service, pid = handle.pid, ?grace, "Grace period elapsed; sending SIGKILL");
        signal_group(rec.pgid, libc::SIGKILL).map_err(|e| stop_error(format!("SIGKILL failed: {e}")))?;
        match wait_exit(&mut rec.child, KILL_WAIT)
            .await
            .map_err(|e| stop_error(e.to_string()))?
        {
            Some(_) => Ok(StopOutcome::Killed),
            None => Err(stop_error(format!("still alive {KILL_WAIT:?} after SIGKILL"))),
        }
    }
}
