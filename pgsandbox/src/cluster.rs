//! Lifecycle of the PostgreSQL server backing the sandbox.
//!
//! A managed [`Cluster`] owns a private temporary data directory and the `postgres` process
//! serving it over a Unix socket in that directory. An attached cluster points at a server
//! somebody else runs; its lifecycle operations are no-ops and it only ever touches the
//! instances it created itself.
//!
//! ```text
//!                initialize           start
//! Uninitialized ------------> Initialized ------> Started
//!       ^                         |                 |  ^
//!       |          cleanup        |            stop |  | start
//!       +-------------------------+-----------------v--+
//!                                              Stopped
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use pgsandbox_config::SandboxConfig;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bail;
use crate::error::{ErrorKind, SandboxError, SandboxResult};
use crate::names::NameAllocator;
use crate::preload::TemplatePreloadPool;
use crate::process::{Binary, CommandRunner, Invocation};
use crate::provisioner::{PgProvisioner, Provision, Readiness};
use crate::sandbox_error;

/// Prefix of the temporary data directories of managed clusters.
const DATA_DIR_PREFIX: &str = "pgsandbox-";

/// Number of trailing server output lines kept for error reports.
const CAPTURED_OUTPUT_LINES: usize = 200;

/// Time granted to the output forwarders to drain the pipes of an exited server.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`Cluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// Last lines written by the server, shared with the output forwarders.
type CapturedOutput = Arc<Mutex<Vec<String>>>;

/// A running `postgres` process and the tasks forwarding its output to tracing.
struct ServerProcess {
    child: Child,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    output: CapturedOutput,
}

impl ServerProcess {
    fn new(mut child: Child) -> Self {
        let output = CapturedOutput::default();
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(forward_output(stdout, false, output.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_output(stderr, true, output.clone())));

        Self {
            child,
            stdout_task,
            stderr_task,
            output,
        }
    }

    /// Waits for the forwarders to reach the end of the pipes of an exited process and
    /// returns what the process wrote.
    async fn drain_output(&mut self) -> String {
        for task in [self.stdout_task.take(), self.stderr_task.take()]
            .into_iter()
            .flatten()
        {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await;
        }

        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .join("\n")
    }

    /// Requests a fast shutdown and waits for the process to exit, killing it once
    /// `timeout` elapses.
    async fn shutdown(&mut self, timeout: Duration) -> SandboxResult<()> {
        if let Some(pid) = self.child.id() {
            match i32::try_from(pid) {
                Ok(pid) => {
                    if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
                        warn!(pid, error = %err, "failed to signal postgres");
                    }
                }
                Err(_) => warn!(pid, "postgres pid does not fit a signal target"),
            }
        }

        let result = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "postgres exited");
                Ok(())
            }
            Ok(Err(err)) => Err(SandboxError::from(err)),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "postgres did not shut down in time, killing it"
                );
                self.child.kill().await.map_err(SandboxError::from)
            }
        };

        self.abort_output_tasks();

        result
    }

    fn abort_output_tasks(&mut self) {
        for task in [self.stdout_task.take(), self.stderr_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

async fn forward_output<R>(reader: R, is_stderr: bool, output: CapturedOutput)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "postgres", "{}", line);
        } else {
            info!(target: "postgres", "{}", line);
        }

        let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
        if output.len() == CAPTURED_OUTPUT_LINES {
            output.remove(0);
        }
        output.push(line);
    }
}

enum Server {
    Managed {
        data_dir: Option<TempDir>,
        process: Option<ServerProcess>,
    },
    External {
        host: String,
    },
}

struct ClusterInner<P> {
    state: ClusterState,
    server: Server,
    pool: Option<TemplatePreloadPool<P>>,
}

/// A PostgreSQL server handing out isolated database instances.
///
/// Every method takes `&self`; operations are serialized by an internal lock, so a cluster
/// can be shared through an [`Arc`].
pub struct Cluster<P = PgProvisioner> {
    config: Arc<SandboxConfig>,
    runner: CommandRunner,
    inner: tokio::sync::Mutex<ClusterInner<P>>,
}

impl Cluster<PgProvisioner> {
    /// Creates an uninitialized cluster that will own its server.
    pub fn new(config: Arc<SandboxConfig>) -> Self {
        Self {
            runner: CommandRunner::new(config.clone()),
            config,
            inner: tokio::sync::Mutex::new(ClusterInner {
                state: ClusterState::Uninitialized,
                server: Server::Managed {
                    data_dir: None,
                    process: None,
                },
                pool: None,
            }),
        }
    }

    /// Attaches to the externally managed server named by [`SandboxConfig::host`].
    pub async fn attach(config: Arc<SandboxConfig>) -> SandboxResult<Self> {
        let Some(host) = config.host.clone() else {
            bail!(
                ErrorKind::ConfigError,
                "No external server configured",
                "set PGSANDBOX_HOST to the socket directory or host name of the server"
            );
        };

        let provisioner = PgProvisioner::new(host.clone(), config.clone());
        if !provisioner.ping().await? {
            bail!(
                ErrorKind::ConnectionFailed,
                "External server is not accepting connections",
                format!("no answer from the server at {host}")
            );
        }

        Self::attach_with(config, host, provisioner).await
    }

    /// Creates the data directory and bootstraps it with `initdb`.
    ///
    /// No-op for attached clusters.
    pub async fn initialize(&self) -> SandboxResult<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.server, Server::External { .. }) {
            return Ok(());
        }

        ensure_state(inner.state, &[ClusterState::Uninitialized], "initialize")?;

        let data_dir = tempfile::Builder::new()
            .prefix(DATA_DIR_PREFIX)
            .tempdir()?;
        let path = data_dir.path().to_string_lossy().into_owned();

        info!(data_dir = %path, "initializing cluster");

        let invocation = Invocation::new(Binary::Initdb)
            .args(["-E", self.config.server.encoding.as_str()])
            .args(["-A", "trust"])
            .args(["-U", self.config.superuser.as_str()])
            .args(["-D", path.as_str()])
            .env("PGOPTIONS", "-F");
        // The temporary directory is removed on drop if bootstrapping fails.
        self.runner.run(invocation).await?;

        let provisioner = PgProvisioner::new(path, self.config.clone());
        inner.pool = Some(TemplatePreloadPool::new(
            provisioner,
            NameAllocator::new(self.config.name_prefix.as_str()),
            self.config.preload_high_water_mark,
            false,
        ));
        inner.server = Server::Managed {
            data_dir: Some(data_dir),
            process: None,
        };
        inner.state = ClusterState::Initialized;

        Ok(())
    }

    /// Starts the server and waits until it accepts connections.
    ///
    /// No-op for attached clusters.
    pub async fn start(&self) -> SandboxResult<()> {
        let mut inner = self.inner.lock().await;
        let ClusterInner {
            state,
            server,
            pool,
        } = &mut *inner;

        let Server::Managed { data_dir, process } = server else {
            return Ok(());
        };

        ensure_state(
            *state,
            &[ClusterState::Initialized, ClusterState::Stopped],
            "start",
        )?;

        let (Some(data_dir), Some(pool)) = (data_dir.as_ref(), pool.as_mut()) else {
            bail!(
                ErrorKind::LifecycleViolation,
                "Cluster has no data directory",
                format!("cannot start a cluster in state {state}")
            );
        };
        let path = data_dir.path().to_string_lossy().into_owned();

        let mut invocation = Invocation::new(Binary::Postgres)
            .args(["-D", path.as_str()])
            .args(["-k", path.as_str()])
            .args(["-h", ""]);
        for (key, value) in self.config.server.effective_options() {
            invocation = invocation.arg("-c").arg(format!("{key}={value}"));
        }

        info!(data_dir = %path, "starting postgres");

        let mut server_process = ServerProcess::new(self.runner.spawn(&invocation)?);
        self.wait_for_ready(&mut server_process, pool.provisioner())
            .await?;

        let existing = match pool.provisioner().list().await {
            Ok(existing) => existing,
            Err(err) => {
                if let Err(shutdown_err) = server_process
                    .shutdown(self.config.server.shutdown_timeout())
                    .await
                {
                    error!(error = %shutdown_err, "failed to stop postgres after a failed start");
                }
                return Err(err);
            }
        };
        pool.reconcile(existing);

        *process = Some(server_process);
        *state = ClusterState::Started;

        info!(data_dir = %path, "postgres is ready");

        Ok(())
    }

    /// Polls the readiness query until it succeeds, the process exits or the readiness
    /// timeout elapses. The process is stopped before any error is returned.
    async fn wait_for_ready(
        &self,
        process: &mut ServerProcess,
        provisioner: &PgProvisioner,
    ) -> SandboxResult<()> {
        let timeout = self.config.server.readiness_timeout();
        let poll_interval = self.config.server.readiness_poll_interval();
        let deadline = Instant::now() + timeout;
        let mut last_probe;

        loop {
            if let Some(status) = process.child.try_wait()? {
                let output = process.drain_output().await;
                return Err(server_exited(status, &output));
            }

            match provisioner.probe().await {
                Ok(Readiness::Ready) => return Ok(()),
                Ok(Readiness::NotReady(output)) => last_probe = output,
                Err(err) => {
                    if let Err(shutdown_err) =
                        process.shutdown(self.config.server.shutdown_timeout()).await
                    {
                        warn!(error = %shutdown_err, "failed to stop postgres after a failed probe");
                    }
                    return Err(err);
                }
            }

            if Instant::now() >= deadline {
                if let Err(err) = process.shutdown(self.config.server.shutdown_timeout()).await {
                    warn!(error = %err, "failed to stop postgres after readiness timeout");
                }

                bail!(
                    ErrorKind::ReadinessTimeout,
                    "Server did not accept connections in time",
                    format!(
                        "postgres was not ready after {}ms\nLAST PROBE:\n{last_probe}",
                        timeout.as_millis()
                    )
                );
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl<P> Cluster<P>
where
    P: Provision,
{
    /// Attaches to an externally managed server reachable at `host` through `provisioner`.
    ///
    /// The databases already on the server are snapshotted once, and only instances this
    /// cluster creates may be used as templates or dropped.
    pub async fn attach_with(
        config: Arc<SandboxConfig>,
        host: impl Into<String>,
        provisioner: P,
    ) -> SandboxResult<Self> {
        let host = host.into();
        let existing = provisioner.list().await?;

        info!(%host, databases = existing.len(), "attached to external server");

        let mut pool = TemplatePreloadPool::new(
            provisioner,
            NameAllocator::new(config.name_prefix.as_str()),
            config.preload_high_water_mark,
            true,
        );
        pool.reconcile(existing);

        Ok(Self {
            runner: CommandRunner::new(config.clone()),
            config,
            inner: tokio::sync::Mutex::new(ClusterInner {
                state: ClusterState::Started,
                server: Server::External { host },
                pool: Some(pool),
            }),
        })
    }

    pub fn config(&self) -> &Arc<SandboxConfig> {
        &self.config
    }

    pub async fn state(&self) -> ClusterState {
        self.inner.lock().await.state
    }

    pub async fn is_external(&self) -> bool {
        matches!(self.inner.lock().await.server, Server::External { .. })
    }

    /// Returns the data directory of a managed cluster, if it exists.
    pub async fn data_dir(&self) -> Option<PathBuf> {
        match &self.inner.lock().await.server {
            Server::Managed {
                data_dir: Some(data_dir),
                ..
            } => Some(data_dir.path().to_path_buf()),
            _ => None,
        }
    }

    /// Returns where clients reach the server: a socket directory or a host name.
    pub async fn host(&self) -> SandboxResult<String> {
        let inner = self.inner.lock().await;
        ensure_reachable(&inner)?;

        match &inner.server {
            Server::External { host } => Ok(host.clone()),
            Server::Managed { data_dir, .. } => data_dir
                .as_ref()
                .map(|data_dir| data_dir.path().to_string_lossy().into_owned())
                .ok_or_else(|| {
                    sandbox_error!(
                        ErrorKind::LifecycleViolation,
                        "Cluster is not reachable",
                        "cluster has no data directory"
                    )
                }),
        }
    }

    /// Returns a new instance, cloned from `template` when given.
    pub async fn create_instance(&self, template: Option<&str>) -> SandboxResult<String> {
        let mut inner = self.inner.lock().await;
        let pool = reachable_pool(&mut inner)?;

        let name = pool.acquire(template).await?;
        info!(%name, ?template, "created instance");

        Ok(name)
    }

    /// Drops the instance `name` along with the preloaded clones of it.
    pub async fn drop_instance(&self, name: &str) -> SandboxResult<()> {
        let mut inner = self.inner.lock().await;
        let pool = reachable_pool(&mut inner)?;

        pool.drop(name).await?;
        info!(%name, "dropped instance");

        Ok(())
    }

    /// Drops every preloaded instance while leaving the server running.
    pub async fn release_preloaded(&self) -> SandboxResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match inner.pool.as_mut() {
            Some(pool) if inner.state == ClusterState::Started => pool.drain_all().await,
            _ => Ok(()),
        }
    }

    /// Stops the server with a fast shutdown.
    ///
    /// No-op for attached clusters.
    pub async fn stop(&self) -> SandboxResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if matches!(inner.server, Server::External { .. }) {
            return Ok(());
        }

        ensure_state(inner.state, &[ClusterState::Started], "stop")?;

        let mut errors = Vec::new();
        // Background clones need the server, so they finish first.
        if let Some(pool) = inner.pool.as_mut()
            && let Err(err) = pool.join().await
        {
            errors.push(err);
        }

        if let Server::Managed { process, .. } = &mut inner.server
            && let Some(mut process) = process.take()
        {
            info!("stopping postgres");
            if let Err(err) = process.shutdown(self.config.server.shutdown_timeout()).await {
                errors.push(err);
            }
        }
        inner.state = ClusterState::Stopped;

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Tears the cluster down: drains the preload pool, stops the server and removes the
    /// data directory.
    ///
    /// Idempotent. Every step runs even if an earlier one failed, and the failures are
    /// returned aggregated. Attached clusters only drain their pool.
    pub async fn cleanup(&self) -> SandboxResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut errors = Vec::new();

        if inner.state == ClusterState::Started
            && let Some(pool) = inner.pool.as_mut()
            && let Err(err) = pool.drain_all().await
        {
            errors.push(err);
        }

        if let Server::Managed { data_dir, process } = &mut inner.server {
            if let Some(mut process) = process.take() {
                info!("stopping postgres");
                if let Err(err) = process.shutdown(self.config.server.shutdown_timeout()).await {
                    errors.push(err);
                }
            }

            if let Some(data_dir) = data_dir.take() {
                let path = data_dir.path().to_path_buf();
                if let Err(err) = remove_data_dir(data_dir) {
                    errors.push(err);
                } else {
                    info!(data_dir = %path.display(), "removed data directory");
                }
            }

            inner.pool = None;
            inner.state = ClusterState::Uninitialized;
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }
}

impl<P> fmt::Debug for Cluster<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name_prefix", &self.config.name_prefix)
            .field("external", &self.config.is_external())
            .finish_non_exhaustive()
    }
}

fn ensure_state(
    current: ClusterState,
    allowed: &[ClusterState],
    operation: &'static str,
) -> SandboxResult<()> {
    if !allowed.contains(&current) {
        bail!(
            ErrorKind::LifecycleViolation,
            "Cluster operation called out of order",
            format!("cannot {operation} a cluster in state {current}")
        );
    }

    Ok(())
}

fn ensure_reachable<P>(inner: &ClusterInner<P>) -> SandboxResult<()> {
    if inner.state != ClusterState::Started {
        bail!(
            ErrorKind::LifecycleViolation,
            "Cluster is not reachable",
            format!("cluster is {}", inner.state)
        );
    }

    Ok(())
}

fn reachable_pool<P>(inner: &mut ClusterInner<P>) -> SandboxResult<&mut TemplatePreloadPool<P>> {
    ensure_reachable(inner)?;

    inner.pool.as_mut().ok_or_else(|| {
        sandbox_error!(
            ErrorKind::LifecycleViolation,
            "Cluster is not reachable",
            "cluster has no preload pool"
        )
    })
}

fn server_exited(status: ExitStatus, output: &str) -> SandboxError {
    sandbox_error!(
        ErrorKind::ServerExited,
        "Server exited before accepting connections",
        format!("postgres exited with {status}\nOUTPUT:\n{output}")
    )
}

/// Removes a data directory, tolerating one that is already gone.
fn remove_data_dir(data_dir: TempDir) -> SandboxResult<()> {
    match data_dir.close() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use pgsandbox_config::ServerConfig;

    use super::*;
    use crate::test_utils::memory_provisioner::MemoryProvisioner;

    fn install(dir: &Path, binary: Binary, body: &str) {
        let path = dir.join(binary.name());
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fake_config(bin_dir: &Path) -> Arc<SandboxConfig> {
        Arc::new(SandboxConfig {
            bin_dir: Some(bin_dir.to_path_buf()),
            server: ServerConfig {
                readiness_timeout_ms: 500,
                shutdown_timeout_ms: 2_000,
                ..ServerConfig::default()
            },
            ..SandboxConfig::default()
        })
    }

    /// Installs binaries behaving like a healthy server.
    fn install_healthy_binaries(dir: &Path) {
        install(dir, Binary::Initdb, "exit 0");
        install(dir, Binary::Postgres, "echo 'listening'\nexec sleep 30");
        install(dir, Binary::Psql, "echo YAY");
        install(dir, Binary::Createdb, "exit 0");
        install(dir, Binary::Dropdb, "exit 0");
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let bin_dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(fake_config(bin_dir.path()));

        let err = cluster.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LifecycleViolation);

        let err = cluster.stop().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LifecycleViolation);

        let err = cluster.host().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LifecycleViolation);

        let err = cluster.create_instance(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LifecycleViolation);

        cluster.cleanup().await.unwrap();
        cluster.cleanup().await.unwrap();
        assert_eq!(cluster.state().await, ClusterState::Uninitialized);
    }

    #[tokio::test]
    async fn failed_bootstrap_reports_output_and_stays_uninitialized() {
        let bin_dir = tempfile::tempdir().unwrap();
        install(
            bin_dir.path(),
            Binary::Initdb,
            "echo \"initdb: invalid locale\" >&2\nexit 1",
        );
        let cluster = Cluster::new(fake_config(bin_dir.path()));

        let err = cluster.initialize().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert!(err.detail().unwrap().contains("initdb: invalid locale"));
        assert_eq!(cluster.state().await, ClusterState::Uninitialized);
        assert!(cluster.data_dir().await.is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_with_fake_server() {
        let bin_dir = tempfile::tempdir().unwrap();
        install_healthy_binaries(bin_dir.path());
        let cluster = Cluster::new(fake_config(bin_dir.path()));

        cluster.initialize().await.unwrap();
        let data_dir = cluster.data_dir().await.unwrap();
        assert!(data_dir.is_dir());
        assert_eq!(cluster.state().await, ClusterState::Initialized);
        assert_eq!(
            cluster.initialize().await.unwrap_err().kind(),
            ErrorKind::LifecycleViolation
        );

        cluster.start().await.unwrap();
        assert_eq!(cluster.state().await, ClusterState::Started);
        assert_eq!(cluster.host().await.unwrap(), data_dir.to_string_lossy());
        assert_eq!(cluster.create_instance(None).await.unwrap(), "test_db1");

        cluster.stop().await.unwrap();
        assert_eq!(cluster.state().await, ClusterState::Stopped);

        cluster.start().await.unwrap();
        assert_eq!(cluster.create_instance(None).await.unwrap(), "test_db2");

        cluster.cleanup().await.unwrap();
        assert!(!data_dir.exists());
        assert_eq!(cluster.state().await, ClusterState::Uninitialized);
        cluster.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn server_exiting_early_surfaces_its_output() {
        let bin_dir = tempfile::tempdir().unwrap();
        install_healthy_binaries(bin_dir.path());
        install(
            bin_dir.path(),
            Binary::Postgres,
            "echo 'FATAL:  could not create lock file' >&2\nexit 1",
        );
        install(bin_dir.path(), Binary::Psql, "exit 2");
        let cluster = Cluster::new(fake_config(bin_dir.path()));
        cluster.initialize().await.unwrap();
        let data_dir = cluster.data_dir().await.unwrap();

        let err = cluster.start().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ServerExited);
        assert!(err.detail().unwrap().contains("could not create lock file"));
        assert_eq!(cluster.state().await, ClusterState::Initialized);

        cluster.cleanup().await.unwrap();
        assert!(!data_dir.exists());
    }

    #[tokio::test]
    async fn readiness_timeout_stops_the_server() {
        let bin_dir = tempfile::tempdir().unwrap();
        install_healthy_binaries(bin_dir.path());
        install(
            bin_dir.path(),
            Binary::Psql,
            "echo 'no response from server' >&2\nexit 2",
        );
        // The data directory is the second argument.
        install(
            bin_dir.path(),
            Binary::Postgres,
            "echo $$ > \"$2/server.pid\"\nexec sleep 30",
        );
        let cluster = Cluster::new(fake_config(bin_dir.path()));
        cluster.initialize().await.unwrap();
        let data_dir = cluster.data_dir().await.unwrap();

        let started_at = Instant::now();
        let err = cluster.start().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ReadinessTimeout);
        assert!(err.detail().unwrap().contains("no response from server"));
        assert!(started_at.elapsed() < Duration::from_secs(10));
        assert_eq!(cluster.state().await, ClusterState::Initialized);

        let pid: i32 = fs::read_to_string(data_dir.join("server.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(signal::kill(Pid::from_raw(pid), None).is_err());

        cluster.cleanup().await.unwrap();
        cluster.cleanup().await.unwrap();
        assert!(!data_dir.exists());
    }

    #[tokio::test]
    async fn attach_fails_when_the_server_does_not_answer() {
        let bin_dir = tempfile::tempdir().unwrap();
        install(
            bin_dir.path(),
            Binary::Psql,
            "echo 'connection refused' >&2\nexit 2",
        );
        let config = Arc::new(SandboxConfig {
            host: Some("/var/run/postgresql".into()),
            bin_dir: Some(bin_dir.path().to_path_buf()),
            ..SandboxConfig::default()
        });

        let err = Cluster::attach(config).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn attached_cluster_snapshots_existing_databases_only_once() {
        let provisioner = MemoryProvisioner::new();
        let config = Arc::new(SandboxConfig {
            host: Some("/var/run/postgresql".into()),
            ..SandboxConfig::default()
        });
        let cluster = Cluster::attach_with(config, "/var/run/postgresql", provisioner.clone())
            .await
            .unwrap();

        // Appears on the server after attaching, so it is never treated as stale.
        provisioner.create("test_db2", None).await.unwrap();
        cluster.stop().await.unwrap();
        cluster.start().await.unwrap();

        assert_eq!(cluster.create_instance(None).await.unwrap(), "test_db1");
        let err = cluster.create_instance(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert!(provisioner.dropped().await.is_empty());
    }

    #[tokio::test]
    async fn attached_cluster_ignores_lifecycle_and_protects_foreign_databases() {
        let provisioner = MemoryProvisioner::new()
            .with_existing(["postgres", "app", "test_db1"])
            .await;
        let config = Arc::new(SandboxConfig {
            host: Some("/var/run/postgresql".into()),
            ..SandboxConfig::default()
        });
        let cluster = Cluster::attach_with(config, "/var/run/postgresql", provisioner.clone())
            .await
            .unwrap();

        cluster.initialize().await.unwrap();
        cluster.start().await.unwrap();
        assert!(cluster.is_external().await);
        assert_eq!(cluster.host().await.unwrap(), "/var/run/postgresql");

        // test_db1 is left over from a previous run and gets replaced.
        let template = cluster.create_instance(None).await.unwrap();
        assert_eq!(template, "test_db1");
        assert_eq!(provisioner.dropped().await, vec!["test_db1".to_owned()]);

        let err = cluster.drop_instance("app").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForeignInstance);
        let err = cluster.create_instance(Some("app")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForeignInstance);

        let clone = cluster.create_instance(Some(&template)).await.unwrap();
        cluster.drop_instance(&clone).await.unwrap();

        cluster.cleanup().await.unwrap();
        cluster.stop().await.unwrap();
        assert_eq!(cluster.state().await, ClusterState::Started);
        assert_eq!(
            provisioner.database_names().await,
            vec!["app", "postgres", "test_db1"]
        );
    }
}
