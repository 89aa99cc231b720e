//! Invocation of the PostgreSQL command-line tools.
//!
//! Every binary is resolved from [`SandboxConfig::bin_dir`] when configured, otherwise from
//! `PATH`. Short-lived commands are run to completion with stderr redirected into the stdout
//! pipe, so their output reads in the order it was written; the server itself is spawned and
//! handed back to the caller.

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use pgsandbox_config::SandboxConfig;
use secrecy::ExposeSecret;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, SandboxError, SandboxResult};
use crate::sandbox_error;

/// Environment variable read by libpq clients for the password.
const PASSWORD_ENV: &str = "PGPASSWORD";

/// PostgreSQL binaries used by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binary {
    Initdb,
    Postgres,
    Psql,
    Createdb,
    Dropdb,
}

impl Binary {
    /// Returns the executable name of the binary.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initdb => "initdb",
            Self::Postgres => "postgres",
            Self::Psql => "psql",
            Self::Createdb => "createdb",
            Self::Dropdb => "dropdb",
        }
    }
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A command line to run: a binary, its arguments and extra environment variables.
#[derive(Debug, Clone)]
pub struct Invocation {
    binary: Binary,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(binary: Binary) -> Self {
        Self {
            binary,
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Resolves and runs PostgreSQL binaries with the sandbox credentials.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: Arc<SandboxConfig>,
}

impl CommandRunner {
    pub fn new(config: Arc<SandboxConfig>) -> Self {
        Self { config }
    }

    /// Resolves the full path of `binary`.
    pub fn resolve(&self, binary: Binary) -> SandboxResult<PathBuf> {
        if let Some(bin_dir) = &self.config.bin_dir {
            let path = bin_dir.join(binary.name());
            if path.is_file() {
                return Ok(path);
            }

            return Err(executable_not_found(binary));
        }

        which::which(binary.name()).map_err(|_| executable_not_found(binary))
    }

    /// Runs `invocation` to completion and returns its output, stdout and stderr
    /// interleaved as written.
    ///
    /// A nonzero exit fails with [`ErrorKind::CommandFailed`], whose detail holds the
    /// command line and the captured output.
    pub async fn run(&self, invocation: Invocation) -> SandboxResult<String> {
        let (reader, writer) = io::pipe()?;
        let mut command = self.command(&invocation)?;
        command
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);

        debug!(command = %invocation, "running command");

        let mut child = command
            .spawn()
            .map_err(|err| spawn_error(invocation.binary, err))?;
        // The command holds the write ends; the reader only sees EOF once they are closed.
        drop(command);

        let reading = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut output = Vec::new();
            reader.read_to_end(&mut output).map(|_| output)
        });

        let status = child.wait().await?;
        let output = reading.await??;
        let output = String::from_utf8_lossy(&output).into_owned();

        if !status.success() {
            bail!(
                ErrorKind::CommandFailed,
                "Command exited unsuccessfully",
                format!("command failed: {invocation}\nOUTPUT:\n{output}")
            );
        }

        Ok(output)
    }

    /// Spawns `invocation` as a long-running child with piped output.
    ///
    /// The child is killed if its handle is dropped without being waited on.
    pub fn spawn(&self, invocation: &Invocation) -> SandboxResult<Child> {
        let mut command = self.command(invocation)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %invocation, "spawning process");

        command
            .spawn()
            .map_err(|err| spawn_error(invocation.binary, err))
    }

    fn command(&self, invocation: &Invocation) -> SandboxResult<Command> {
        let program = self.resolve(invocation.binary)?;

        let mut command = Command::new(program);
        command.args(&invocation.args);

        if let Some(password) = &self.config.password {
            command.env(PASSWORD_ENV, password.expose_secret());
        }
        for (key, value) in &invocation.envs {
            command.env(key, value);
        }

        Ok(command)
    }
}

fn executable_not_found(binary: Binary) -> SandboxError {
    sandbox_error!(
        ErrorKind::ExecutableNotFound,
        "PostgreSQL executable not found",
        format!(
            "`{binary}` could not be found. Add the PostgreSQL bin directory to PATH \
             (e.g. PATH=/usr/lib/postgresql/<version>/bin:$PATH) or set PGSANDBOX_BIN_DIR."
        )
    )
}

fn spawn_error(binary: Binary, err: io::Error) -> SandboxError {
    if err.kind() == io::ErrorKind::NotFound {
        return executable_not_found(binary).with_source(err);
    }

    sandbox_error!(
        ErrorKind::IoError,
        "Failed to spawn process",
        format!("`{binary}`: {err}"),
        source: err
    )
}
