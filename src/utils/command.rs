// sitebackup/src/utils/command.rs
//! Process execution for pipeline stages, locally or over SSH.
//!
//! Commands are always described as argument vectors. The SSH transport is the
//! only place where words are joined into a shell line, and it escapes each
//! word on its own.

use chrono::Local;
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;
use which::which;

use crate::errors::CommandError;

/// Login and address of a host reached over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    /// `user@host`, as understood by ssh and rsync.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote(SshTarget),
}

/// One program execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub target: Target,
    pub program: String,
    pub args: Vec<OsString>,
    /// When set, standard output is written to this file instead of the run log.
    pub stdout: Option<PathBuf>,
}

impl Invocation {
    pub fn local<I, A>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Invocation {
            target: Target::Local,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdout: None,
        }
    }

    pub fn remote<I, A>(host: SshTarget, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Invocation {
            target: Target::Remote(host),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdout: None,
        }
    }

    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }
}

/// Append-only diagnostic log shared by every command of a run.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self, CommandError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| CommandError::Log {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(RunLog {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a timestamped line.
    pub fn note(&self, message: &str) -> Result<(), CommandError> {
        let line = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        (&self.file)
            .write_all(line.as_bytes())
            .map_err(|source| self.log_error(source))
    }

    /// A fresh handle for a child's stdout or stderr.
    pub fn writer(&self) -> Result<File, CommandError> {
        self.file.try_clone().map_err(|source| self.log_error(source))
    }

    fn log_error(&self, source: std::io::Error) -> CommandError {
        CommandError::Log {
            path: self.path.clone(),
            source,
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `invocation` to completion, sending its diagnostics to `log`.
    ///
    /// No retries happen at this layer.
    fn run(&self, invocation: &Invocation, log: &RunLog) -> Result<(), CommandError>;
}

/// Spawns local processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, invocation: &Invocation, log: &RunLog) -> Result<(), CommandError> {
        if let Target::Remote(_) = invocation.target {
            return Err(CommandError::RemoteUnsupported {
                program: invocation.program.clone(),
            });
        }

        let program = which(&invocation.program).map_err(|_| CommandError::NotFound {
            program: invocation.program.clone(),
        })?;

        let stdout: Stdio = match &invocation.stdout {
            Some(path) => File::create(path)
                .map_err(|source| CommandError::Spawn {
                    program: invocation.program.clone(),
                    source,
                })?
                .into(),
            None => log.writer()?.into(),
        };

        debug!("Running {} ({} args)", program.display(), invocation.args.len());
        let status = Command::new(&program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(log.writer()?)
            .status()
            .map_err(|source| CommandError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(CommandError::Exit {
                program: invocation.program.clone(),
                code: status.code(),
            })
        }
    }
}

/// Sends remote invocations through `ssh` and hands everything to `inner`.
#[derive(Debug, Clone)]
pub struct SshRunner<R: CommandRunner> {
    inner: R,
    ssh_bin: String,
    batch_mode: bool,
}

impl SshRunner<ProcessCommandRunner> {
    pub fn with_process_runner(ssh_bin: impl Into<String>, batch_mode: bool) -> Self {
        Self::new(ProcessCommandRunner, ssh_bin, batch_mode)
    }
}

impl<R: CommandRunner> SshRunner<R> {
    pub fn new(inner: R, ssh_bin: impl Into<String>, batch_mode: bool) -> Self {
        SshRunner {
            inner,
            ssh_bin: ssh_bin.into(),
            batch_mode,
        }
    }

    /// Local `ssh` invocation carrying `invocation` as its remote command.
    pub fn wrap(&self, host: &SshTarget, invocation: &Invocation) -> Invocation {
        let mut args = ssh_options(host.port, self.batch_mode);
        args.push(OsString::from(host.login()));
        args.push(OsString::from("--"));
        args.push(OsString::from(remote_command_line(
            &invocation.program,
            &invocation.args,
        )));
        Invocation {
            target: Target::Local,
            program: self.ssh_bin.clone(),
            args,
            stdout: invocation.stdout.clone(),
        }
    }
}

impl<R: CommandRunner> CommandRunner for SshRunner<R> {
    fn run(&self, invocation: &Invocation, log: &RunLog) -> Result<(), CommandError> {
        match &invocation.target {
            Target::Local => self.inner.run(invocation, log),
            Target::Remote(host) => self.inner.run(&self.wrap(host, invocation), log),
        }
    }
}

/// Options shared by direct ssh calls and rsync's `--rsh`.
pub fn ssh_options(port: u16, batch_mode: bool) -> Vec<OsString> {
    let mut args = vec![OsString::from("-p"), OsString::from(port.to_string())];
    if batch_mode {
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
    }
    args
}

/// `--rsh` value for rsync pulling from `host`.
pub fn rsync_remote_shell(ssh_bin: &str, port: u16, batch_mode: bool) -> String {
    let opts = ssh_options(port, batch_mode)
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} {}", ssh_bin, opts)
}

/// The remote shell sees one line; every word is quoted separately.
fn remote_command_line(program: &str, args: &[OsString]) -> String {
    std::iter::once(escape(Cow::Borrowed(program)).into_owned())
        .chain(
            args.iter()
                .map(|arg| escape(arg.to_string_lossy()).into_owned()),
        )
        .collect::<Vec<_>>()
        .join(" ")
}
