//! External engine subprocess.
//!
//! The engine is opaque: it receives the materialised subject directory,
//! writes results (or `_errors.json`) into it, prints diagnostics on stdout and
//! reports success through its exit status.

use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Result, SyncError};

/// How to launch the numerical engine over a materialised subject.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Command line for one run over `subject_dir`.
    fn command(&self, subject_dir: &Path) -> Command;

    /// Start the engine with stdout piped and stdin closed. A launch failure
    /// is reported as [`SyncError::EngineFailure`] without an exit code.
    fn spawn(&self, subject_dir: &Path) -> Result<EngineProcess> {
        let mut command = self.command(subject_dir);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| SyncError::EngineFailure {
            exit_code: None,
            message: format!("failed to start engine: {err}"),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::Internal("engine stdout was not captured".into()))?;
        debug!(pid = ?child.id(), dir = %subject_dir.display(), "engine started");

        Ok(EngineProcess {
            child,
            stdout: Some(BufReader::new(stdout).split(b'\n')),
        })
    }
}

/// A running engine with line-oriented access to its stdout.
///
/// Lines are raw bytes without the trailing `\n`; the engine may print
/// anything, valid UTF-8 or not.
pub struct EngineProcess {
    child: Child,
    stdout: Option<Split<BufReader<ChildStdout>>>,
}

impl fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineProcess")
            .field("pid", &self.child.id())
            .field("stdout_open", &self.stdout.is_some())
            .finish()
    }
}

impl EngineProcess {
    /// Next stdout line; `None` once stdout reaches EOF. Cancel safe.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(lines) = self.stdout.as_mut() else {
            return Ok(None);
        };
        match lines.next_segment().await? {
            Some(line) => Ok(Some(line)),
            None => {
                self.stdout = None;
                Ok(None)
            }
        }
    }

    /// False once stdout has reached EOF or been abandoned.
    pub fn stdout_open(&self) -> bool {
        self.stdout.is_some()
    }

    /// Stop reading stdout. Only safe once the child is gone or about to be
    /// killed, since a child writing into a full pipe blocks forever.
    pub fn close_stdout(&mut self) {
        self.stdout = None;
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Kill the child and reap it.
    pub async fn kill(&mut self) -> Result<()> {
        Ok(self.child.kill().await?)
    }
}

/// Runs `program [args..] <subject_dir> [--output-name N] [--href URL]`.
#[derive(Clone, Debug)]
pub struct SubprocessEngine {
    config: EngineConfig,
}

impl SubprocessEngine {
    /// Engine launched according to `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl Engine for SubprocessEngine {
    fn command(&self, subject_dir: &Path) -> Command {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args).arg(subject_dir);
        if let Some(name) = &self.config.output_name {
            command.arg("--output-name").arg(name);
        }
        if let Some(url) = &self.config.reference_url {
            command.arg("--href").arg(url);
        }
        command
    }
}
