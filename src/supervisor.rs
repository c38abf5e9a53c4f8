//! Supervision of the single backend process
//!
//! The backend is started once and never restarted. Its stdout is read line by line
//! and fed to the readiness gate; its exit status becomes the proxy's own.

use crate::config::BackendConfig;
use crate::readiness::SharedGate;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for output readers to drain after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code used when the backend's real code can't be determined
pub const INDETERMINATE_EXIT_CODE: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("backend command is empty")]
    EmptyCommand,

    #[error("invalid backend command line: {0}")]
    InvalidCommand(#[from] shell_words::ParseError),

    #[error("failed to spawn backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for backend: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Handle to the running backend
pub struct BackendProcess {
    child: Child,
    pid: Option<u32>,
    output: Vec<JoinHandle<()>>,
}

impl BackendProcess {
    /// Spawn the backend and start watching its output.
    ///
    /// The proxy's environment is inherited; `[backend.env]` and `PORT` are added on top.
    pub fn spawn(config: &BackendConfig, gate: SharedGate) -> Result<Self, SupervisorError> {
        let (program, args) = config.argv()?;
        if program.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }

        info!(command = %program, ?args, port = config.port, "Starting backend");

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", config.port.to_string());

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, "Backend process spawned");

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            output.push(watch_output(stdout, OutputStream::Stdout, Some(gate.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            let gate = config.watch_stderr.then_some(gate);
            output.push(watch_output(stderr, OutputStream::Stderr, gate));
        }

        Ok(Self { child, pid, output })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the backend to exit and return its exit code.
    ///
    /// Cancel safe, so it can sit in a `select!` next to the shutdown signal.
    pub async fn wait(&mut self) -> Result<i32, SupervisorError> {
        let status = self.child.wait().await.map_err(SupervisorError::Wait)?;
        self.drain_output().await;
        let code = exit_code(status);
        info!(pid = self.pid, ?status, code, "Backend process exited");
        Ok(code)
    }

    /// Stop the backend: SIGTERM, then SIGKILL once the grace period runs out
    pub async fn terminate(mut self, grace_period: Duration) -> i32 {
        if let Some(pid) = self.child.id() {
            info!(pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.start_kill();
            }
        }

        let code = match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Backend process exited gracefully");
                exit_code(status)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for backend to exit");
                INDETERMINATE_EXIT_CODE
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = self.child.kill().await;
                INDETERMINATE_EXIT_CODE
            }
        };

        self.drain_output().await;
        code
    }

    async fn drain_output(&mut self) {
        for handle in self.output.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await.is_err() {
                debug!("Backend output still open after exit, detaching reader");
            }
        }
    }
}

/// Exit code of a finished process, or 1 when it was killed by a signal
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(INDETERMINATE_EXIT_CODE)
}

/// Forward each output line to the log and, if given, to the readiness gate
fn watch_output<R>(reader: R, stream: OutputStream, gate: Option<SharedGate>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);

                    match stream {
                        OutputStream::Stdout => info!(target: "backend", "{}", line),
                        OutputStream::Stderr => warn!(target: "backend", "{}", line),
                    }

                    if let Some(gate) = &gate {
                        gate.observe(line);
                    }
                }
                Err(e) => {
                    debug!(?stream, error = %e, "Error reading backend output");
                    break;
                }
            }
        }
    })
}
