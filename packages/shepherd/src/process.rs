use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;

use shepherd_error::ShepherdError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How to launch a child process.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub dir: Option<PathBuf>,
    /// Environment additions applied on top of the inherited (or cleared)
    /// environment.
    pub env: HashMap<String, String>,
    /// Inherit nothing from the parent environment before applying `env`.
    pub clear_env: bool,
}

/// Handle to a live child process.
///
/// The handle owns the child's stdio; callers take the streams they want and
/// typically tee the output into the parent's own stdout. Liveness is
/// observed lazily (`alive`, `wait`); a crashed child is never restarted.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    child: Arc<tokio::sync::Mutex<Child>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    stdout: Arc<Mutex<Option<ChildStdout>>>,
    stderr: Arc<Mutex<Option<ChildStderr>>>,
}

impl ChildHandle {
    /// Spawn the process described by `spec`. A launch failure surfaces to
    /// the caller; nothing is tracked for a process that never started.
    pub fn spawn(spec: SpawnSpec) -> Result<Self, ShepherdError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| ShepherdError::invalid_request("empty agent command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.dir {
            command.current_dir(dir);
        }
        if spec.clear_env {
            command.env_clear();
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|error| {
            tracing::error!(command = %program, error = %error, "failed to spawn agent process");
            ShepherdError::Spawn {
                command: program.clone(),
                error,
            }
        })?;
        tracing::info!(command = %program, pid = child.id(), "agent process spawned");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(Self {
            child: Arc::new(tokio::sync::Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
        })
    }

    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Start two background readers that copy the child's stdout and stderr
    /// lines to the parent's own output, annotated with the given label.
    pub fn tee_output(&self, label: &str) {
        if let Some(stdout) = self.stdout.lock().ok().and_then(|mut slot| slot.take()) {
            spawn_tee(stdout, label.to_string(), "stdout");
        }
        if let Some(stderr) = self.stderr.lock().ok().and_then(|mut slot| slot.take()) {
            spawn_tee(stderr, label.to_string(), "stderr");
        }
    }

    /// Whether the process is still running.
    pub async fn alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub async fn wait(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut child = self.child.lock().await;
                match child.try_wait() {
                    Ok(Some(status)) => return Some(status),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to poll agent process");
                        return None;
                    }
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Wait up to `timeout`, then force-kill if the process is still alive.
    /// Safe to call repeatedly.
    pub async fn terminate(&self, timeout: Duration) {
        if self.wait(timeout).await.is_some() {
            return;
        }
        tracing::warn!("agent process did not exit in time, killing");
        let mut child = self.child.lock().await;
        if let Err(err) = child.kill().await {
            tracing::warn!(error = %err, "failed to kill agent process");
        }
    }
}

fn spawn_tee<R>(stream: R, label: String, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(agent = %label, stream = name, "{line}");
        }
    });
}
