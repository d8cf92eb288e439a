//! Subprocess sandbox backend
//!
//! Runs a function's "image" as a local executable: the image reference is
//! the path of the program and its standard streams become the sandbox's
//! channels. There is no isolation whatsoever, so this backend is meant for
//! development machines and tests only.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use super::{SandboxHandle, SandboxRuntime, SandboxStreams};
use crate::config::ProcessConfig;
use crate::types::SandboxError;

enum ProcessState {
    Created,
    Running {
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        exit_rx: watch::Receiver<Option<i64>>,
        // Dropping the sender kills the child
        _kill: oneshot::Sender<()>,
    },
}

struct ProcessSandbox {
    program: PathBuf,
    state: ProcessState,
}

/// Sandbox backend that spawns local processes
pub struct ProcessRuntime {
    config: ProcessConfig,
    sandboxes: DashMap<String, ProcessSandbox>,
    next_id: AtomicU64,
}

impl ProcessRuntime {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            sandboxes: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of sandboxes not yet removed
    pub fn live_sandboxes(&self) -> usize {
        self.sandboxes.len()
    }

    fn spawn(&self, handle: &SandboxHandle, program: &Path) -> Result<ProcessState, SandboxError> {
        let mut command = Command::new(program);
        if let Some(dir) = &self.config.working_directory {
            command.current_dir(dir);
        }
        command.envs(&self.config.environment);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::operation("start", format!("{}: {}", program.display(), e)))?;

        let pid = child.id().unwrap_or_default();
        tracing::debug!(sandbox = %handle.id, pid, "Started function process");

        if let Some(stderr) = child.stderr.take() {
            let sandbox = handle.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%sandbox, "function stderr: {}", line);
                }
            });
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let sandbox = handle.id;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(%sandbox, "Failed to kill function process: {}", e);
                    }
                    child.wait().await
                }
            };

            match status {
                Ok(status) => {
                    let _ = exit_tx.send(Some(exit_code(status)));
                }
                Err(e) => tracing::warn!(%sandbox, "Failed to reap function process: {}", e),
            }
        });

        Ok(ProcessState::Running {
            stdin,
            stdout,
            exit_rx,
            _kill: kill_tx,
        })
    }
}

/// Exit code of a finished process; signal deaths follow the shell's 128+N convention
fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }

    -1
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(&self, image: &str, _command: &[String]) -> Result<SandboxHandle, SandboxError> {
        let program = PathBuf::from(image);
        match tokio::fs::metadata(&program).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return Err(SandboxError::ImageNotFound(image.to_string())),
        }

        let backend_id = format!("proc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sandboxes.insert(
            backend_id.clone(),
            ProcessSandbox {
                program,
                state: ProcessState::Created,
            },
        );

        Ok(SandboxHandle::new(backend_id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let mut sandbox = self
            .sandboxes
            .get_mut(&handle.backend_id)
            .ok_or(SandboxError::NotFound { id: handle.id })?;
        if !matches!(sandbox.state, ProcessState::Created) {
            return Err(SandboxError::InvalidState {
                id: handle.id,
                operation: "start",
            });
        }

        let program = sandbox.program.clone();
        sandbox.state = self.spawn(handle, &program)?;
        Ok(())
    }

    async fn attach(&self, handle: &SandboxHandle) -> Result<SandboxStreams, SandboxError> {
        let mut sandbox = self
            .sandboxes
            .get_mut(&handle.backend_id)
            .ok_or(SandboxError::NotFound { id: handle.id })?;

        let ProcessState::Running { stdin, stdout, .. } = &mut sandbox.state else {
            return Err(SandboxError::InvalidState {
                id: handle.id,
                operation: "attach",
            });
        };

        match (stdin.take(), stdout.take()) {
            (Some(input), Some(output)) => Ok(SandboxStreams {
                input: Box::pin(input),
                output: Box::pin(output),
            }),
            _ => Err(SandboxError::InvalidState {
                id: handle.id,
                operation: "attach",
            }),
        }
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        let mut exit_rx = {
            let sandbox = self
                .sandboxes
                .get(&handle.backend_id)
                .ok_or(SandboxError::NotFound { id: handle.id })?;
            match &sandbox.state {
                ProcessState::Running { exit_rx, .. } => exit_rx.clone(),
                ProcessState::Created => {
                    return Err(SandboxError::InvalidState {
                        id: handle.id,
                        operation: "wait",
                    })
                }
            }
        };

        let status = exit_rx
            .wait_for(Option::is_some)
            .await
            .map(|status| *status)
            .map_err(|_| SandboxError::operation("wait", "process exit status was lost"))?;

        status.ok_or_else(|| SandboxError::operation("wait", "process exit status was lost"))
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if self.sandboxes.remove(&handle.backend_id).is_some() {
            tracing::debug!(sandbox = %handle.id, "Removed function process");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn runtime() -> ProcessRuntime {
        ProcessRuntime::new(ProcessConfig::default())
    }

    #[tokio::test]
    #[serial]
    async fn test_cat_echoes_input() {
        let runtime = runtime();
        let handle = runtime.create("/bin/cat", &["/app/function".to_string()]).await.unwrap();
        runtime.start(&handle).await.unwrap();
        let mut streams = runtime.attach(&handle).await.unwrap();

        streams.input.write_all(b"{\"data\":\"x\"}").await.unwrap();
        streams.input.shutdown().await.unwrap();
        drop(streams.input);

        let mut output = Vec::new();
        streams.output.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"{\"data\":\"x\"}");
        assert_eq!(runtime.wait(&handle).await.unwrap(), 0);

        runtime.remove(&handle).await.unwrap();
        assert_eq!(runtime.live_sandboxes(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_nonzero_exit_code() {
        let runtime = runtime();
        let handle = runtime.create("/bin/false", &[]).await.unwrap();
        runtime.start(&handle).await.unwrap();
        assert_eq!(runtime.wait(&handle).await.unwrap(), 1);
        runtime.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_executable() {
        let err = runtime()
            .create("/definitely/not/here", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ImageNotFound(_)));
    }

    #[tokio::test]
    #[serial]
    async fn test_attach_twice_is_rejected() {
        let runtime = runtime();
        let handle = runtime.create("/bin/cat", &[]).await.unwrap();
        runtime.start(&handle).await.unwrap();
        let _streams = runtime.attach(&handle).await.unwrap();
        let err = runtime.attach(&handle).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { operation: "attach", .. }));
        runtime.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_remove_kills_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runtime = runtime();
        let handle = runtime.create(script.to_str().unwrap(), &[]).await.unwrap();
        runtime.start(&handle).await.unwrap();
        let mut streams = runtime.attach(&handle).await.unwrap();

        runtime.remove(&handle).await.unwrap();
        assert_eq!(runtime.live_sandboxes(), 0);

        // The killed process closes its stdout
        let mut output = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), streams.output.read_to_end(&mut output))
            .await
            .expect("process was not killed")
            .unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn test_exit_code_from_status() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
            assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
            assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        }
    }
}
