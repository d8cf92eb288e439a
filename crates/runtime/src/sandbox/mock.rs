//! In-memory sandbox backend
//!
//! Functions are plain closures registered against an image name, and the
//! sandbox's standard streams are `tokio::io::duplex` pipes. Used by the test
//! suites and for exercising the coordinator without a container engine.

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{SandboxHandle, SandboxRuntime, SandboxStreams};
use crate::types::SandboxError;

const PIPE_CAPACITY: usize = 64 * 1024;

type Responder = Arc<dyn Fn(&[u8]) -> (Vec<u8>, i64) + Send + Sync>;

#[derive(Clone)]
enum Behavior {
    /// Read the whole event, then write the response and exit
    Respond(Responder),
    /// Exit immediately without reading input
    Exit { output: Bytes, code: i64 },
    /// Never produce output or exit
    Hang,
}

/// Lifecycle step at which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Create,
    Start,
    Attach,
    /// Writes to the sandbox's input fail with a connection reset
    Deliver,
    Wait,
    Remove,
}

impl MockStep {
    fn label(self) -> &'static str {
        match self {
            MockStep::Create => "create",
            MockStep::Start => "start",
            MockStep::Attach => "attach",
            MockStep::Deliver => "deliver",
            MockStep::Wait => "wait",
            MockStep::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Attached,
}

struct MockSandbox {
    behavior: Behavior,
    state: State,
    exit_tx: Option<watch::Sender<Option<i64>>>,
    exit_rx: watch::Receiver<Option<i64>>,
    task: Option<JoinHandle<()>>,
}

/// Sandbox backend whose functions are Rust closures
#[derive(Default)]
pub struct MockRuntime {
    images: DashMap<String, Behavior>,
    sandboxes: DashMap<String, MockSandbox>,
    failures: Mutex<HashSet<MockStep>>,
    last_command: Mutex<Vec<String>>,
    create_delay: Option<Duration>,
    next_id: AtomicU64,
    created: AtomicUsize,
    removed: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image whose function maps the full event to `(stdout, exit code)`
    pub fn with_function<F>(self, image: &str, respond: F) -> Self
    where
        F: Fn(&[u8]) -> (Vec<u8>, i64) + Send + Sync + 'static,
    {
        self.images
            .insert(image.to_string(), Behavior::Respond(Arc::new(respond)));
        self
    }

    /// Register an image that exits at once with fixed output, ignoring its input
    pub fn with_exit(self, image: &str, output: impl Into<Bytes>, code: i64) -> Self {
        self.images.insert(
            image.to_string(),
            Behavior::Exit {
                output: output.into(),
                code,
            },
        );
        self
    }

    /// Register an image whose function never finishes
    pub fn with_hanging(self, image: &str) -> Self {
        self.images.insert(image.to_string(), Behavior::Hang);
        self
    }

    /// Make every call of `step` fail
    pub fn fail_on(self, step: MockStep) -> Self {
        self.failures.lock().insert(step);
        self
    }

    /// Make every `create` take `delay` before the sandbox exists
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Number of sandboxes created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of sandboxes removed so far
    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    /// Number of sandboxes that exist right now
    pub fn live(&self) -> usize {
        self.sandboxes.len()
    }

    /// Command passed to the most recent `create`
    pub fn last_command(&self) -> Vec<String> {
        self.last_command.lock().clone()
    }

    fn fails(&self, step: MockStep) -> bool {
        self.failures.lock().contains(&step)
    }

    fn check(&self, step: MockStep) -> Result<(), SandboxError> {
        if self.fails(step) {
            return Err(SandboxError::operation(step.label(), "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, image: &str, command: &[String]) -> Result<SandboxHandle, SandboxError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.check(MockStep::Create)?;

        let behavior = self
            .images
            .get(image)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SandboxError::ImageNotFound(image.to_string()))?;

        let backend_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (exit_tx, exit_rx) = watch::channel(None);
        self.sandboxes.insert(
            backend_id.clone(),
            MockSandbox {
                behavior,
                state: State::Created,
                exit_tx: Some(exit_tx),
                exit_rx,
                task: None,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_command.lock() = command.to_vec();

        Ok(SandboxHandle::new(backend_id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.check(MockStep::Start)?;

        let mut sandbox = self
            .sandboxes
            .get_mut(&handle.backend_id)
            .ok_or(SandboxError::NotFound { id: handle.id })?;
        if sandbox.state != State::Created {
            return Err(SandboxError::InvalidState {
                id: handle.id,
                operation: "start",
            });
        }
        sandbox.state = State::Running;
        Ok(())
    }

    async fn attach(&self, handle: &SandboxHandle) -> Result<SandboxStreams, SandboxError> {
        self.check(MockStep::Attach)?;

        let mut sandbox = self
            .sandboxes
            .get_mut(&handle.backend_id)
            .ok_or(SandboxError::NotFound { id: handle.id })?;
        let invalid = SandboxError::InvalidState {
            id: handle.id,
            operation: "attach",
        };
        if sandbox.state != State::Running {
            return Err(invalid);
        }
        let exit_tx = sandbox.exit_tx.take().ok_or(invalid)?;

        let (input, mut function_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut function_stdout, output) = tokio::io::duplex(PIPE_CAPACITY);
        let behavior = sandbox.behavior.clone();

        let task = tokio::spawn(async move {
            match behavior {
                Behavior::Respond(respond) => {
                    let mut event = Vec::new();
                    if function_stdin.read_to_end(&mut event).await.is_err() {
                        return;
                    }
                    let (response, code) = respond(&event);
                    let _ = function_stdout.write_all(&response).await;
                    drop(function_stdout);
                    let _ = exit_tx.send(Some(code));
                }
                Behavior::Exit { output, code } => {
                    drop(function_stdin);
                    let _ = function_stdout.write_all(&output).await;
                    drop(function_stdout);
                    let _ = exit_tx.send(Some(code));
                }
                Behavior::Hang => {
                    let _held = (function_stdin, function_stdout, exit_tx);
                    std::future::pending::<()>().await;
                }
            }
        });

        sandbox.task = Some(task);
        sandbox.state = State::Attached;

        let input: Pin<Box<dyn AsyncWrite + Send>> = if self.fails(MockStep::Deliver) {
            Box::pin(ResetInput)
        } else {
            Box::pin(input)
        };

        Ok(SandboxStreams {
            input,
            output: Box::pin(output),
        })
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        self.check(MockStep::Wait)?;

        let mut exit_rx = self
            .sandboxes
            .get(&handle.backend_id)
            .map(|sandbox| sandbox.exit_rx.clone())
            .ok_or(SandboxError::NotFound { id: handle.id })?;

        let status = exit_rx
            .wait_for(Option::is_some)
            .await
            .map(|status| *status)
            .map_err(|_| SandboxError::operation("wait", "sandbox ended without an exit status"))?;

        status.ok_or_else(|| SandboxError::operation("wait", "sandbox ended without an exit status"))
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.check(MockStep::Remove)?;

        if let Some((_, sandbox)) = self.sandboxes.remove(&handle.backend_id) {
            if let Some(task) = sandbox.task {
                task.abort();
            }
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Input side of a sandbox whose connection was reset
struct ResetInput;

impl AsyncWrite for ResetInput {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "sandbox input reset",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
