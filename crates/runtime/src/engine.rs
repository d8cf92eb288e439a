//! Execution engine
//!
//! Runs one invocation end to end: create a sandbox from the function's
//! image, stream the event into it, capture its output, wait for it to exit
//! and remove it. Removal is attempted on every exit path, including the
//! invocation future being dropped.
//!
//! The deadline is measured from the start of [`ExecutionEngine::execute`] and
//! covers sandbox creation as well as the run.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::sandbox::{SandboxHandle, SandboxRuntime, SandboxStreams};
use crate::types::{ExecutionError, InvocationContext, InvocationRequest, SandboxError};

/// Deadline of one invocation: the configured bound and the instant it expires
type Deadline = Option<(Duration, Instant)>;

/// Default cap on captured function output (10 MB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Drives sandboxes through their lifecycle for individual invocations
pub struct ExecutionEngine {
    runtime: Arc<dyn SandboxRuntime>,
    entry_command: Vec<String>,
    max_output_bytes: usize,
}

impl ExecutionEngine {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, entry_command: Vec<String>) -> Self {
        Self {
            runtime,
            entry_command,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Execute one invocation and return the function's output.
    ///
    /// Exit code 0 is success. Any other exit code, the deadline expiring or
    /// the context being cancelled is a failure, and partial output is never
    /// returned as success.
    pub async fn execute(
        &self,
        request: &InvocationRequest,
        ctx: &InvocationContext,
    ) -> Result<Bytes, ExecutionError> {
        let function = request.function.name();
        let started = Instant::now();
        let deadline: Deadline = ctx.deadline.map(|after| (after, started + after));

        let handle = self
            .create_sandbox(function, request.function.image(), ctx, deadline)
            .await;
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(function, phase = %e.phase(), "{}", e);
                return Err(e);
            }
        };
        tracing::debug!(
            function,
            sandbox = %handle.id,
            backend = self.runtime.name(),
            "Sandbox created"
        );

        let lease = SandboxLease::new(self.runtime.clone(), handle.clone(), function);
        let outcome = self
            .run(function, &handle, &request.event, ctx, deadline)
            .await;
        lease.release().await;

        match &outcome {
            Ok(output) => tracing::info!(
                function,
                sandbox = %handle.id,
                output_bytes = output.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Function executed"
            ),
            Err(e) => tracing::error!(
                function,
                sandbox = %handle.id,
                phase = %e.phase(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{}",
                e
            ),
        }

        outcome
    }

    /// Create the sandbox, racing the backend against the deadline and the
    /// cancellation token.
    ///
    /// The backend call runs in its own task, so a sandbox that only appears
    /// after the race was lost is still removed once it lands.
    async fn create_sandbox(
        &self,
        function: &str,
        image: &str,
        ctx: &InvocationContext,
        deadline: Deadline,
    ) -> Result<SandboxHandle, ExecutionError> {
        if ctx.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled {
                function: function.to_string(),
                sandbox: None,
            });
        }

        let mut pending = PendingCreate::spawn(
            self.runtime.clone(),
            image,
            self.entry_command.clone(),
            function,
        );
        let expired = async {
            match deadline {
                Some((after, at)) => {
                    tokio::time::sleep_until(at).await;
                    after
                }
                None => std::future::pending().await,
            }
        };

        let created = tokio::select! {
            created = pending.finish() => created.map_err(|source| ExecutionError::SandboxCreate {
                function: function.to_string(),
                source,
            }),
            _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled {
                function: function.to_string(),
                sandbox: None,
            }),
            after = expired => Err(ExecutionError::Timeout {
                function: function.to_string(),
                sandbox: None,
                after,
            }),
        };
        created
    }

    /// Race the sandbox's run against the deadline and the cancellation token
    async fn run(
        &self,
        function: &str,
        handle: &SandboxHandle,
        event: &Bytes,
        ctx: &InvocationContext,
        deadline: Deadline,
    ) -> Result<Bytes, ExecutionError> {
        let bounded = async {
            match deadline {
                Some((after, at)) => tokio::time::timeout_at(at, self.drive(function, handle, event))
                    .await
                    .map_err(|_| ExecutionError::Timeout {
                        function: function.to_string(),
                        sandbox: Some(handle.id),
                        after,
                    })?,
                None => self.drive(function, handle, event).await,
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled {
                function: function.to_string(),
                sandbox: Some(handle.id),
            }),
        }
    }

    /// Start, attach, then deliver/capture/wait concurrently
    async fn drive(
        &self,
        function: &str,
        handle: &SandboxHandle,
        event: &Bytes,
    ) -> Result<Bytes, ExecutionError> {
        self.runtime
            .start(handle)
            .await
            .map_err(|source| ExecutionError::SandboxStart {
                function: function.to_string(),
                sandbox: handle.id,
                source,
            })?;

        let SandboxStreams { input, output } =
            self.runtime
                .attach(handle)
                .await
                .map_err(|source| ExecutionError::SandboxAttach {
                    function: function.to_string(),
                    sandbox: handle.id,
                    source,
                })?;

        // Output is read while the event is still being written, so a function
        // that answers before draining its input cannot deadlock us.
        let (_, output, code) = tokio::try_join!(
            async {
                deliver_event(input, event)
                    .await
                    .map_err(|source| ExecutionError::EventDelivery {
                        function: function.to_string(),
                        sandbox: handle.id,
                        source,
                    })
            },
            async {
                capture_output(output, self.max_output_bytes)
                    .await
                    .map_err(|source| ExecutionError::OutputRead {
                        function: function.to_string(),
                        sandbox: handle.id,
                        source,
                    })
            },
            async {
                self.runtime
                    .wait(handle)
                    .await
                    .map_err(|source| ExecutionError::SandboxWait {
                        function: function.to_string(),
                        sandbox: handle.id,
                        source,
                    })
            },
        )?;

        if code == 0 {
            Ok(output)
        } else {
            Err(ExecutionError::FunctionExit {
                function: function.to_string(),
                sandbox: handle.id,
                code,
                output,
            })
        }
    }
}

/// Write the whole event and signal end-of-input.
///
/// A sandbox that closes its input early produces a broken pipe here; its exit
/// status decides the outcome instead.
async fn deliver_event(mut input: Pin<Box<dyn AsyncWrite + Send>>, event: &[u8]) -> io::Result<()> {
    let written = async {
        input.write_all(event).await?;
        input.shutdown().await
    }
    .await;

    match written {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!("Sandbox closed its input before the whole event was written");
            Ok(())
        }
        other => other,
    }
}

/// Read output until end-of-stream, failing once it exceeds `limit` bytes
async fn capture_output(output: Pin<Box<dyn AsyncRead + Send>>, limit: usize) -> io::Result<Bytes> {
    let mut buf = Vec::new();
    output
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await?;

    if buf.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("output exceeds {} bytes", limit),
        ));
    }
    Ok(Bytes::from(buf))
}

/// A backend `create` running in its own task.
///
/// Dropped before the task finished (the invocation gave up on it), it hands
/// the task to a continuation that removes the sandbox if one is created.
struct PendingCreate {
    task: Option<JoinHandle<Result<SandboxHandle, SandboxError>>>,
    runtime: Arc<dyn SandboxRuntime>,
    function: String,
}

impl PendingCreate {
    fn spawn(
        runtime: Arc<dyn SandboxRuntime>,
        image: &str,
        command: Vec<String>,
        function: &str,
    ) -> Self {
        let task = {
            let runtime = runtime.clone();
            let image = image.to_string();
            tokio::spawn(async move { runtime.create(&image, &command).await })
        };

        Self {
            task: Some(task),
            runtime,
            function: function.to_string(),
        }
    }

    /// Wait for the backend call. Cancel safe: if this future is dropped the
    /// task stays pending and is cleaned up when `self` is dropped.
    async fn finish(&mut self) -> Result<SandboxHandle, SandboxError> {
        let Some(task) = self.task.as_mut() else {
            return Err(SandboxError::operation("create", "already finished"));
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|e| SandboxError::operation("create", e))?
    }
}

impl Drop for PendingCreate {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = self.runtime.clone();
                let function = std::mem::take(&mut self.function);
                rt.spawn(async move {
                    if let Ok(Ok(handle)) = task.await {
                        tracing::debug!(
                            function = %function,
                            sandbox = %handle.id,
                            "Sandbox created after its invocation was abandoned"
                        );
                        remove_sandbox(runtime.as_ref(), &handle, &function).await;
                    }
                });
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    function = %self.function,
                    "No async runtime available, abandoned sandbox creation was aborted"
                );
            }
        }
    }
}

/// Removal obligation for one sandbox.
///
/// `release` removes the sandbox in line. A lease dropped without release
/// (the invocation future was cancelled) schedules removal on the current
/// runtime instead.
struct SandboxLease {
    runtime: Arc<dyn SandboxRuntime>,
    handle: Option<SandboxHandle>,
    function: String,
}

impl SandboxLease {
    fn new(runtime: Arc<dyn SandboxRuntime>, handle: SandboxHandle, function: &str) -> Self {
        Self {
            runtime,
            handle: Some(handle),
            function: function.to_string(),
        }
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            remove_sandbox(self.runtime.as_ref(), &handle, &self.function).await;
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = self.runtime.clone();
                let function = std::mem::take(&mut self.function);
                rt.spawn(async move {
                    remove_sandbox(runtime.as_ref(), &handle, &function).await;
                });
            }
            Err(_) => tracing::warn!(
                function = %self.function,
                sandbox = %handle.id,
                "No async runtime available, sandbox {} was not removed",
                handle.backend_id
            ),
        }
    }
}

async fn remove_sandbox(runtime: &dyn SandboxRuntime, handle: &SandboxHandle, function: &str) {
    match runtime.remove(handle).await {
        Ok(()) => tracing::debug!(function, sandbox = %handle.id, "Sandbox removed"),
        Err(e) => tracing::warn!(
            function,
            sandbox = %handle.id,
            "Failed to remove sandbox: {}",
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{MockRuntime, MockStep};
    use crate::types::{ExecutionPhase, FunctionSpec};
    use tokio_util::sync::CancellationToken;

    fn request(image: &str, event: impl Into<Bytes>) -> InvocationRequest {
        InvocationRequest::new(FunctionSpec::new("test-fn", image, "go").unwrap(), event)
    }

    fn engine(mock: &Arc<MockRuntime>) -> ExecutionEngine {
        ExecutionEngine::new(mock.clone(), vec!["/app/function".to_string()])
    }

    fn greeter() -> MockRuntime {
        MockRuntime::new().with_function("greeter", |event| {
            let mut out = b"Hey, ".to_vec();
            out.extend_from_slice(event);
            (out, 0)
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let mock = Arc::new(greeter());
        let output = engine(&mock)
            .execute(&request("greeter", "world"), &InvocationContext::new())
            .await
            .unwrap();

        assert_eq!(output, Bytes::from_static(b"Hey, world"));
        assert_eq!(mock.last_command(), vec!["/app/function".to_string()]);
        assert_eq!(mock.created(), 1);
        assert_eq!(mock.live(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let mock = Arc::new(MockRuntime::new().with_exit("crasher", "partial", 1));
        let err = engine(&mock)
            .execute(&request("crasher", "{}"), &InvocationContext::new())
            .await
            .unwrap_err();

        match err {
            ExecutionError::FunctionExit { code, output, .. } => {
                assert_eq!(code, 1);
                assert_eq!(output, Bytes::from_static(b"partial"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.live(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_needs_no_cleanup() {
        let mock = Arc::new(greeter());
        let err = engine(&mock)
            .execute(&request("unknown-image", "{}"), &InvocationContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), ExecutionPhase::Create);
        assert!(matches!(
            err,
            ExecutionError::SandboxCreate {
                source: SandboxError::ImageNotFound(_),
                ..
            }
        ));
        assert_eq!(mock.removed(), 0);
    }

    #[tokio::test]
    async fn test_failures_after_create_still_clean_up() {
        for (step, phase) in [
            (MockStep::Start, ExecutionPhase::Start),
            (MockStep::Attach, ExecutionPhase::Attach),
            (MockStep::Wait, ExecutionPhase::Wait),
        ] {
            let mock = Arc::new(greeter().fail_on(step));
            let err = engine(&mock)
                .execute(&request("greeter", "x"), &InvocationContext::new())
                .await
                .unwrap_err();

            assert_eq!(err.phase(), phase);
            assert!(err.sandbox().is_some());
            assert_eq!(mock.live(), 0, "sandbox leaked after {phase} failure");
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_sandbox() {
        let mock = Arc::new(MockRuntime::new().with_hanging("sleeper"));
        let ctx = InvocationContext::new().with_deadline(Duration::from_millis(100));

        let started = Instant::now();
        let err = engine(&mock)
            .execute(&request("sleeper", "{}"), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Timeout { .. }));
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(mock.live(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_removes_sandbox() {
        let mock = Arc::new(MockRuntime::new().with_hanging("sleeper"));
        let cancel = CancellationToken::new();
        let ctx = InvocationContext::new().with_cancellation(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = engine(&mock)
            .execute(&request("sleeper", "{}"), &ctx)
            .await
            .unwrap_err();
        trigger.await.unwrap();

        assert!(matches!(err, ExecutionError::Cancelled { .. }));
        assert_eq!(mock.live(), 0);
    }

    #[tokio::test]
    async fn test_dropped_invocation_still_removes_sandbox() {
        let mock = Arc::new(MockRuntime::new().with_hanging("sleeper"));
        let engine = Arc::new(engine(&mock));

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(&request("sleeper", "{}"), &InvocationContext::new())
                    .await
            })
        };

        wait_until(|| mock.live() == 1).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        wait_until(|| mock.live() == 0).await;
        assert_eq!(mock.removed(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_success() {
        let mock = Arc::new(greeter().fail_on(MockStep::Remove));
        let output = engine(&mock)
            .execute(&request("greeter", "you"), &InvocationContext::new())
            .await
            .unwrap();

        assert_eq!(output, Bytes::from_static(b"Hey, you"));
        assert_eq!(mock.live(), 1);
    }

    #[tokio::test]
    async fn test_early_input_close_is_not_a_delivery_failure() {
        let mock = Arc::new(MockRuntime::new().with_exit("impatient", "done", 0));
        let event = vec![b'x'; 1024 * 1024];

        let output = engine(&mock)
            .execute(&request("impatient", event), &InvocationContext::new())
            .await
            .unwrap();
        assert_eq!(output, Bytes::from_static(b"done"));
    }

    #[tokio::test]
    async fn test_output_limit() {
        let mock = Arc::new(MockRuntime::new().with_function("chatty", |_| (vec![b'y'; 4096], 0)));
        let err = engine(&mock)
            .with_max_output_bytes(1024)
            .execute(&request("chatty", "{}"), &InvocationContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), ExecutionPhase::Read);
        assert_eq!(mock.live(), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_removes_sandbox() {
        let mock = Arc::new(
            MockRuntime::new()
                .with_hanging("sleeper")
                .fail_on(MockStep::Deliver),
        );
        let err = engine(&mock)
            .execute(&request("sleeper", "{}"), &InvocationContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), ExecutionPhase::Deliver);
        assert!(matches!(
            err,
            ExecutionError::EventDelivery { ref source, .. }
                if source.kind() == io::ErrorKind::ConnectionReset
        ));
        assert_eq!(mock.live(), 0);
    }

    #[tokio::test]
    async fn test_deadline_covers_slow_create() {
        let mock = Arc::new(greeter().with_create_delay(Duration::from_secs(1)));
        let ctx = InvocationContext::new().with_deadline(Duration::from_millis(100));

        let started = Instant::now();
        let err = engine(&mock)
            .execute(&request("greeter", "{}"), &ctx)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(err, ExecutionError::Timeout { sandbox: None, .. }));
        assert_eq!(err.phase(), ExecutionPhase::Create);

        // The sandbox that lands late is removed
        wait_until(|| mock.created() == 1 && mock.live() == 0).await;
        assert_eq!(mock.removed(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_create() {
        let mock = Arc::new(greeter().with_create_delay(Duration::from_secs(1)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = InvocationContext::new().with_cancellation(cancel);

        let started = Instant::now();
        let err = engine(&mock)
            .execute(&request("greeter", "{}"), &ctx)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(err, ExecutionError::Cancelled { sandbox: None, .. }));
        assert_eq!(mock.created(), 0);
        assert_eq!(mock.live(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_during_create() {
        let mock = Arc::new(greeter().with_create_delay(Duration::from_millis(500)));
        let cancel = CancellationToken::new();
        let ctx = InvocationContext::new().with_cancellation(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = engine(&mock)
            .execute(&request("greeter", "{}"), &ctx)
            .await
            .unwrap_err();
        trigger.await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(err, ExecutionError::Cancelled { sandbox: None, .. }));

        wait_until(|| mock.created() == 1 && mock.live() == 0).await;
    }

    #[tokio::test]
    async fn test_dropped_during_create_still_removes_sandbox() {
        let mock = Arc::new(greeter().with_create_delay(Duration::from_millis(200)));
        let engine = Arc::new(engine(&mock));

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(&request("greeter", "{}"), &InvocationContext::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(mock.created(), 0);

        wait_until(|| mock.created() == 1 && mock.live() == 0).await;
        assert_eq!(mock.removed(), 1);
    }
}
