//! Sandbox abstraction layer for function execution
//!
//! A sandbox is an isolated, single-use execution unit created from a function
//! image. Backends expose the five lifecycle steps the execution engine drives
//! (create, start, attach, wait, remove) and know nothing about functions,
//! deadlines or HTTP.

#[cfg(feature = "docker")]
pub mod docker;
pub mod mock;
pub mod process;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{SandboxBackend, SandboxConfig};
use crate::types::{SandboxError, SandboxId};

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use mock::{MockRuntime, MockStep};
pub use process::ProcessRuntime;

/// Reference to a created sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    /// Platform-side identifier, used in logs and errors
    pub id: SandboxId,
    /// Identifier the backend uses for the underlying resource (container id, pid, ...)
    pub backend_id: String,
}

impl SandboxHandle {
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            id: SandboxId::new(),
            backend_id: backend_id.into(),
        }
    }
}

/// The two byte channels of an attached sandbox.
///
/// Dropping or shutting down `input` signals end-of-input to the function.
/// `output` carries standard output only; backends route diagnostics
/// (stderr) to the log instead.
pub struct SandboxStreams {
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: Pin<Box<dyn AsyncRead + Send>>,
}

impl std::fmt::Debug for SandboxStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxStreams").finish_non_exhaustive()
    }
}

/// Sandbox lifecycle operations provided by a backend
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Create a stopped sandbox from `image` that will run `command` when started
    async fn create(&self, image: &str, command: &[String]) -> Result<SandboxHandle, SandboxError>;

    /// Start a created sandbox
    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Obtain the sandbox's input and output channels. Called at most once per sandbox.
    async fn attach(&self, handle: &SandboxHandle) -> Result<SandboxStreams, SandboxError>;

    /// Block until the sandbox is no longer running and return its exit code
    async fn wait(&self, handle: &SandboxHandle) -> Result<i64, SandboxError>;

    /// Forcibly remove the sandbox, stopping it if needed. Removing an
    /// already-removed sandbox succeeds.
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// Build the backend selected by configuration
pub fn connect(config: &SandboxConfig) -> Result<Arc<dyn SandboxRuntime>, SandboxError> {
    match config.backend {
        #[cfg(feature = "docker")]
        SandboxBackend::Docker => Ok(Arc::new(DockerRuntime::connect(&config.docker)?)),
        #[cfg(not(feature = "docker"))]
        SandboxBackend::Docker => Err(SandboxError::Unavailable(
            "docker support was not compiled in (enable the `docker` feature)".to_string(),
        )),
        SandboxBackend::Process => {
            tracing::warn!("Process sandbox backend selected: functions run without isolation");
            Ok(Arc::new(ProcessRuntime::new(config.process.clone())))
        }
    }
}
