//! Serverless Function Runtime
//!
//! The runtime is the server side of the serverless platform: it keeps the
//! registry of deployed functions, runs each invocation in a fresh sandbox
//! and serves both over HTTP.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod registry;
pub mod sandbox;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigError, PlatformConfig};
pub use coordinator::{Coordinator, ServeOptions, ShutdownOutcome};
pub use engine::ExecutionEngine;
pub use registry::{FunctionRegistry, InMemoryRegistry, SqliteRegistry};
pub use sandbox::{SandboxHandle, SandboxRuntime, SandboxStreams};
pub use types::*;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// A fully wired platform: registry, sandbox backend, engine and coordinator
pub struct Platform {
    coordinator: Arc<Coordinator>,
    config: PlatformConfig,
}

impl Platform {
    /// Assemble the platform from configuration
    pub fn new(config: PlatformConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let registry = registry::open(&config)?;
        let runtime = sandbox::connect(&config.sandbox)?;
        Ok(Self::with_components(config, registry, runtime))
    }

    /// Assemble the platform around an existing registry and sandbox backend
    pub fn with_components(
        config: PlatformConfig,
        registry: Arc<dyn FunctionRegistry>,
        runtime: Arc<dyn SandboxRuntime>,
    ) -> Self {
        tracing::info!(backend = runtime.name(), "Sandbox backend ready");

        let engine = ExecutionEngine::new(runtime, config.sandbox.entry_command.clone())
            .with_max_output_bytes(config.sandbox.max_output_bytes);
        let coordinator =
            Coordinator::new(registry, engine).with_default_timeout(config.default_timeout);

        Self {
            coordinator: Arc::new(coordinator),
            config,
        }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ShutdownOutcome, RuntimeError> {
        let listener = coordinator::bind(&self.config.server_addr).await?;
        let outcome = coordinator::serve(
            listener,
            self.coordinator.clone(),
            ServeOptions::from_config(&self.config),
            shutdown,
        )
        .await?;
        Ok(outcome)
    }
}
