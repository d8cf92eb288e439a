//! Request coordinator
//!
//! Validates register/invoke requests, resolves functions through the
//! registry and hands invocations to the execution engine. The HTTP surface
//! lives in [`server`], signal handling in [`shutdown`].

pub mod server;
pub mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::engine::ExecutionEngine;
use crate::registry::FunctionRegistry;
use crate::types::{
    CoordinatorError, FunctionSpec, InvocationContext, InvocationRequest, RegistryError,
    ValidationError,
};

pub use server::{bind, router, serve, DeployRequest, ServeOptions, ShutdownOutcome};
pub use shutdown::{cancel_on_signal, shutdown_signal};

/// Front door of the platform: registration and synchronous invocation
pub struct Coordinator {
    registry: Arc<dyn FunctionRegistry>,
    engine: ExecutionEngine,
    default_timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(registry: Arc<dyn FunctionRegistry>, engine: ExecutionEngine) -> Self {
        Self {
            registry,
            engine,
            default_timeout: None,
        }
    }

    /// Deadline applied to invocations that do not carry their own
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Register a function under a unique name
    pub async fn register(
        &self,
        name: &str,
        image: &str,
        runtime: &str,
    ) -> Result<FunctionSpec, CoordinatorError> {
        let spec = FunctionSpec::new(name, image, runtime).map_err(|e| {
            tracing::warn!("Missing required metadata fields: {}", e);
            e
        })?;

        match self.registry.put(spec.clone()).await {
            Ok(()) => {
                tracing::info!(
                    function = spec.name(),
                    image = spec.image(),
                    runtime = spec.runtime(),
                    "Function deployed successfully"
                );
                Ok(spec)
            }
            Err(RegistryError::AlreadyExists { name }) => {
                tracing::warn!(function = %name, "Function already registered");
                Err(CoordinatorError::AlreadyRegistered(name))
            }
            Err(e) => {
                tracing::error!(function = spec.name(), "Failed to store function: {}", e);
                Err(CoordinatorError::RegistryWrite(e))
            }
        }
    }

    /// Invoke a registered function with `event` and return its output.
    ///
    /// The context's deadline wins over the configured default; with neither,
    /// the invocation is unbounded.
    pub async fn invoke(
        &self,
        name: &str,
        event: Bytes,
        mut ctx: InvocationContext,
    ) -> Result<Bytes, CoordinatorError> {
        if name.trim().is_empty() {
            tracing::warn!("Missing function name in invoke request");
            return Err(ValidationError::MissingField("name").into());
        }

        let spec = match self.registry.get(name).await {
            Ok(spec) => spec,
            Err(RegistryError::NotFound { name }) => {
                tracing::warn!(function = %name, "Function not found");
                return Err(CoordinatorError::FunctionNotFound(name));
            }
            Err(e) => {
                tracing::error!(function = name, "Failed to look up function: {}", e);
                return Err(CoordinatorError::RegistryRead(e));
            }
        };

        if ctx.deadline.is_none() {
            ctx.deadline = self.default_timeout;
        }

        let request = InvocationRequest::new(spec, event);
        Ok(self.engine.execute(&request, &ctx).await?)
    }
}
