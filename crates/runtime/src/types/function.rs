//! Function metadata and per-invocation records

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::error::ValidationError;

/// A registered function: a unique name bound to a runnable image.
///
/// Instances are only built through [`FunctionSpec::new`], so every value in
/// circulation has non-empty fields. The registry owns the canonical copy; the
/// engine only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionSpec {
    name: String,
    image: String,
    runtime: String,
}

impl FunctionSpec {
    /// Validate and build a function spec
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        runtime: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        let image = image.into();
        let runtime = runtime.into();

        require_non_empty("name", &name)?;
        require_non_empty("image", &image)?;
        require_non_empty("runtime", &runtime)?;

        if name.contains('/') {
            return Err(ValidationError::Invalid {
                field: "name",
                reason: "must not contain '/'".to_string(),
            });
        }

        Ok(Self {
            name,
            image,
            runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(())
    }
}

/// One request to run a function against an event payload
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub function: FunctionSpec,
    pub event: Bytes,
}

impl InvocationRequest {
    pub fn new(function: FunctionSpec, event: impl Into<Bytes>) -> Self {
        Self {
            function,
            event: event.into(),
        }
    }
}

/// Deadline and cancellation signal for a single invocation
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// Upper bound on the whole invocation, sandbox creation included
    pub deadline: Option<Duration>,
    /// Fires when the invocation must be abandoned (e.g. forced shutdown)
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
