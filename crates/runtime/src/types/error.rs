//! Error types for the serverless runtime

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use super::SandboxId;
use crate::config::ConfigError;

/// Main runtime error type, used while assembling and running the platform
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Bad caller input; never retried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Function registry errors
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Function not found: {name}")]
    NotFound { name: String },

    #[error("Function already registered: {name}")]
    AlreadyExists { name: String },

    #[error("Registry storage error: {0}")]
    Storage(String),

    #[error("Corrupt registry record for {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

/// Errors reported by a sandbox backend
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Sandbox backend unavailable: {0}")]
    Unavailable(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Sandbox not found: {id}")]
    NotFound { id: SandboxId },

    #[error("Sandbox {id} is not in a state that allows {operation}")]
    InvalidState { id: SandboxId, operation: &'static str },

    #[error("Sandbox operation {operation} failed: {reason}")]
    OperationFailed {
        operation: &'static str,
        reason: String,
    },
}

impl SandboxError {
    pub fn operation(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Lifecycle phase an execution failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Create,
    Start,
    Attach,
    Deliver,
    Read,
    Wait,
    Exit,
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecutionPhase::Create => "create",
            ExecutionPhase::Start => "start",
            ExecutionPhase::Attach => "attach",
            ExecutionPhase::Deliver => "deliver",
            ExecutionPhase::Read => "read",
            ExecutionPhase::Wait => "wait",
            ExecutionPhase::Exit => "exit",
        };
        f.write_str(label)
    }
}

/// Failure of a single invocation inside the execution engine.
///
/// Every variant names the function, and every variant after creation names
/// the sandbox, so a log line is enough to diagnose the failure. A timeout or
/// cancellation that lands while the sandbox is still being created carries
/// no sandbox.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to create sandbox for function '{function}': {source}")]
    SandboxCreate {
        function: String,
        #[source]
        source: SandboxError,
    },

    #[error("Failed to start sandbox {sandbox} for function '{function}': {source}")]
    SandboxStart {
        function: String,
        sandbox: SandboxId,
        #[source]
        source: SandboxError,
    },

    #[error("Failed to attach to sandbox {sandbox} for function '{function}': {source}")]
    SandboxAttach {
        function: String,
        sandbox: SandboxId,
        #[source]
        source: SandboxError,
    },

    #[error("Failed to deliver event to sandbox {sandbox} for function '{function}': {source}")]
    EventDelivery {
        function: String,
        sandbox: SandboxId,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read output of sandbox {sandbox} for function '{function}': {source}")]
    OutputRead {
        function: String,
        sandbox: SandboxId,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for sandbox {sandbox} of function '{function}': {source}")]
    SandboxWait {
        function: String,
        sandbox: SandboxId,
        #[source]
        source: SandboxError,
    },

    #[error("Function '{function}' timed out after {after:?}")]
    Timeout {
        function: String,
        sandbox: Option<SandboxId>,
        after: Duration,
    },

    #[error("Invocation of function '{function}' was cancelled")]
    Cancelled {
        function: String,
        sandbox: Option<SandboxId>,
    },

    #[error("Function '{function}' exited with code {code}")]
    FunctionExit {
        function: String,
        sandbox: SandboxId,
        code: i64,
        /// Output captured before exit, kept for diagnostics only
        output: Bytes,
    },
}

impl ExecutionError {
    pub fn function(&self) -> &str {
        match self {
            ExecutionError::SandboxCreate { function, .. }
            | ExecutionError::SandboxStart { function, .. }
            | ExecutionError::SandboxAttach { function, .. }
            | ExecutionError::EventDelivery { function, .. }
            | ExecutionError::OutputRead { function, .. }
            | ExecutionError::SandboxWait { function, .. }
            | ExecutionError::Timeout { function, .. }
            | ExecutionError::Cancelled { function, .. }
            | ExecutionError::FunctionExit { function, .. } => function,
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        match self {
            ExecutionError::SandboxCreate { .. }
            | ExecutionError::Timeout { sandbox: None, .. }
            | ExecutionError::Cancelled { sandbox: None, .. } => ExecutionPhase::Create,
            ExecutionError::SandboxStart { .. } => ExecutionPhase::Start,
            ExecutionError::SandboxAttach { .. } => ExecutionPhase::Attach,
            ExecutionError::EventDelivery { .. } => ExecutionPhase::Deliver,
            ExecutionError::OutputRead { .. } => ExecutionPhase::Read,
            ExecutionError::SandboxWait { .. }
            | ExecutionError::Timeout { .. }
            | ExecutionError::Cancelled { .. } => ExecutionPhase::Wait,
            ExecutionError::FunctionExit { .. } => ExecutionPhase::Exit,
        }
    }

    /// Sandbox the failure happened in, if one had been created
    pub fn sandbox(&self) -> Option<SandboxId> {
        match self {
            ExecutionError::SandboxCreate { .. } => None,
            ExecutionError::Timeout { sandbox, .. } | ExecutionError::Cancelled { sandbox, .. } => {
                *sandbox
            }
            ExecutionError::SandboxStart { sandbox, .. }
            | ExecutionError::SandboxAttach { sandbox, .. }
            | ExecutionError::EventDelivery { sandbox, .. }
            | ExecutionError::OutputRead { sandbox, .. }
            | ExecutionError::SandboxWait { sandbox, .. }
            | ExecutionError::FunctionExit { sandbox, .. } => Some(*sandbox),
        }
    }
}

/// Errors surfaced by the request coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Failed to store function: {0}")]
    RegistryWrite(#[source] RegistryError),

    #[error("Failed to look up function: {0}")]
    RegistryRead(#[source] RegistryError),

    #[error("Function execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

/// Listener errors
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    #[error("Failed to bind to address {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Server error: {0}")]
    Serve(String),
}
