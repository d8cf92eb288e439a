//! Docker Engine sandbox backend
//!
//! Each sandbox is one container created from the function's image. The
//! container is created with stdin open and attached without a TTY, so the
//! engine multiplexes stdout and stderr frames over the attach connection.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    WaitContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tokio_util::io::StreamReader;

use super::{SandboxHandle, SandboxRuntime, SandboxStreams};
use crate::config::DockerConfig;
use crate::types::SandboxError;

/// Sandbox backend backed by a Docker Engine
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the engine described by `config`.
    ///
    /// The connection is lazy: an unreachable engine surfaces on the first
    /// sandbox operation, not here.
    pub fn connect(config: &DockerConfig) -> Result<Self, SandboxError> {
        let docker = match &config.socket {
            Some(path) => {
                Docker::connect_with_socket(path, config.request_timeout_secs, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        let docker = docker.with_timeout(Duration::from_secs(config.request_timeout_secs));
        Ok(Self { docker })
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn classify(operation: &'static str, error: BollardError) -> SandboxError {
    match error {
        BollardError::DockerResponseServerError { status_code, message } if status_code >= 500 => {
            SandboxError::Unavailable(format!("{operation}: {message}"))
        }
        BollardError::IOError { err } => SandboxError::Unavailable(format!("{operation}: {err}")),
        other => SandboxError::operation(operation, other),
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, image: &str, command: &[String]) -> Result<SandboxHandle, SandboxError> {
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(command.to_vec()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            ..ContainerCreateBody::default()
        };

        let response = self
            .docker
            .create_container(None::<bollard::query_parameters::CreateContainerOptions>, body)
            .await
            .map_err(|error| {
                if is_not_found_error(&error) {
                    SandboxError::ImageNotFound(image.to_string())
                } else {
                    classify("create_container", error)
                }
            })?;

        for warning in &response.warnings {
            tracing::warn!(container = %response.id, "Docker warning: {}", warning);
        }

        Ok(SandboxHandle::new(response.id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container(&handle.backend_id, None::<StartContainerOptions>)
            .await
            .map_err(|error| {
                if is_not_found_error(&error) {
                    SandboxError::NotFound { id: handle.id }
                } else {
                    classify("start_container", error)
                }
            })
    }

    async fn attach(&self, handle: &SandboxHandle) -> Result<SandboxStreams, SandboxError> {
        let options = AttachContainerOptionsBuilder::new()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .logs(true)
            .build();

        let attached = self
            .docker
            .attach_container(&handle.backend_id, Some(options))
            .await
            .map_err(|error| {
                if is_not_found_error(&error) {
                    SandboxError::NotFound { id: handle.id }
                } else {
                    classify("attach_container", error)
                }
            })?;

        let sandbox = handle.id;
        let stdout = attached.output.filter_map(move |frame| async move {
            match frame {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(message))
                }
                Ok(LogOutput::StdErr { message }) => {
                    tracing::debug!(
                        %sandbox,
                        "function stderr: {}",
                        String::from_utf8_lossy(&message).trim_end()
                    );
                    None
                }
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(std::io::Error::other(e))),
            }
        });

        Ok(SandboxStreams {
            input: attached.input,
            output: Box::pin(StreamReader::new(stdout)),
        })
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut responses =
            std::pin::pin!(self.docker.wait_container(&handle.backend_id, Some(options)));

        match responses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The engine reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(error)) if is_not_found_error(&error) => {
                Err(SandboxError::NotFound { id: handle.id })
            }
            Some(Err(error)) => Err(classify("wait_container", error)),
            None => Err(SandboxError::operation(
                "wait_container",
                "engine closed the wait stream without a status",
            )),
        }
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();

        match self
            .docker
            .remove_container(&handle.backend_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if is_not_found_error(&error) => Ok(()),
            // 409: removal already in progress
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(error) => Err(classify("remove_container", error)),
        }
    }
}
