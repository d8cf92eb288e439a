pub mod deploy;
pub mod invoke;
pub mod run;

use serverless_runtime::config::{LogFormat, LoggingConfig};
use serverless_runtime::{ConfigError, RuntimeError};
use tracing_subscriber::EnvFilter;

/// Errors reported by CLI commands
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid event JSON: {0}")]
    InvalidEvent(#[source] serde_json::Error),

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },
}

/// Initialize tracing for structured logging. `RUST_LOG` overrides the configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

/// Base URL of the coordinator for a configured `host:port`
pub fn base_url(server_addr: &str) -> String {
    if server_addr.starts_with("http://") || server_addr.starts_with("https://") {
        server_addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", server_addr.trim_end_matches('/'))
    }
}

/// Read a response body, turning non-2xx statuses into [`CliError::Server`]
pub async fn read_response(url: &str, response: reqwest::Response) -> Result<String, CliError> {
    let status = response.status();
    let body = response.text().await.map_err(|source| CliError::Request {
        url: url.to_string(),
        source,
    })?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(CliError::Server {
            status: status.as_u16(),
            message: body.trim_end().to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use serverless_runtime::coordinator::{serve, Coordinator, ServeOptions};
    use serverless_runtime::sandbox::MockRuntime;
    use serverless_runtime::{ExecutionEngine, InMemoryRegistry};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    /// Serve a coordinator over the mock backend on an ephemeral port
    pub async fn spawn_server(mock: MockRuntime) -> (String, CancellationToken) {
        let engine = ExecutionEngine::new(Arc::new(mock), vec!["/app/function".to_string()]);
        let coordinator = Arc::new(Coordinator::new(Arc::new(InMemoryRegistry::new()), engine));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(
            listener,
            coordinator,
            ServeOptions::default(),
            shutdown.clone(),
        ));
        (addr, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_adds_scheme() {
        assert_eq!(base_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(base_url("http://10.0.0.1:9000/"), "http://10.0.0.1:9000");
    }
}
