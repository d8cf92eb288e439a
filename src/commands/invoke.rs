use clap::ArgMatches;
use serverless_runtime::PlatformConfig;

use super::{base_url, read_response, CliError};

pub async fn run(matches: &ArgMatches, config: &PlatformConfig) -> Result<(), CliError> {
    let name = matches
        .get_one::<String>("name")
        .map(String::as_str)
        .unwrap_or_default();
    let event = matches
        .get_one::<String>("event")
        .map(String::as_str)
        .unwrap_or_default();
    let timeout_ms = matches.get_one::<u64>("timeout-ms").copied();

    let output = invoke(&base_url(&config.server_addr), name, event, timeout_ms).await?;
    println!("{}", output.trim_end());
    Ok(())
}

/// Invoke `name` on the server at `base` and return the function output.
///
/// The event must be valid JSON; it is checked before anything is sent.
pub async fn invoke(
    base: &str,
    name: &str,
    event: &str,
    timeout_ms: Option<u64>,
) -> Result<String, CliError> {
    serde_json::from_str::<serde_json::Value>(event).map_err(CliError::InvalidEvent)?;

    let url = match timeout_ms {
        Some(ms) => format!("{}/invoke/{}?timeout_ms={}", base, name, ms),
        None => format!("{}/invoke/{}", base, name),
    };

    let response = reqwest::Client::new()
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(event.to_string())
        .send()
        .await
        .map_err(|source| CliError::Request {
            url: url.clone(),
            source,
        })?;

    read_response(&url, response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::deploy::deploy;
    use crate::commands::test_support::spawn_server;
    use serverless_runtime::sandbox::MockRuntime;

    #[tokio::test]
    async fn invalid_json_is_rejected_locally() {
        // Nothing listens here; validation must fail first
        let err = invoke("http://127.0.0.1:9", "echo", "{data:", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn invoke_prints_function_output() {
        let mock = MockRuntime::new()
            .with_function("serverless-echo:latest", |event| {
                let mut out = b"got ".to_vec();
                out.extend_from_slice(event);
                (out, 0)
            })
            .with_exit("serverless-crash:latest", "", 3);
        let (addr, shutdown) = spawn_server(mock).await;
        let base = base_url(&addr);

        deploy(&base, "echo", "serverless-echo:latest", "go")
            .await
            .unwrap();
        let output = invoke(&base, "echo", r#"{"data":"x"}"#, Some(5_000))
            .await
            .unwrap();
        assert_eq!(output, r#"got {"data":"x"}"#);

        deploy(&base, "crash", "serverless-crash:latest", "go")
            .await
            .unwrap();
        let err = invoke(&base, "crash", "{}", None).await.unwrap_err();
        match err {
            CliError::Server { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("exited with code 3"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = invoke(&base, "ghost", "{}", None).await.unwrap_err();
        assert!(matches!(err, CliError::Server { status: 404, .. }));

        shutdown.cancel();
    }
}
