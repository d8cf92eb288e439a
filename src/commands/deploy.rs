use clap::ArgMatches;
use serde_json::json;
use serverless_runtime::PlatformConfig;

use super::{base_url, read_response, CliError};

pub async fn run(matches: &ArgMatches, config: &PlatformConfig) -> Result<(), CliError> {
    let name = matches
        .get_one::<String>("name")
        .map(String::as_str)
        .unwrap_or_default();
    let image = matches
        .get_one::<String>("image")
        .cloned()
        .unwrap_or_else(|| default_image(name));
    let runtime = matches
        .get_one::<String>("runtime")
        .map(String::as_str)
        .unwrap_or("go");

    deploy(&base_url(&config.server_addr), name, &image, runtime).await?;
    println!("✓ Function '{}' deployed ({})", name, image);
    Ok(())
}

/// Image reference used when none is given on the command line
pub fn default_image(name: &str) -> String {
    format!("serverless-{}:latest", name)
}

/// Register a function with the server at `base`
pub async fn deploy(base: &str, name: &str, image: &str, runtime: &str) -> Result<(), CliError> {
    let url = format!("{}/functions", base);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&json!({ "name": name, "image": image, "runtime": runtime }))
        .send()
        .await
        .map_err(|source| CliError::Request {
            url: url.clone(),
            source,
        })?;

    read_response(&url, response).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::spawn_server;
    use serverless_runtime::sandbox::MockRuntime;

    #[test]
    fn default_image_follows_naming_convention() {
        assert_eq!(default_image("echo"), "serverless-echo:latest");
    }

    #[tokio::test]
    async fn deploy_against_running_server() {
        let (addr, shutdown) = spawn_server(MockRuntime::new()).await;
        let base = base_url(&addr);

        deploy(&base, "echo", "serverless-echo:latest", "go")
            .await
            .unwrap();

        let err = deploy(&base, "echo", "serverless-echo:latest", "go")
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Server { status: 409, .. }));

        let err = deploy(&base, "broken", "", "go").await.unwrap_err();
        assert!(matches!(err, CliError::Server { status: 400, .. }));

        shutdown.cancel();
    }
}
