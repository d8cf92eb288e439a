use serverless_runtime::coordinator::cancel_on_signal;
use serverless_runtime::config::ConfigSource;
use serverless_runtime::{Platform, PlatformConfig, ShutdownOutcome};
use tokio_util::sync::CancellationToken;

use super::CliError;

/// Start the platform server and block until a shutdown signal
pub async fn run(config: PlatformConfig, source: ConfigSource) -> Result<(), CliError> {
    super::init_tracing(&config.logging);
    source.log();

    tracing::info!(
        addr = %config.server_addr,
        db = %config.db_path.display(),
        backend = ?config.sandbox.backend,
        "Starting serverless platform"
    );

    let platform = Platform::new(config)?;
    let shutdown = CancellationToken::new();
    let signals = cancel_on_signal(shutdown.clone());

    let outcome = platform.run(shutdown.clone()).await;

    // Stops the signal listener if the server ended on its own
    shutdown.cancel();
    let _ = signals.await;

    match outcome? {
        ShutdownOutcome::Graceful => tracing::info!("Server stopped"),
        ShutdownOutcome::Forced => {
            tracing::warn!("Server stopped after cancelling in-flight invocations")
        }
    }
    Ok(())
}
