//! The `drake run` command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use drake_core::{Error, Result};
use drake_executor::{DockerRunner, TargetRunner};
use drake_scheduler::LocalExecutor;

/// Execute targets or pipelines against the local container engine.
pub async fn run(
    config_file: &Path,
    names: &[String],
    pipelines: bool,
    debug_only: bool,
    concurrently: bool,
    secrets_file: Option<&Path>,
) -> Result<()> {
    // The project source is whatever directory holds the configuration.
    let source_path = config_file
        .canonicalize()
        .map_err(|e| {
            Error::Config(format!(
                "error resolving config file {}: {e}",
                config_file.display()
            ))
        })?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let token = shutdown_token();
    let runner: Arc<dyn TargetRunner> = Arc::new(DockerRunner::new()?);
    let executor = LocalExecutor::new(runner);

    if pipelines {
        executor
            .run_pipelines(
                &token,
                config_file,
                secrets_file,
                &source_path,
                names,
                debug_only,
                concurrently,
            )
            .await
    } else {
        executor
            .run_targets(
                &token,
                config_file,
                secrets_file,
                &source_path,
                names,
                debug_only,
                concurrently,
            )
            .await
    }
}

/// A token that fires on SIGINT or SIGTERM. Teardown paths deliberately
/// do not observe it, so resources are reclaimed even after a signal.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing the SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        signal_token.cancel();
    });
    token
}
