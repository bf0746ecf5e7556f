use tokio_util::sync::CancellationToken;

/// Resolves when the application receives SIGTERM on unix systems, or never on
/// other systems.
async fn sigterm() {
    #[cfg(unix)]
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(error) => {
            tracing::warn!(%error, "can't listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }

    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

/// Returns a [`CancellationToken`] that will be triggered when Ctrl-C is
/// pressed, or (on Unix) when SIGTERM is received.
pub fn cancel_on_ctrlc_or_sigterm() -> CancellationToken {
    let token = CancellationToken::new();

    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl-C. Shutting down.");
                }
                _ = sigterm() => {
                    tracing::info!("Received SIGTERM. Shutting down.");
                }
                _ = token.cancelled() => {}
            }

            token.cancel();
        }
    });

    token
}
