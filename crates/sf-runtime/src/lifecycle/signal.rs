use tokio_util::sync::CancellationToken;

/// Register Ctrl-C (SIGINT) and SIGTERM handling; cancel the pipeline on the
/// first signal received.
pub async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        sf_info!(sys, signal = "SIGINT", "received signal, initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        sf_info!(sys, signal = "SIGTERM", "received signal, initiating graceful shutdown");
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e) => {
                sf_warn!(sys, error = %e, "failed to listen for SIGTERM, only Ctrl-C will stop the engine");
                wait_for_ctrl_c(&cancel).await;
            }
        }
    }
    #[cfg(not(unix))]
    wait_for_ctrl_c(&cancel).await;
    cancel.cancel();
}

async fn wait_for_ctrl_c(cancel: &CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => sf_info!(sys, "received shutdown signal, initiating graceful shutdown"),
            Err(e) => {
                sf_error!(sys, error = %e, "failed to listen for Ctrl-C");
                cancel.cancelled().await;
            }
        },
        _ = cancel.cancelled() => {}
    }
}
