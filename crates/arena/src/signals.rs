//! Signal handling for graceful shutdown.
//!
//! The first SIGINT/SIGTERM (Ctrl+C on Windows) starts a graceful shutdown
//! through the shared [`ShutdownState`]. The application listens for a second
//! one to exit immediately.

use arena_core::ShutdownState;
use tokio::signal;
use tracing::info;

/// Waits for a termination signal, then initiates `shutdown`.
pub async fn wait_for_shutdown_signal(
    shutdown: &ShutdownState,
) -> Result<(), Box<dyn std::error::Error>> {
    wait_for_signal().await?;
    info!("📡 Received shutdown signal - initiating graceful shutdown");
    shutdown.initiate_shutdown();
    Ok(())
}

/// Resolves on the next termination signal without touching any state.
pub async fn wait_for_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}
