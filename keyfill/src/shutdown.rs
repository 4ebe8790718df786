//! Signal handling
//!
//! The first Ctrl+C (or SIGTERM) cancels the run's token: in-flight fetches
//! finish, nothing new is dispatched, and the checkpoint is saved. A second
//! signal exits immediately.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Exit status used when a second signal forces termination
pub const FORCED_EXIT_CODE: i32 = 130;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Cancel `token` on the first signal; exit the process on the second
pub fn install_shutdown_handler(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown requested. Finishing in-flight requests and saving progress...");
        token.cancel();

        shutdown_signal().await;
        warn!("Second shutdown signal, exiting immediately");
        std::process::exit(FORCED_EXIT_CODE);
    })
}
