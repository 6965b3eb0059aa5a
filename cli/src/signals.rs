// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! SIGINT/SIGTERM to cancellation.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Token cancelled on the first Ctrl+C or SIGTERM.
///
/// The running operation decides what cancellation means: a backup restarts
/// services and discards its snapshot, a restore rolls back.
pub fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
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
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                warn!("Received Ctrl+C signal, cancelling");
            },
            _ = terminate => {
                warn!("Received SIGTERM signal, cancelling");
            },
        }
        trigger.cancel();
    });

    token
}
