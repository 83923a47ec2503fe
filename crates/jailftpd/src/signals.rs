//! Shutdown signal plumbing
//!
//! SIGINT, SIGTERM and SIGHUP cancel one root token. Workers hold child tokens
//! and race every blocking call against them with [`interruptible`].

use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `token` on the first termination signal.
///
/// Handlers are registered before this returns, so a signal that arrives
/// afterwards is never lost.
pub fn install(token: CancellationToken) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sighup.recv() => "SIGHUP",
            _ = token.cancelled() => return,
        };
        info!(signal = name, "shutdown requested");
        token.cancel();
    });

    Ok(())
}

/// Runs `fut` unless `cancel` fires first; `None` means shutdown.
pub async fn interruptible<F>(cancel: &CancellationToken, fut: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
