//! Process shutdown on SIGINT or SIGTERM.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

/// A token cancelled when the process receives Ctrl-C or, on Unix, SIGTERM.
///
/// The SIGTERM handler is installed before this returns, so a signal sent
/// right after the call is not lost. Must be called inside a tokio runtime.
pub fn on_termination_signal() -> Result<CancellationToken> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let signal = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        #[cfg(not(unix))]
        let signal = {
            tokio::signal::ctrl_c().await.ok();
            "ctrl-c"
        };
        info!(signal, "shutdown requested");
        trigger.cancel();
    });
    Ok(token)
}
