//! Installs a signal handler which initiates a shutdown on CTRL+C or SIGHUP.
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

/// Forks a task which awaits either **CTRL+C** or **SIGHUP** and then cancels the given token.
pub fn install(shutdown: CancellationToken) {
    let _ = tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sig_hup = match tokio::signal::unix::signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(error) => {
                log::error!("Failed to install a handler for SIGHUP: {}", error);
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => log::info!("Received CTRL-C. Shutting down..."),
            _ = sig_hup.recv() => log::info!("Received SIGHUP. Shutting down..."),
        }

        shutdown.cancel();
    });
}
