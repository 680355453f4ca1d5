//! Signal handling in workers.
//!
//! Workers share the master's process group, so a terminal Ctrl-C or a service manager
//! signalling the group reaches them too. Only the master's `Quit` may stop a worker,
//! so every signal the master reacts to is caught here and logged.

use std::io;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Signals a worker catches and ignores.
pub fn ignored_signals() -> [(&'static str, SignalKind); 6] {
    [
        ("SIGHUP", SignalKind::hangup()),
        ("SIGINT", SignalKind::interrupt()),
        ("SIGQUIT", SignalKind::quit()),
        ("SIGTERM", SignalKind::terminate()),
        ("SIGUSR1", SignalKind::user_defined1()),
        ("SIGUSR2", SignalKind::user_defined2()),
    ]
}

/// Install handlers for [`ignored_signals`] and log each delivery until `shutdown`.
///
/// Handlers stay installed for the life of the process once registered, so signals
/// arriving during the final drain are swallowed as well.
pub fn ignore_signals(shutdown: CancellationToken) -> io::Result<()> {
    for (name, kind) in ignored_signals() {
        let mut stream = signal(kind)?;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = stream.recv() => match received {
                        Some(()) => tracing::info!(
                            pid = std::process::id(),
                            signal = name,
                            "Ignoring signal, waiting for quit from master"
                        ),
                        None => break,
                    },
                }
            }
        });
    }
    Ok(())
}
