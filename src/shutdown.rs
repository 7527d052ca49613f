//! Process signal handling
//!
//! SIGINT, SIGTERM and SIGHUP all request the same graceful shutdown: the
//! shared [`CancellationToken`] is cancelled and every loop holding a clone
//! of it winds down.

use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Error;

/// Signals that trigger shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Sigint,
    /// SIGTERM (pod termination)
    Sigterm,
    /// SIGHUP
    Sighup,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sigint => write!(f, "SIGINT"),
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sighup => write!(f, "SIGHUP"),
        }
    }
}

/// Install signal listeners and cancel `token` on the first one received.
///
/// The returned task also exits if `token` is cancelled by something else.
///
/// # Errors
///
/// Returns [`Error::Config`] if a listener cannot be registered.
pub fn spawn_signal_handler(token: CancellationToken) -> Result<JoinHandle<()>, Error> {
    let register = |kind: SignalKind, name: ShutdownSignal| {
        signal(kind).map_err(|e| Error::config(format!("failed to listen for {name}: {e}")))
    };
    let mut sigint = register(SignalKind::interrupt(), ShutdownSignal::Sigint)?;
    let mut sigterm = register(SignalKind::terminate(), ShutdownSignal::Sigterm)?;
    let mut sighup = register(SignalKind::hangup(), ShutdownSignal::Sighup)?;

    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = token.cancelled() => return,
            _ = sigint.recv() => ShutdownSignal::Sigint,
            _ = sigterm.recv() => ShutdownSignal::Sigterm,
            _ = sighup.recv() => ShutdownSignal::Sighup,
        };

        info!(signal = %received, "shutdown requested, draining");
        token.cancel();

        // A second signal while draining is only reported.
        tokio::select! {
            _ = sigint.recv() => warn!("already shutting down"),
            _ = sigterm.recv() => warn!("already shutting down"),
            _ = sighup.recv() => warn!("already shutting down"),
        }
    }))
}
