//! Hot-reload controllers: VCL, TLS certificates and endpoint/routing state.

pub mod endpoints;
pub mod fsutil;
pub mod routing;
pub mod tls;
pub mod vcl;
pub mod watch;

use tokio::sync::mpsc;

/// A reload failure serious enough that the orchestrator should terminate
/// the process. Delivered over a size-1 channel so multiple failure paths
/// never block or double-fire (the sender uses `try_send` and discards if
/// a fatal error is already pending).
#[derive(Debug, Clone)]
pub struct FatalError {
    pub component: &'static str,
    pub message: String,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.component, self.message)
    }
}

pub fn fatal_channel() -> (mpsc::Sender<FatalError>, mpsc::Receiver<FatalError>) {
    mpsc::channel(1)
}

/// Reports a fatal error without blocking; if one is already queued the new
/// one is dropped (logged by the caller) rather than stalling the reloader.
pub fn report_fatal(tx: &mpsc::Sender<FatalError>, component: &'static str, message: impl Into<String>) {
    let err = FatalError {
        component,
        message: message.into(),
    };
    if tx.try_send(err).is_err() {
        tracing::warn!(target: "chaperone::reload", component, "fatal error channel full, dropping duplicate signal");
    }
}
