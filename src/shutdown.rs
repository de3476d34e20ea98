use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared shutdown flag, flipped by the signal handler and polled by the
/// orchestrator between chunks and between months. Unlike a handler that
/// calls `process::exit` directly, this lets the in-flight chunk finish
/// and `ProcessingLog` get updated before the process actually exits.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Spawn the SIGINT/SIGTERM listener. Returns immediately; the returned
/// `ShutdownSignal` flips once either signal arrives.
pub fn install() -> ShutdownSignal {
    let signal = ShutdownSignal::new();

    let ctrl_c_signal = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received SIGINT, finishing the in-flight chunk before exiting");
            ctrl_c_signal.request();
        }
    });

    #[cfg(unix)]
    {
        let term_signal = signal.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    tracing::warn!("Received SIGTERM, finishing the in-flight chunk before exiting");
                    term_signal.request();
                }
                Err(err) => tracing::error!("Failed to install SIGTERM handler: {}", err),
            }
        });
    }

    signal
}

/// Exit code used when a graceful shutdown interrupts the run, matching
/// the conventional 128+SIGINT value.
pub const SHUTDOWN_EXIT_CODE: i32 = 130;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_signal_starts_unrequested_and_flips_once_requested() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_requested());
        signal.request();
        assert!(signal.is_requested());
    }

    #[test]
    fn shutdown_signal_clones_share_the_same_flag() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.request();
        assert!(signal.is_requested());
    }
}
