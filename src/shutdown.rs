//! Graceful-shutdown coordination for the webhook server
//!
//! The API server may keep routing admission requests for up to ~20s after
//! SIGTERM. Terminating earlier turns those calls into 5xx admission failures
//! that stall user workloads, so shutdown is cooperative: flip liveness first
//! (so the endpoint is pulled from rotation), then drain until either the
//! in-flight counter reaches zero or a grace timer expires, then cancel the
//! server. A second signal aborts the process immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long the drain waits for in-flight requests before giving up
pub const GRACE_PERIOD: Duration = Duration::from_secs(20);

/// How often the drain re-checks the in-flight counter
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared shutdown state; cheap to clone into every handler
#[derive(Clone)]
pub struct ShutdownManager {
    inner: Arc<Inner>,
}

struct Inner {
    live: AtomicBool,
    in_flight: Mutex<u64>,
    cancel: CancellationToken,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    /// Fresh manager: live, zero requests in flight
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                live: AtomicBool::new(true),
                in_flight: Mutex::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Token the server select!s on; cancelled once the drain completes
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Liveness as reported by `/livez`; false once shutdown began
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Count one request for the duration of the returned guard
    pub fn track_request(&self) -> RequestGuard {
        *self.inner.in_flight.lock().expect("in-flight lock poisoned") += 1;
        RequestGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Requests currently in flight
    pub fn in_flight(&self) -> u64 {
        *self.inner.in_flight.lock().expect("in-flight lock poisoned")
    }

    /// Flip liveness, wait for the counter to reach zero or the grace timer
    /// to expire, then cancel the server token.
    pub async fn drain(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
        info!("shutdown requested, draining in-flight admission requests");

        let deadline = time::sleep(GRACE_PERIOD);
        tokio::pin!(deadline);

        loop {
            if self.in_flight() == 0 {
                info!("all in-flight requests finished");
                break;
            }
            tokio::select! {
                () = &mut deadline => {
                    warn!(in_flight = self.in_flight(), "grace period expired with requests still in flight");
                    break;
                }
                () = time::sleep(POLL_INTERVAL) => {}
            }
        }

        self.inner.cancel.cancel();
    }

    /// Block until SIGINT or SIGTERM, then drain. A second signal exits
    /// with code 1 without waiting.
    pub async fn listen(self) -> crate::Result<()> {
        let mut sigint = signal(SignalKind::interrupt()).map_err(|err| {
            crate::Error::config(format!("could not install SIGINT handler: {err}"))
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|err| {
            crate::Error::config(format!("could not install SIGTERM handler: {err}"))
        })?;

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        let force = async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            warn!("second signal received, aborting");
            std::process::exit(1);
        };

        tokio::select! {
            () = self.drain() => {}
            () = force => unreachable!("force path exits the process"),
        }

        Ok(())
    }
}

/// RAII guard decrementing the in-flight counter on drop
pub struct RequestGuard {
    inner: Arc<Inner>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let mut count = self.inner.in_flight.lock().expect("in-flight lock poisoned");
        *count = count.saturating_sub(1);
    }
}
