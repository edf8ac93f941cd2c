//! Diagnostic watchdog timer.
//!
//! [`Watchdog`] logs a warning if it is still armed after its threshold.  It
//! never cancels the work it watches; dropping the guard disarms it.
//!
//! ```rust,no_run
//! # async fn slow_work() {}
//! # async fn example() {
//! use std::time::Duration;
//! use layer_updates::Watchdog;
//! use tokio_util::sync::CancellationToken;
//!
//! let _guard = Watchdog::start(Duration::from_secs(30), CancellationToken::new(), || {
//!     "slow_work() is taking a while".to_string()
//! });
//! slow_work().await;
//! // `_guard` is dropped here, no warning if we finished in time.
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ─── Watchdog ────────────────────────────────────────────────────────────────

/// Scoped "this is taking too long" timer.
pub struct Watchdog {
    stop:  Arc<Notify>,
    fired: Arc<AtomicBool>,
    task:  Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm a watchdog.  `describe` is only evaluated if the threshold elapses.
    ///
    /// The timer also stops when `shutdown` is cancelled.
    pub fn start<F>(threshold: Duration, shutdown: CancellationToken, describe: F) -> Self
    where
        F: FnOnce() -> String + Send + 'static,
    {
        Self::start_with(threshold, shutdown, describe, || {})
    }

    /// Like [`Watchdog::start`], additionally running `on_fire` when the
    /// warning is logged.
    pub(crate) fn start_with<F, H>(
        threshold: Duration,
        shutdown:  CancellationToken,
        describe:  F,
        on_fire:   H,
    ) -> Self
    where
        F: FnOnce() -> String + Send + 'static,
        H: FnOnce() + Send + 'static,
    {
        let stop   = Arc::new(Notify::new());
        let stop2  = stop.clone();
        let fired  = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(threshold) => {
                    fired2.store(true, Ordering::Release);
                    tracing::warn!("[layer-updates] {} (over {:?})", describe(), threshold);
                    on_fire();
                }
                _ = stop2.notified()     => {}
                _ = shutdown.cancelled() => {}
            }
        });

        Self { stop, fired, task: Some(task) }
    }

    /// `true` if the warning has already been logged.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Disarm without waiting for the drop.
    pub fn disarm(&mut self) {
        self.stop.notify_one();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.notify_one();
        if let Some(t) = self.task.take() {
            t.abort();
        }
    }
}
