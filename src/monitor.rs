//! Transport monitoring and automatic reopen.
//!
//! A [`TransportMonitor`] is the policy: it decides whether and when to
//! reopen a transport that closed uncleanly. [`MonitorRunner`] applies the
//! policy, driving `open()` until it succeeds or the policy gives up.
//!
//! # Configuration
//!
//! [`BaseMonitor`] backs off exponentially:
//! - Max attempts: reopen attempts before giving up (default: 60)
//! - Initial wait: delay before the first attempt (default: 2s)
//! - Max wait: cap on the doubled delay (default: 2min)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frugal_core::monitor::{BaseMonitor, MonitorRunner};
//! use frugal_core::transport::{BusTransport, MemoryBus};
//!
//! # async fn example() {
//! let bus = Arc::new(MemoryBus::new());
//! let transport = Arc::new(BusTransport::client(bus, "service.connect"));
//! let runner = MonitorRunner::new(transport, Arc::new(BaseMonitor::default()));
//! let _watcher = runner.spawn();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::FrugalError;
use crate::transport::{CloseCause, Transport};

/// Default reopen attempts before giving up.
pub const DEFAULT_MAX_REOPEN_ATTEMPTS: u32 = 60;

/// Default wait before the first reopen attempt.
pub const DEFAULT_INITIAL_REOPEN_WAIT: Duration = Duration::from_secs(2);

/// Default cap on the wait between reopen attempts.
pub const DEFAULT_MAX_REOPEN_WAIT: Duration = Duration::from_secs(120);

/// Reopen policy consulted when a transport closes.
///
/// Returning `None` from a wait hook stops reopening.
pub trait TransportMonitor: Send + Sync {
    /// The transport was closed on request.
    fn on_closed_cleanly(&self);

    /// The transport went down on its own. Returns the wait before the first
    /// reopen attempt.
    fn on_closed_uncleanly(&self, cause: &FrugalError) -> Option<Duration>;

    /// Reopen attempt number `prev_attempts` failed after waiting
    /// `prev_wait`. Returns the wait before the next attempt.
    fn on_reopen_failed(&self, prev_attempts: u32, prev_wait: Duration) -> Option<Duration>;

    /// The transport was reopened.
    fn on_reopen_succeeded(&self);
}

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct BaseMonitor {
    max_attempts: u32,
    initial_wait: Duration,
    max_wait: Duration,
}

impl BaseMonitor {
    pub fn new(max_attempts: u32, initial_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            initial_wait,
            max_wait,
        }
    }

    /// Set the number of reopen attempts. 0 disables reopening.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }
}

impl Default for BaseMonitor {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_REOPEN_ATTEMPTS,
            DEFAULT_INITIAL_REOPEN_WAIT,
            DEFAULT_MAX_REOPEN_WAIT,
        )
    }
}

impl TransportMonitor for BaseMonitor {
    fn on_closed_cleanly(&self) {
        tracing::info!("transport closed cleanly, not reopening");
    }

    fn on_closed_uncleanly(&self, cause: &FrugalError) -> Option<Duration> {
        if self.max_attempts == 0 {
            tracing::warn!(error = %cause, "transport closed uncleanly, reopening disabled");
            return None;
        }
        tracing::warn!(
            error = %cause,
            wait_ms = self.initial_wait.as_millis() as u64,
            "transport closed uncleanly, reopening"
        );
        Some(self.initial_wait)
    }

    fn on_reopen_failed(&self, prev_attempts: u32, prev_wait: Duration) -> Option<Duration> {
        if prev_attempts >= self.max_attempts {
            tracing::error!(attempts = prev_attempts, "giving up on reopening transport");
            return None;
        }
        let wait = prev_wait.saturating_mul(2).min(self.max_wait);
        tracing::info!(
            attempts = prev_attempts,
            wait_ms = wait.as_millis() as u64,
            "reopen failed, retrying"
        );
        Some(wait)
    }

    fn on_reopen_succeeded(&self) {
        tracing::info!("transport reopened");
    }
}

/// Applies a [`TransportMonitor`] to one transport.
#[derive(Clone)]
pub struct MonitorRunner {
    transport: Arc<dyn Transport>,
    monitor: Arc<dyn TransportMonitor>,
}

impl MonitorRunner {
    pub fn new(transport: Arc<dyn Transport>, monitor: Arc<dyn TransportMonitor>) -> Self {
        Self { transport, monitor }
    }

    /// React to one close event. Returns once the transport is reopened or
    /// the policy stops; never fails.
    pub async fn on_close(&self, cause: CloseCause) {
        let Some(cause) = cause else {
            self.monitor.on_closed_cleanly();
            return;
        };
        let Some(mut wait) = self.monitor.on_closed_uncleanly(&cause) else {
            return;
        };

        let mut attempts: u32 = 0;
        loop {
            tokio::time::sleep(wait).await;
            attempts += 1;
            match self.transport.open().await {
                // Someone else reopened it in the meantime.
                Ok(()) | Err(FrugalError::AlreadyOpen(_)) => {
                    self.monitor.on_reopen_succeeded();
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempts, error = %e, "failed to reopen transport");
                    match self.monitor.on_reopen_failed(attempts, wait) {
                        Some(next) => wait = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Watch the transport's close events on a dedicated task.
    ///
    /// The task ends when the transport's close channel is dropped.
    pub fn spawn(&self) -> JoinHandle<()> {
        let mut closed = self.transport.closed();
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                match closed.recv().await {
                    Ok(cause) => runner.on_close(cause).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "monitor missed close events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::registry::Registry;
    use crate::transport::CloseNotifier;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    /// Transport whose `open` fails a fixed number of times.
    struct Flaky {
        failures: u32,
        opens: AtomicU32,
        notifier: CloseNotifier,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                opens: AtomicU32::new(0),
                notifier: CloseNotifier::new(),
            })
        }
    }

    #[async_trait]
    impl Transport for Flaky {
        fn is_open(&self) -> bool {
            false
        }

        async fn open(&self) -> Result<()> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(FrugalError::NotOpen("bus down".into()))
            } else {
                Ok(())
            }
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn set_registry(&self, _registry: Arc<dyn Registry>) {}

        fn set_high_watermark(&self, _watermark: Duration) {}

        fn write(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }

        fn closed(&self) -> broadcast::Receiver<CloseCause> {
            self.notifier.subscribe()
        }
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
        inner: BaseMonitor,
    }

    impl TransportMonitor for Recording {
        fn on_closed_cleanly(&self) {
            self.events.lock().push("clean".into());
        }

        fn on_closed_uncleanly(&self, cause: &FrugalError) -> Option<Duration> {
            self.events.lock().push("unclean".into());
            self.inner.on_closed_uncleanly(cause)
        }

        fn on_reopen_failed(&self, prev_attempts: u32, prev_wait: Duration) -> Option<Duration> {
            let next = self.inner.on_reopen_failed(prev_attempts, prev_wait);
            self.events
                .lock()
                .push(format!("failed {} -> {:?}", prev_attempts, next));
            next
        }

        fn on_reopen_succeeded(&self) {
            self.events.lock().push("reopened".into());
        }
    }

    fn unclean() -> CloseCause {
        Some(Arc::new(FrugalError::Timeout("heartbeat".into())))
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let monitor = BaseMonitor::default();
        assert_eq!(
            monitor.on_closed_uncleanly(&FrugalError::Interrupted),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            monitor.on_reopen_failed(1, Duration::from_secs(2)),
            Some(Duration::from_secs(4))
        );
        assert_eq!(
            monitor.on_reopen_failed(5, Duration::from_secs(100)),
            Some(DEFAULT_MAX_REOPEN_WAIT)
        );
        assert_eq!(monitor.on_reopen_failed(60, Duration::from_secs(120)), None);
    }

    #[test]
    fn test_zero_attempts_disables_reopen() {
        let monitor = BaseMonitor::default().with_max_attempts(0);
        assert_eq!(monitor.on_closed_uncleanly(&FrugalError::Interrupted), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_does_not_reopen() {
        let transport = Flaky::new(0);
        let monitor = Arc::new(Recording::default());
        let runner = MonitorRunner::new(transport.clone(), monitor.clone());

        runner.on_close(None).await;

        assert_eq!(*monitor.events.lock(), vec!["clean"]);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_after_failures() {
        let transport = Flaky::new(2);
        let monitor = Arc::new(Recording::default());
        let runner = MonitorRunner::new(transport.clone(), monitor.clone());

        runner.on_close(unclean()).await;

        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
        assert_eq!(
            *monitor.events.lock(),
            vec![
                "unclean".to_string(),
                "failed 1 -> Some(4s)".to_string(),
                "failed 2 -> Some(8s)".to_string(),
                "reopened".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let transport = Flaky::new(u32::MAX);
        let monitor = Arc::new(Recording {
            events: Mutex::new(Vec::new()),
            inner: BaseMonitor::default().with_max_attempts(3),
        });
        let runner = MonitorRunner::new(transport.clone(), monitor.clone());

        runner.on_close(unclean()).await;

        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.events.lock().last().map(String::as_str), Some("failed 3 -> None"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_reopens_once() {
        let transport = Flaky::new(u32::MAX);
        let monitor = Arc::new(
            BaseMonitor::default()
                .with_initial_wait(Duration::from_millis(100))
                .with_max_attempts(1),
        );
        let runner = MonitorRunner::new(transport.clone(), monitor);

        let started = tokio::time::Instant::now();
        runner.on_close(unclean()).await;

        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_runner_reacts_to_close_events() {
        let transport = Flaky::new(0);
        let monitor = Arc::new(Recording::default());
        let runner = MonitorRunner::new(transport.clone(), monitor.clone());
        let task = runner.spawn();

        transport.notifier.notify(unclean());
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(*monitor.events.lock(), vec!["unclean", "reopened"]);
        task.abort();
    }
}
