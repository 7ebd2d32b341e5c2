//! High-watermark tracking for inbound frame processing.
//!
//! Transports stamp each inbound frame with its arrival time. When the
//! registry is handed a frame later than the high watermark allows, the
//! overload is logged and counted. Frames are never dropped or throttled.
//!
//! # Configuration
//!
//! - High watermark: longest acceptable queueing delay (default: 5s)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default high watermark.
pub const DEFAULT_HIGH_WATERMARK: Duration = Duration::from_secs(5);

/// Queueing-delay monitor shared between a transport and its dispatch task.
///
/// Uses atomics so the watermark can be changed while frames are in flight.
#[derive(Debug)]
pub struct Watermark {
    high_watermark_us: AtomicU64,
    overloads: AtomicU64,
}

impl Watermark {
    /// Create a watermark with the given threshold.
    pub fn new(high_watermark: Duration) -> Self {
        Self {
            high_watermark_us: AtomicU64::new(high_watermark.as_micros() as u64),
            overloads: AtomicU64::new(0),
        }
    }

    /// Change the threshold. Takes effect for the next frame checked.
    pub fn set(&self, high_watermark: Duration) {
        self.high_watermark_us
            .store(high_watermark.as_micros() as u64, Ordering::Release);
    }

    /// Current threshold.
    #[inline]
    pub fn get(&self) -> Duration {
        Duration::from_micros(self.high_watermark_us.load(Ordering::Acquire))
    }

    /// Check the delay of a frame that arrived at `arrived`.
    ///
    /// Returns `true` (and bumps the overload counter) when the delay
    /// exceeds the threshold.
    pub fn check(&self, arrived: Instant) -> bool {
        let waited = arrived.elapsed();
        let limit = self.get();
        if waited <= limit {
            return false;
        }
        self.overloads.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            waited_ms = waited.as_millis() as u64,
            high_watermark_ms = limit.as_millis() as u64,
            "frame exceeded high watermark before processing"
        );
        true
    }

    /// Number of frames that exceeded the watermark.
    #[inline]
    pub fn overload_count(&self) -> u64 {
        self.overloads.load(Ordering::Relaxed)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATERMARK)
    }
}
