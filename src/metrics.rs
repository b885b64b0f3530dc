//! Timing metrics of the localization loop.
//!
//! A [`Metrics`] handle is created by the owner and passed into each
//! orchestrator; clones share the same stopwatches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// From service start to the first success of a not yet localized tracking.
pub const FULL_LOCALIZATION: &str = "FullLocalization";
/// Time spent waiting for the angle gate.
pub const TOTAL_WAITING: &str = "TotalWaiting";
/// Feature extraction plus global descriptor.
pub const TOTAL_INFERENCE: &str = "TotalInference";
/// Network round trip of one request.
pub const REQUEST: &str = "Request";

#[derive(Debug, Default, Clone, Copy)]
struct Stopwatch {
    started: Option<Instant>,
    elapsed: Duration,
}

impl Stopwatch {
    fn elapsed(&self) -> Duration {
        match self.started {
            Some(at) => self.elapsed + at.elapsed(),
            None => self.elapsed,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    stopwatches: HashMap<&'static str, Stopwatch>,
    attempts: u32,
}

/// Shared handle to named stopwatches and the attempt counter.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<Inner>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    /// Restart the stopwatch `key` from zero.
    pub fn start(&self, key: &'static str) {
        self.with(|m| {
            m.stopwatches.insert(
                key,
                Stopwatch {
                    started: Some(Instant::now()),
                    elapsed: Duration::ZERO,
                },
            );
        });
    }

    /// Stop `key` and log its reading. Unknown keys read as zero.
    pub fn stop(&self, key: &'static str) -> Duration {
        let elapsed = self.with(|m| match m.stopwatches.get_mut(key) {
            Some(sw) => {
                sw.elapsed = sw.elapsed();
                sw.started = None;
                sw.elapsed
            }
            None => Duration::ZERO,
        });
        log::trace!("[Metric] {} {:.10}", key, elapsed.as_secs_f64());
        elapsed
    }

    /// Current reading of `key`, running or not.
    pub fn elapsed(&self, key: &'static str) -> Duration {
        self.with(|m| {
            m.stopwatches
                .get(key)
                .map(Stopwatch::elapsed)
                .unwrap_or(Duration::ZERO)
        })
    }

    pub fn record_attempt(&self) -> u32 {
        self.with(|m| {
            m.attempts += 1;
            m.attempts
        })
    }

    pub fn reset_attempts(&self) {
        self.with(|m| m.attempts = 0);
    }

    pub fn attempts(&self) -> u32 {
        self.with(|m| m.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwatch_freezes_on_stop() {
        let metrics = Metrics::new();
        metrics.start(REQUEST);
        std::thread::sleep(Duration::from_millis(5));
        let stopped = metrics.stop(REQUEST);
        assert!(stopped >= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(metrics.elapsed(REQUEST), stopped);
    }

    #[test]
    fn test_unknown_key_reads_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.stop(TOTAL_INFERENCE), Duration::ZERO);
    }

    #[test]
    fn test_clones_share_state() {
        let metrics = Metrics::new();
        let other = metrics.clone();
        metrics.record_attempt();
        other.record_attempt();
        assert_eq!(metrics.attempts(), 2);
        other.reset_attempts();
        assert_eq!(metrics.attempts(), 0);
    }
}
