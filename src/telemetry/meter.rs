//! Request and drop rate metering.
//!
//! `RateMeter` reports an exponentially weighted events-per-second rate
//! over fixed sampling windows (1 s by default). Under a sustained steady
//! input rate the reported value converges to within a few percent of the
//! true rate after five windows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Smoothing factor per elapsed window.
const ALPHA: f64 = 0.5;

struct MeterState {
    window_start: Instant,
    count: u64,
    rate: f64,
}

/// Windowed EWMA rate meter.
pub struct RateMeter {
    window: Duration,
    state: Mutex<MeterState>,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(MeterState {
                window_start: Instant::now(),
                count: 0,
                rate: 0.0,
            }),
        }
    }

    /// Record one event at `now`.
    pub fn record(&self, now: Instant) {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.count += 1;
    }

    /// Current smoothed events-per-second rate.
    pub fn rate(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.rate
    }

    /// Fold every fully elapsed window into the smoothed rate.
    fn roll(&self, state: &mut MeterState, now: Instant) {
        let secs = self.window.as_secs_f64();
        while now.duration_since(state.window_start) >= self.window {
            let window_rate = state.count as f64 / secs;
            state.rate = ALPHA * window_rate + (1.0 - ALPHA) * state.rate;
            state.count = 0;
            state.window_start += self.window;
        }
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free f64 gauge (bits stored in an `AtomicU64`).
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self { bits: AtomicU64::new(f64::to_bits(0.0)) }
    }

    pub fn set(&self, value: f64) {
        self.bits.store(f64::to_bits(value), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_rate_converges_within_five_windows() {
        let meter = RateMeter::with_window(Duration::from_millis(100));
        let start = Instant::now();
        // 50 events per window of 0.1 s => 500 events/s.
        for w in 0..5u64 {
            for i in 0..50u64 {
                let t = start + Duration::from_millis(w * 100 + i * 2);
                meter.record(t);
            }
        }
        let reported = meter.rate(start + Duration::from_millis(500));
        let true_rate = 500.0;
        assert!(
            (reported - true_rate).abs() / true_rate <= 0.1,
            "reported {reported}, want within 10% of {true_rate}"
        );
    }

    #[test]
    fn idle_windows_decay_the_rate() {
        let meter = RateMeter::with_window(Duration::from_millis(100));
        let start = Instant::now();
        for i in 0..50u64 {
            meter.record(start + Duration::from_millis(i));
        }
        let busy = meter.rate(start + Duration::from_millis(100));
        let idle = meter.rate(start + Duration::from_millis(800));
        assert!(idle < busy / 4.0, "rate should decay: busy={busy} idle={idle}");
    }

    #[test]
    fn gauge_stores_floats() {
        let gauge = Gauge::new();
        assert_eq!(gauge.get(), 0.0);
        gauge.set(0.85);
        assert!((gauge.get() - 0.85).abs() < f64::EPSILON);
    }
}
