//! Per-consumer pacing for frame streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest single sleep, so a stop request is noticed promptly.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Upper bound on the gap between two returns, whatever rate was asked for.
pub const MAX_INTERVAL: Duration = Duration::from_secs(100);

/// Effective stream rate: the lower of the two bounds, where 0 disables a bound.
/// `None` means unlimited.
pub fn target_fps(max_feed_fps: f64, capture_fps: f64) -> Option<f64> {
    let bounds = [max_feed_fps, capture_fps];
    bounds
        .into_iter()
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .reduce(f64::min)
}

fn frame_interval(fps: Option<f64>) -> Duration {
    match fps {
        Some(fps) => Duration::try_from_secs_f64(1.0 / fps)
            .map(|interval| interval.min(MAX_INTERVAL))
            .unwrap_or(MAX_INTERVAL),
        None => Duration::ZERO,
    }
}

/// Paces one stream consumer. Owned by that consumer; never shared.
pub struct RateLimiter {
    interval: Duration,
    last: Instant,
    stop: Arc<AtomicBool>,
}

impl RateLimiter {
    pub fn new(max_feed_fps: f64, capture_fps: f64, stop: Arc<AtomicBool>) -> Self {
        Self {
            interval: frame_interval(target_fps(max_feed_fps, capture_fps)),
            last: Instant::now(),
            stop,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps until one interval has passed since the previous return. Returns `false` as soon
    /// as the stream has been stopped.
    pub fn should_continue(&mut self) -> bool {
        let due = self.last + self.interval;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= due {
                self.last = now;
                return true;
            }
            std::thread::sleep((due - now).min(STOP_POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn returns_within(window: Duration, fps: f64) -> u32 {
        let mut limiter = RateLimiter::new(fps, 0.0, Arc::new(AtomicBool::new(false)));
        let started = Instant::now();
        let mut count = 0;
        while started.elapsed() < window {
            if limiter.should_continue() && started.elapsed() <= window {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn returns_at_most_target_rate() {
        for fps in [1.0, 5.0, 30.0] {
            // Enough room for a few intervals plus scheduling slack.
            let window = Duration::from_secs_f64(3.0 / fps + 0.05);
            let allowed = (window.as_secs_f64() * fps).floor() as u32;
            let count = returns_within(window, fps);
            assert!(count <= allowed, "fps={} returned {} times, allowed {}", fps, count, allowed);
            assert!(count >= 1, "fps={} never returned", fps);
        }
    }

    #[test]
    fn tiny_rates_are_capped() {
        let stop = Arc::new(AtomicBool::new(false));
        for fps in [1e-300, f64::MIN_POSITIVE, 1e-9] {
            let limiter = RateLimiter::new(fps, 0.0, stop.clone());
            assert_eq!(limiter.interval(), MAX_INTERVAL, "fps={}", fps);
        }
        assert_eq!(
            RateLimiter::new(0.1, 0.0, stop).interval(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn target_is_lower_nonzero_bound() {
        assert_eq!(target_fps(5.0, 30.0), Some(5.0));
        assert_eq!(target_fps(30.0, 12.5), Some(12.5));
        assert_eq!(target_fps(0.0, 12.5), Some(12.5));
        assert_eq!(target_fps(5.0, 0.0), Some(5.0));
        assert_eq!(target_fps(0.0, 0.0), None);
    }

    #[test]
    fn unlimited_returns_immediately() {
        let mut limiter = RateLimiter::new(0.0, 0.0, Arc::new(AtomicBool::new(false)));
        assert_eq!(limiter.interval(), Duration::ZERO);
        let started = Instant::now();
        for _ in 0..100 {
            assert!(limiter.should_continue());
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_interrupts_wait() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut limiter = RateLimiter::new(0.1, 0.0, stop.clone());
        let flag = stop.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            flag.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        assert!(!limiter.should_continue());
        stopper.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
