//! Frame-rate measurement and a fixed-interval background timer.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Frames per second over a sliding window of recent ticks.
pub struct FpsCounter {
    window: Duration,
    ticks: VecDeque<Instant>,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ticks: VecDeque::new(),
        }
    }

    pub fn tick_at(&mut self, now: Instant) {
        self.ticks.push_back(now);
        while let Some(&oldest) = self.ticks.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.ticks.front(), self.ticks.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.ticks.len() - 1) as f64 / span
    }
}

/// Runs a callback on its own thread every `interval` until stopped.
pub struct RepeatedTimer {
    name: String,
    stop_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl RepeatedTimer {
    pub fn start<F>(name: &str, interval: Duration, mut task: F) -> anyhow::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            stop_tx,
            join: Some(join),
        })
    }

    /// Stops the timer and waits for a running callback to finish. Join failures are logged.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("timer '{}' thread panicked", self.name);
            }
        }
    }
}
