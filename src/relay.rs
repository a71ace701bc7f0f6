//! Single-slot "latest frame" relay between the detect loop and stream consumers.
//!
//! The producer overwrites the slot and never blocks on consumers. Each consumer holds a
//! `RelayReader` with its own cursor, so reads never consume a frame for anybody else.
//! Frames that nobody read before the next publish are dropped.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::frame::Frame;

#[derive(Default)]
struct Slot {
    frame: Option<Arc<Frame>>,
    /// Incremented on every publish; 0 means nothing was published yet.
    generation: u64,
}

#[derive(Default)]
pub struct FrameRelay {
    slot: Mutex<Slot>,
    fresh: Condvar,
}

impl FrameRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // A poisoned slot still holds a consistent `Option<Arc<Frame>>`; keep serving it.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the current frame. Never waits on readers.
    pub fn publish(&self, frame: Frame) {
        {
            let mut slot = self.lock();
            slot.frame = Some(Arc::new(frame));
            slot.generation += 1;
        }
        self.fresh.notify_all();
    }

    /// Latest frame regardless of what any reader has seen.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// New independent consumer. It sees the current frame (if any) on its first take.
    pub fn reader(self: &Arc<Self>) -> RelayReader {
        RelayReader {
            relay: Arc::clone(self),
            seen: 0,
        }
    }
}

/// Consumer cursor over a `FrameRelay`.
pub struct RelayReader {
    relay: Arc<FrameRelay>,
    seen: u64,
}

impl RelayReader {
    /// Latest frame if one was published since this reader's last take.
    pub fn take(&mut self) -> Option<Arc<Frame>> {
        let slot = self.relay.lock();
        take_from(&mut self.seen, &slot)
    }

    /// Like `take`, but waits up to `timeout` for a fresh frame.
    pub fn wait_take(&mut self, timeout: Duration) -> Option<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.relay.lock();
        loop {
            if slot.generation > self.seen {
                return take_from(&mut self.seen, &slot);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = match self.relay.fresh.wait_timeout(slot, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

fn take_from(seen: &mut u64, slot: &Slot) -> Option<Arc<Frame>> {
    if slot.generation <= *seen {
        return None;
    }
    *seen = slot.generation;
    slot.frame.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(sequence: u64) -> Frame {
        Frame::filled(4, 4, [sequence as u8, 0, 0], sequence)
    }

    #[test]
    fn take_before_publish_is_not_available() {
        let relay = FrameRelay::new();
        let mut reader = relay.reader();
        assert!(reader.take().is_none());
        assert!(relay.latest().is_none());
    }

    #[test]
    fn latest_publish_wins() {
        let relay = FrameRelay::new();
        let mut reader = relay.reader();
        relay.publish(frame(1));
        relay.publish(frame(2));
        assert_eq!(reader.take().unwrap().sequence, 2);
        assert!(reader.take().is_none());
    }

    #[test]
    fn readers_are_independent() {
        let relay = FrameRelay::new();
        let mut a = relay.reader();
        let mut b = relay.reader();
        relay.publish(frame(7));
        assert_eq!(a.take().unwrap().sequence, 7);
        assert_eq!(b.take().unwrap().sequence, 7);
        assert!(a.take().is_none());
        relay.publish(frame(8));
        assert_eq!(a.take().unwrap().sequence, 8);
        assert_eq!(relay.latest().unwrap().sequence, 8);
    }

    #[test]
    fn wait_take_wakes_on_publish() {
        let relay = FrameRelay::new();
        let mut reader = relay.reader();
        let producer = {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                relay.publish(frame(3));
            })
        };
        let got = reader.wait_take(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(got.unwrap().sequence, 3);
    }

    #[test]
    fn wait_take_times_out_without_publish() {
        let relay = FrameRelay::new();
        let mut reader = relay.reader();
        let started = Instant::now();
        assert!(reader.wait_take(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn publisher_never_blocks_on_idle_readers() {
        let relay = FrameRelay::new();
        let _idle = relay.reader();
        for i in 0..1000 {
            relay.publish(frame(i));
        }
        assert_eq!(relay.generation(), 1000);
    }
}
