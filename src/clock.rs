//! The tick counter records are stamped with.
//!
//! One tick per sampling period. The logging task reads the clock when it dequeues a sample, so
//! the stored time index is the dequeue time, which trails the sensor read by at most the queue
//! latency.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use novafc_data_format::TimeIndex;

use crate::error::StartupError;

#[derive(Debug, Default)]
pub struct SampleClock {
    ticks: AtomicU32,
}

impl SampleClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by one tick and returns the new time index
    pub fn tick(&self) -> TimeIndex {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        TimeIndex::from_ticks(ticks)
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn now(&self) -> TimeIndex {
        TimeIndex::from_ticks(self.ticks())
    }
}

/// Drives a [`SampleClock`] from a thread at a fixed rate. Stops when dropped
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(clock: Arc<SampleClock>, rate_hz: u16) -> Result<Self, StartupError> {
        let period = Duration::from_secs(1) / u32::from(rate_hz.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("sample-clock".into())
            .spawn(move || {
                debug!("sample clock ticking every {period:?}");
                let mut next = Instant::now() + period;
                while !thread_stop.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if now < next {
                        thread::sleep(next - now);
                    }
                    clock.tick();
                    next += period;
                }
            })
            .map_err(|source| StartupError::Spawn {
                name: "sample-clock",
                source,
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sample clock thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use novafc_data_format::TIME_INDEX_MODULUS;

    use super::*;

    #[test]
    fn ticks_wrap_into_time_index() {
        let clock = SampleClock::new();
        assert_eq!(clock.now().get(), 0);
        assert_eq!(clock.tick().get(), 1);
        for _ in 1..TIME_INDEX_MODULUS {
            clock.tick();
        }
        assert_eq!(clock.ticks(), TIME_INDEX_MODULUS);
        assert_eq!(clock.now().get(), 0);
    }

    #[test]
    fn ticker_advances_clock() {
        let clock = Arc::new(SampleClock::new());
        let mut ticker = Ticker::spawn(Arc::clone(&clock), 1000).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while clock.ticks() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        ticker.stop();
        let stopped_at = clock.ticks();
        assert!(stopped_at >= 5);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.ticks(), stopped_at);
    }
}
