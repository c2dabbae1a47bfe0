//! Frame counters and processing-time profile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct AfeStats {
    frames_fed: AtomicU64,
    frames_processed: AtomicU64,
    push_failures: AtomicU64,
    process_total_us: AtomicU64,
    process_peak_us: AtomicU64,
}

impl AfeStats {
    pub fn frame_fed(&self) {
        self.frames_fed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_failed(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_failures(&self) -> u64 {
        self.push_failures.load(Ordering::Relaxed)
    }

    pub fn frame_processed(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.process_total_us.fetch_add(us, Ordering::Relaxed);
        self.process_peak_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_fed: self.frames_fed.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            process_total_us: self.process_total_us.load(Ordering::Relaxed),
            process_peak_us: self.process_peak_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_fed: u64,
    pub frames_processed: u64,
    pub push_failures: u64,
    pub process_total_us: u64,
    pub process_peak_us: u64,
}

impl StatsSnapshot {
    pub fn average_process_us(&self) -> u64 {
        self.process_total_us
            .checked_div(self.frames_processed)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_tracks_average_and_peak() {
        let stats = AfeStats::default();
        assert_eq!(stats.snapshot().average_process_us(), 0);
        stats.frame_processed(Duration::from_micros(100));
        stats.frame_processed(Duration::from_micros(300));
        stats.frame_fed();
        stats.push_failed();
        let s = stats.snapshot();
        assert_eq!(s.frames_processed, 2);
        assert_eq!(s.average_process_us(), 200);
        assert_eq!(s.process_peak_us, 300);
        assert_eq!(s.frames_fed, 1);
        assert_eq!(s.push_failures, 1);
    }
}
