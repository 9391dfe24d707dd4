//! C1: monotonic millisecond timer, wall-clock time, `unique_now`, and RNG.

use embassy_time::Instant;
use rand::RngCore;
use rand::rngs::OsRng;
use std::sync::Mutex;

/// Monotonic millisecond timer plus a wall-clock source with a
/// never-repeats-in-session `unique_now`.
pub struct Clock {
    start: Instant,
    /// Last wall-clock second handed out by `unique_now`, bumped by one
    /// whenever the raw clock would otherwise repeat.
    last_unique: Mutex<u32>,
}

impl Clock {
    pub fn new() -> Self {
        Self { start: Instant::now(), last_unique: Mutex::new(0) }
    }

    /// Milliseconds since this `Clock` was constructed (process/session start).
    pub fn monotonic_ms(&self) -> u64 {
        Instant::now().duration_since(self.start).as_millis()
    }

    /// Current wall-clock time as Unix seconds.
    pub fn wall_now(&self) -> u32 {
        chrono::Utc::now().timestamp() as u32
    }

    /// A wall-clock-seeded value guaranteed to never repeat within this
    /// session: if the raw wall clock has not advanced since the last call,
    /// the previous value is incremented by one instead.
    pub fn unique_now(&self) -> u32 {
        let raw = self.wall_now();
        let mut last = self.last_unique.lock().unwrap();
        let next = if raw > *last { raw } else { *last + 1 };
        *last = next;
        next
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Cryptographic RNG, used for login-response nonces and backoff jitter where
/// unpredictability (rather than just distribution) matters.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_u32() -> u32 {
    OsRng.next_u32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_now_never_repeats_in_session() {
        let clock = Clock::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            let v = clock.unique_now();
            assert!(seen.insert(v), "unique_now repeated a value: {v}");
        }
    }

    #[test]
    fn monotonic_ms_is_non_decreasing() {
        let clock = Clock::new();
        let a = clock.monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }
}
