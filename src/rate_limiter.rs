//! C6: token-bucket-shaped "at most N events per W seconds" limiter.
//!
//! Implements the fixed-window interpretation (§9 Open Questions: "test the
//! fixed-window interpretation first"): a window resets wholesale once `W`
//! seconds have elapsed since it opened, rather than sliding continuously.

pub struct RateLimiter {
    max_events: u32,
    window_secs: u32,
    window_start: u32,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_events: u32, window_secs: u32) -> Self {
        Self { max_events, window_secs, window_start: 0, count: 0 }
    }

    pub fn allow(&mut self, now_wall_time: u32) -> bool {
        if now_wall_time.saturating_sub(self.window_start) >= self.window_secs {
            self.window_start = now_wall_time;
            self.count = 0;
        }
        if self.count < self.max_events {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_n_then_blocks_within_window() {
        let mut rl = RateLimiter::new(4, 120);
        for _ in 0..4 {
            assert!(rl.allow(1000));
        }
        assert!(!rl.allow(1000));
        assert!(!rl.allow(1050));
    }

    #[test]
    fn window_resets_after_w_seconds() {
        let mut rl = RateLimiter::new(4, 120);
        for _ in 0..4 {
            assert!(rl.allow(1000));
        }
        assert!(!rl.allow(1100));
        assert!(rl.allow(1120));
    }

    proptest::proptest! {
        #[test]
        fn never_exceeds_n_within_a_window(n in 1u32..20, w in 1u32..300) {
            let mut rl = RateLimiter::new(n, w);
            let start = 10_000u32;
            let mut allowed = 0;
            for i in 0..(n * 3) {
                if rl.allow(start + i.min(w.saturating_sub(1))) {
                    allowed += 1;
                }
            }
            assert!(allowed <= n);
        }
    }
}
