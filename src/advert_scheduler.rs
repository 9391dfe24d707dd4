//! C9: periodic self-advertisement, runtime-updatable.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertKind {
    Local,
    Flood,
}

pub struct AdvertScheduler {
    /// Stored in firmware units of 2 minutes; 0 disables.
    local_interval_units: u32,
    /// Hours; 0 disables.
    flood_interval_hours: u32,
    next_local_ms: Option<u64>,
    next_flood_ms: Option<u64>,
}

impl AdvertScheduler {
    pub fn new(local_interval_units: u32, flood_interval_hours: u32, now_ms: u64) -> Self {
        let mut s = Self { local_interval_units: 0, flood_interval_hours: 0, next_local_ms: None, next_flood_ms: None };
        s.set_intervals(local_interval_units, flood_interval_hours, now_ms);
        s
    }

    fn local_period_ms(&self) -> u64 {
        self.local_interval_units as u64 * 2 * 60_000
    }

    fn flood_period_ms(&self) -> u64 {
        self.flood_interval_hours as u64 * 3_600_000
    }

    /// Runtime-updatable: rearms timers relative to `now_ms`.
    pub fn set_intervals(&mut self, local_interval_units: u32, flood_interval_hours: u32, now_ms: u64) {
        self.local_interval_units = local_interval_units;
        self.flood_interval_hours = flood_interval_hours;
        self.next_local_ms = if local_interval_units == 0 { None } else { Some(now_ms + self.local_period_ms()) };
        self.next_flood_ms = if flood_interval_hours == 0 { None } else { Some(now_ms + self.flood_period_ms()) };
    }

    /// Returns the advert to emit, if any timer has expired as of `now_ms`.
    /// When both expire simultaneously, flood takes priority and the local
    /// timer is re-armed so the two do not coincide on the next round.
    pub fn poll(&mut self, now_ms: u64) -> Option<AdvertKind> {
        let flood_due = self.next_flood_ms.is_some_and(|t| now_ms >= t);
        let local_due = self.next_local_ms.is_some_and(|t| now_ms >= t);

        if flood_due {
            self.next_flood_ms = Some(now_ms + self.flood_period_ms());
            if local_due {
                self.next_local_ms = Some(now_ms + self.local_period_ms());
            }
            return Some(AdvertKind::Flood);
        }
        if local_due {
            self.next_local_ms = Some(now_ms + self.local_period_ms());
            return Some(AdvertKind::Local);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_interval_zero() {
        let mut s = AdvertScheduler::new(0, 0, 0);
        assert_eq!(s.poll(1_000_000_000), None);
    }

    #[test]
    fn local_fires_at_period() {
        let mut s = AdvertScheduler::new(1, 0, 0); // 2 minutes
        assert_eq!(s.poll(119_999), None);
        assert_eq!(s.poll(120_000), Some(AdvertKind::Local));
    }

    #[test]
    fn flood_takes_priority_and_rearms_local() {
        let mut s = AdvertScheduler::new(1, 1, 0); // local=2min, flood=1h
        // Advance past both deadlines simultaneously.
        let both_due = 3_600_000;
        assert_eq!(s.poll(both_due), Some(AdvertKind::Flood));
        // local should not fire again immediately; it was re-armed.
        assert_eq!(s.poll(both_due), None);
        assert_eq!(s.poll(both_due + 120_000), Some(AdvertKind::Local));
    }
}
