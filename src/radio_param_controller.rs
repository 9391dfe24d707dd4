//! C10: temporary radio-parameter override with guaranteed revert.

use crate::radio::RadioParams;

struct Pending {
    new_params: RadioParams,
    apply_at_ms: u64,
    revert_at_ms: u64,
    applied: bool,
}

/// Grace window before the new parameters take effect, long enough for the
/// response packet carrying them to be sent under the old parameters first.
pub const APPLY_GRACE_MS: u64 = 2_000;

pub struct RadioParamController {
    persisted: RadioParams,
    pending: Option<Pending>,
}

impl RadioParamController {
    pub fn new(persisted: RadioParams) -> Self {
        Self { persisted, pending: None }
    }

    pub fn persisted(&self) -> RadioParams {
        self.persisted
    }

    /// Updates the persisted baseline (e.g. after an admin command commits
    /// new defaults), unrelated to any in-flight temporary override.
    pub fn set_persisted(&mut self, params: RadioParams) {
        self.persisted = params;
    }

    pub fn apply_temp(&mut self, params: RadioParams, timeout_mins: u32, now_ms: u64) {
        let apply_at_ms = now_ms + APPLY_GRACE_MS;
        let revert_at_ms = apply_at_ms + timeout_mins as u64 * 60_000;
        self.pending = Some(Pending { new_params: params, apply_at_ms, revert_at_ms, applied: false });
    }

    /// A cancel before apply simply clears both timers.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns the params that should now be pushed to the radio driver, if
    /// either deadline has just elapsed.
    pub fn poll(&mut self, now_ms: u64) -> Option<RadioParams> {
        let pending = self.pending.as_mut()?;
        if !pending.applied && now_ms >= pending.apply_at_ms {
            pending.applied = true;
            return Some(pending.new_params);
        }
        if pending.applied && now_ms >= pending.revert_at_ms {
            let persisted = self.persisted;
            self.pending = None;
            return Some(persisted);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(freq: f32) -> RadioParams {
        RadioParams { freq_mhz: freq, bandwidth_khz: 125.0, spreading_factor: 9, coding_rate: 5 }
    }

    #[test]
    fn apply_then_revert_timeline() {
        let mut c = RadioParamController::new(params(868.0));
        c.apply_temp(params(868.1), 1, 0);

        assert_eq!(c.poll(1_000), None);
        assert_eq!(c.poll(2_000), Some(params(868.1)));
        assert_eq!(c.poll(2_500), None);
        assert_eq!(c.poll(62_000), Some(params(868.0)));
        assert_eq!(c.poll(70_000), None);
    }

    #[test]
    fn cancel_before_apply_clears_both_timers() {
        let mut c = RadioParamController::new(params(868.0));
        c.apply_temp(params(868.1), 1, 0);
        c.cancel();
        assert_eq!(c.poll(2_000), None);
        assert_eq!(c.poll(62_000), None);
        assert!(!c.has_pending());
    }
}
