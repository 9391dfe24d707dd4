//! The physical radio driver is an external collaborator (spec.md §1); this
//! module only specifies its contract towards the core.

use embassy_time::Duration;

/// Radio parameters that can be temporarily overridden (C10) and persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioParams {
    pub freq_mhz: f32,
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
}

/// A frame queued for transmission, with an absolute "release-at" timestamp
/// (§9 Design Notes: delays are explicit release-at timestamps, not an
/// implicit coroutine sleep).
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub payload: Vec<u8>,
    pub release_at_ms: u64,
}

/// Contract the radio driver exposes to the core. Implementations live
/// outside this crate (bare-metal LoRa HAL, simulator, test double).
pub trait RadioDriver: Send {
    /// Estimated on-air time for `byte_len` bytes at the current modulation
    /// parameters.
    fn est_airtime(&self, byte_len: usize) -> Duration;

    /// Queues a frame for transmission at its `release_at_ms` deadline. The
    /// driver may send slightly late if a parameter change is pending (the
    /// 2-second grace window in §9 "Cancellation").
    fn enqueue_tx(&mut self, req: TxRequest);

    fn current_params(&self) -> RadioParams;

    /// Applies new parameters; used by both "apply-at" and "revert-at" of
    /// the temp radio-parameter controller.
    fn set_params(&mut self, params: RadioParams);

    /// Tells the driver what fraction of the duty cycle this node may use.
    fn set_airtime_factor(&mut self, factor: f32);
}
